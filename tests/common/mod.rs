//! Shared fixtures for the integration tests: an in-memory CloudFormation and template
//! builders.

#![allow(dead_code)]

use async_trait::async_trait;
use cdk_refactor::app::aws_client::{
    CloudFormationApi, DefaultEnvironment, StackSummary, ToolkitInfo,
};
use cdk_refactor::app::cfn_template::CloudFormationTemplate;
use cdk_refactor::app::refactor::environment::{CloudFormationStack, Environment};
use cdk_refactor::app::refactor::error::{RefactorError, RefactorResult};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

pub const ACCOUNT: &str = "123456789012";
pub const REGION: &str = "us-east-1";

pub fn env() -> Environment {
    Environment::new(ACCOUNT, REGION)
}

/// An object written through [`CloudFormationApi::upload_object`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub environment: Environment,
    pub bucket: String,
    pub key: String,
    pub size: usize,
}

/// In-memory stand-in for CloudFormation, S3 and STS.
#[derive(Default)]
pub struct FakeCloudFormation {
    pub default_environment: DefaultEnvironment,
    deployed: BTreeMap<Environment, BTreeMap<String, String>>,
    toolkits: BTreeMap<Environment, ToolkitInfo>,
    failing: BTreeSet<Environment>,
    unreadable: BTreeSet<(Environment, String)>,
    hanging: BTreeSet<Environment>,
    uploads: Mutex<Vec<Upload>>,
    calls: Mutex<Vec<String>>,
}

impl FakeCloudFormation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deploy a stack with the given template body.
    pub fn with_stack(mut self, environment: &Environment, stack_name: &str, template: Value) -> Self {
        self.deployed
            .entry(environment.clone())
            .or_default()
            .insert(stack_name.to_string(), template.to_string());
        self
    }

    /// Deploy a stack whose body is stored verbatim (YAML, broken content, ...).
    pub fn with_raw_stack(mut self, environment: &Environment, stack_name: &str, body: &str) -> Self {
        self.deployed
            .entry(environment.clone())
            .or_default()
            .insert(stack_name.to_string(), body.to_string());
        self
    }

    pub fn with_toolkit(mut self, environment: &Environment, bucket_name: &str) -> Self {
        self.toolkits.insert(
            environment.clone(),
            ToolkitInfo {
                bucket_name: bucket_name.to_string(),
                bucket_domain_name: None,
            },
        );
        self
    }

    /// List a stack whose `GetTemplate` comes back without a body.
    pub fn with_unreadable_stack(mut self, environment: &Environment, stack_name: &str) -> Self {
        self.deployed
            .entry(environment.clone())
            .or_default()
            .insert(stack_name.to_string(), String::new());
        self.unreadable
            .insert((environment.clone(), stack_name.to_string()));
        self
    }

    /// Every list call for this environment fails with a network error.
    pub fn failing(mut self, environment: &Environment) -> Self {
        self.failing.insert(environment.clone());
        self
    }

    /// Every list call for this environment never completes.
    pub fn hanging(mut self, environment: &Environment) -> Self {
        self.hanging.insert(environment.clone());
        self
    }

    pub fn with_default_environment(mut self, account: &str, region: &str) -> Self {
        self.default_environment = DefaultEnvironment {
            account: Some(account.to_string()),
            region: Some(region.to_string()),
        };
        self
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl CloudFormationApi for FakeCloudFormation {
    async fn default_environment(&self) -> RefactorResult<DefaultEnvironment> {
        self.record("default_environment".to_string());
        Ok(self.default_environment.clone())
    }

    async fn list_stacks(&self, environment: &Environment) -> RefactorResult<Vec<StackSummary>> {
        self.record(format!("list_stacks {}", environment));
        if self.hanging.contains(environment) {
            std::future::pending::<()>().await;
        }
        if self.failing.contains(environment) {
            return Err(RefactorError::network(
                "ListStacks",
                anyhow::anyhow!("Access denied in {}", environment),
            ));
        }
        Ok(self
            .deployed
            .get(environment)
            .into_iter()
            .flatten()
            .map(|(name, _)| StackSummary {
                stack_name: name.clone(),
                stack_status: "CREATE_COMPLETE".to_string(),
            })
            .collect())
    }

    async fn get_template(
        &self,
        environment: &Environment,
        stack_name: &str,
    ) -> RefactorResult<String> {
        self.record(format!("get_template {} {}", environment, stack_name));
        if self
            .unreadable
            .contains(&(environment.clone(), stack_name.to_string()))
        {
            return Err(RefactorError::InvalidTemplate {
                stack_name: stack_name.to_string(),
                reason: "GetTemplate returned no template body".to_string(),
            });
        }
        self.deployed
            .get(environment)
            .and_then(|stacks| stacks.get(stack_name))
            .cloned()
            .ok_or_else(|| RefactorError::not_found(format!("Stack {}", stack_name), ""))
    }

    async fn lookup_toolkit(
        &self,
        environment: &Environment,
    ) -> RefactorResult<Option<ToolkitInfo>> {
        self.record(format!("lookup_toolkit {}", environment));
        Ok(self.toolkits.get(environment).cloned())
    }

    async fn upload_object(
        &self,
        environment: &Environment,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
    ) -> RefactorResult<()> {
        self.uploads.lock().unwrap().push(Upload {
            environment: environment.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: body.len(),
        });
        Ok(())
    }
}

/// A local stack, as read from a cloud assembly.
pub fn local_stack(environment: &Environment, name: &str, template: Value) -> CloudFormationStack {
    CloudFormationStack::new(
        name,
        environment.clone(),
        CloudFormationTemplate::from_value(template).unwrap(),
    )
}

/// A deployed stack, for the synchronous stages.
pub fn deployed_stack(environment: &Environment, name: &str, template: Value) -> CloudFormationStack {
    local_stack(environment, name, template)
}

/// A resource body with a construct path.
pub fn resource(resource_type: &str, properties: Value, path: &str) -> Value {
    json!({
        "Type": resource_type,
        "Properties": properties,
        "Metadata": { "aws:cdk:path": path }
    })
}

pub fn bucket(name: &str, path: &str) -> Value {
    resource("AWS::S3::Bucket", json!({ "BucketName": name }), path)
}

pub fn template(resources: Value) -> Value {
    json!({ "Resources": resources })
}

/// The `CDKMetadata` resource CDK adds to every stack.
pub fn cdk_metadata(analytics: &str) -> Value {
    json!({
        "Type": "AWS::CDK::Metadata",
        "Properties": { "Analytics": analytics },
        "Metadata": { "aws:cdk:path": "Stack/CDKMetadata/Default" }
    })
}
