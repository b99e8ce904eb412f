//! CloudFormation, S3 and STS access for the refactor engine.
//!
//! The engine never talks to AWS directly. Everything it needs from the cloud goes through
//! the [`CloudFormationApi`] trait:
//!
//! - resolving the default account and region for `unknown-account`/`unknown-region` stacks
//! - listing live stacks and fetching their templates
//! - finding the CDK toolkit staging bucket
//! - uploading oversized templates
//!
//! [`AwsSdkProvider`] implements the trait with the AWS SDK. Tests use in-memory fakes.

use crate::app::refactor::environment::Environment;
use crate::app::refactor::error::{RefactorError, RefactorResult};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_cloudformation as cfn;
use aws_sdk_cloudformation::error::ProvideErrorMetadata;
use aws_sdk_s3 as s3;
use aws_sdk_sts as sts;
use aws_types::region::Region;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Name of the stack `cdk bootstrap` deploys.
pub const TOOLKIT_STACK_NAME: &str = "CDKToolkit";

/// Stack statuses whose templates describe resources that currently exist.
pub const LIVE_STACK_STATUSES: &[&str] = &[
    "CREATE_COMPLETE",
    "UPDATE_COMPLETE",
    "UPDATE_ROLLBACK_COMPLETE",
    "IMPORT_COMPLETE",
    "IMPORT_ROLLBACK_COMPLETE",
    "ROLLBACK_COMPLETE",
];

/// Minimal stack listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSummary {
    pub stack_name: String,
    pub stack_status: String,
}

/// Account and region the current credentials resolve to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultEnvironment {
    pub account: Option<String>,
    pub region: Option<String>,
}

/// The staging bucket created by `cdk bootstrap`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolkitInfo {
    pub bucket_name: String,
    pub bucket_domain_name: Option<String>,
}

impl ToolkitInfo {
    /// HTTPS URL CloudFormation accepts as `TemplateURL` for an object in the bucket.
    pub fn object_url(&self, region: &str, key: &str) -> String {
        let domain = self
            .bucket_domain_name
            .clone()
            .unwrap_or_else(|| format!("{}.s3.{}.amazonaws.com", self.bucket_name, region));
        format!("https://{}/{}", domain, key)
    }
}

/// Cloud capability the refactor engine depends on.
#[async_trait]
pub trait CloudFormationApi: Send + Sync {
    /// Account and region used for stacks that did not pin an environment.
    async fn default_environment(&self) -> RefactorResult<DefaultEnvironment>;

    /// Live stacks in `environment`.
    async fn list_stacks(&self, environment: &Environment) -> RefactorResult<Vec<StackSummary>>;

    /// Raw template body (JSON or YAML) of a deployed stack.
    async fn get_template(
        &self,
        environment: &Environment,
        stack_name: &str,
    ) -> RefactorResult<String>;

    /// Toolkit staging bucket, or `None` when the environment was never bootstrapped.
    async fn lookup_toolkit(&self, environment: &Environment)
        -> RefactorResult<Option<ToolkitInfo>>;

    /// Put an object into a bucket.
    async fn upload_object(
        &self,
        environment: &Environment,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
    ) -> RefactorResult<()>;
}

/// [`CloudFormationApi`] backed by the AWS SDK.
///
/// One base [`aws_config::SdkConfig`] is loaded from the usual credential chain (optionally
/// for a named profile); per-environment clients reuse it with the region overridden.
/// Stacks targeting an account other than the caller's are still queried with the caller's
/// credentials, so CloudFormation reports the access problem.
pub struct AwsSdkProvider {
    config: aws_config::SdkConfig,
    caller: OnceCell<DefaultEnvironment>,
    cfn_clients: Mutex<HashMap<String, cfn::Client>>,
}

impl AwsSdkProvider {
    /// Load SDK configuration, optionally for a named profile and region.
    pub async fn load(profile: Option<&str>, region: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        let config = loader.load().await;
        debug!(
            "Loaded AWS configuration (profile: {:?}, region: {:?})",
            profile,
            config.region()
        );
        Self::from_config(config)
    }

    pub fn from_config(config: aws_config::SdkConfig) -> Self {
        Self {
            config,
            caller: OnceCell::new(),
            cfn_clients: Mutex::new(HashMap::new()),
        }
    }

    fn cloudformation(&self, environment: &Environment) -> cfn::Client {
        if let Ok(clients) = self.cfn_clients.lock() {
            if let Some(client) = clients.get(&environment.region) {
                return client.clone();
            }
        }

        let conf = cfn::config::Builder::from(&self.config)
            .region(Region::new(environment.region.clone()))
            .build();
        let client = cfn::Client::from_conf(conf);
        if let Ok(mut clients) = self.cfn_clients.lock() {
            clients.insert(environment.region.clone(), client.clone());
        }
        client
    }

    fn s3(&self, environment: &Environment) -> s3::Client {
        let conf = s3::config::Builder::from(&self.config)
            .region(Region::new(environment.region.clone()))
            .build();
        s3::Client::from_conf(conf)
    }

    async fn resolve_caller(&self) -> RefactorResult<DefaultEnvironment> {
        let region = self.config.region().map(|r| r.to_string());
        let identity = sts::Client::new(&self.config)
            .get_caller_identity()
            .send()
            .await
            .map_err(|e| RefactorError::network("STS GetCallerIdentity", e))?;

        let account = identity.account().map(str::to_string);
        info!(
            "Default environment resolved to account {:?}, region {:?}",
            account, region
        );
        Ok(DefaultEnvironment { account, region })
    }
}

#[async_trait]
impl CloudFormationApi for AwsSdkProvider {
    async fn default_environment(&self) -> RefactorResult<DefaultEnvironment> {
        self.caller
            .get_or_try_init(|| self.resolve_caller())
            .await
            .cloned()
    }

    async fn list_stacks(&self, environment: &Environment) -> RefactorResult<Vec<StackSummary>> {
        let client = self.cloudformation(environment);
        let filters: Vec<cfn::types::StackStatus> = LIVE_STACK_STATUSES
            .iter()
            .map(|status| cfn::types::StackStatus::from(*status))
            .collect();

        let mut stacks = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let response = client
                .list_stacks()
                .set_stack_status_filter(Some(filters.clone()))
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| {
                    RefactorError::network(format!("ListStacks in {}", environment), e)
                })?;

            for summary in response.stack_summaries() {
                if let Some(name) = summary.stack_name() {
                    stacks.push(StackSummary {
                        stack_name: name.to_string(),
                        stack_status: summary
                            .stack_status()
                            .map(|s| s.as_str().to_string())
                            .unwrap_or_default(),
                    });
                }
            }

            next_token = response.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        debug!("Listed {} live stacks in {}", stacks.len(), environment);
        Ok(stacks)
    }

    async fn get_template(
        &self,
        environment: &Environment,
        stack_name: &str,
    ) -> RefactorResult<String> {
        let response = self
            .cloudformation(environment)
            .get_template()
            .stack_name(stack_name)
            .template_stage(cfn::types::TemplateStage::Original)
            .send()
            .await
            .map_err(|e| {
                RefactorError::network(format!("GetTemplate for stack {}", stack_name), e)
            })?;

        response
            .template_body()
            .map(str::to_string)
            .ok_or_else(|| RefactorError::InvalidTemplate {
                stack_name: stack_name.to_string(),
                reason: "GetTemplate returned no template body".to_string(),
            })
    }

    async fn lookup_toolkit(
        &self,
        environment: &Environment,
    ) -> RefactorResult<Option<ToolkitInfo>> {
        let result = self
            .cloudformation(environment)
            .describe_stacks()
            .stack_name(TOOLKIT_STACK_NAME)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(sdk_error) => {
                // A missing stack surfaces as a ValidationError service error
                if let Some(service_error) = sdk_error.as_service_error() {
                    if service_error.code() == Some("ValidationError") {
                        debug!("No {} stack in {}", TOOLKIT_STACK_NAME, environment);
                        return Ok(None);
                    }
                }
                return Err(RefactorError::network(
                    format!("DescribeStacks for {} in {}", TOOLKIT_STACK_NAME, environment),
                    sdk_error,
                ));
            }
        };

        let Some(stack) = response.stacks().first() else {
            return Ok(None);
        };

        let output = |key: &str| {
            stack
                .outputs()
                .iter()
                .find(|o| o.output_key() == Some(key))
                .and_then(|o| o.output_value())
                .map(str::to_string)
        };

        match output("BucketName") {
            Some(bucket_name) => Ok(Some(ToolkitInfo {
                bucket_name,
                bucket_domain_name: output("BucketDomainName"),
            })),
            None => {
                warn!(
                    "{} stack in {} has no BucketName output",
                    TOOLKIT_STACK_NAME, environment
                );
                Ok(None)
            }
        }
    }

    async fn upload_object(
        &self,
        environment: &Environment,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
    ) -> RefactorResult<()> {
        let size = body.len();
        self.s3(environment)
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type("application/json")
            .body(s3::primitives::ByteStream::from(body))
            .send()
            .await
            .map_err(|e| RefactorError::network(format!("PutObject s3://{}/{}", bucket, key), e))?;

        debug!("Uploaded {} bytes to s3://{}/{}", size, bucket, key);
        Ok(())
    }
}
