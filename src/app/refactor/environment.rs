//! Environments, stacks and environment grouping.
//!
//! Resources are only ever compared within one environment, i.e. one `(account, region)`
//! pair. [`group_stacks`] enforces this up front: it partitions the local stacks by
//! environment and fetches the deployed stacks for each environment independently, so
//! every later stage works on exactly one [`EnvironmentGroup`] at a time.
//!
//! Deployed stacks are fetched concurrently across environments. Within an environment the
//! calls are sequential (the template fetches need the stack list). A failure in one
//! environment is recorded in [`GroupedStacks::failures`] and does not affect the others.

use crate::app::aws_client::{CloudFormationApi, DefaultEnvironment};
use crate::app::cfn_template::CloudFormationTemplate;
use crate::app::refactor::error::{RefactorError, RefactorResult};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Placeholder account CDK writes for environment-agnostic stacks.
pub const UNKNOWN_ACCOUNT: &str = "unknown-account";

/// Placeholder region CDK writes for environment-agnostic stacks.
pub const UNKNOWN_REGION: &str = "unknown-region";

/// A target cloud environment.
///
/// `name` is always `aws://{account}/{region}`, so equality and ordering are effectively
/// on the `(account, region)` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Environment {
    pub account: String,
    pub region: String,
    pub name: String,
}

impl Environment {
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        let account = account.into();
        let region = region.into();
        let name = format!("aws://{}/{}", account, region);
        Self {
            account,
            region,
            name,
        }
    }

    /// Parse `aws://ACCOUNT/REGION`.
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix("aws://")?;
        let (account, region) = rest.split_once('/')?;
        if account.is_empty() || region.is_empty() || region.contains('/') {
            return None;
        }
        Some(Self::new(account, region))
    }

    /// Whether the account or region is still a CDK placeholder.
    pub fn is_unresolved(&self) -> bool {
        self.account == UNKNOWN_ACCOUNT || self.region == UNKNOWN_REGION
    }

    /// Replace placeholders with the SDK's default account and region.
    pub fn resolve(&self, defaults: &DefaultEnvironment) -> RefactorResult<Self> {
        let account = if self.account == UNKNOWN_ACCOUNT {
            defaults.account.clone().ok_or_else(|| {
                RefactorError::not_found(
                    format!("Default account for {}", self),
                    "Configure AWS credentials or pin the stack to an account.",
                )
            })?
        } else {
            self.account.clone()
        };

        let region = if self.region == UNKNOWN_REGION {
            defaults.region.clone().ok_or_else(|| {
                RefactorError::not_found(
                    format!("Default region for {}", self),
                    "Set AWS_REGION, pass --region, or pin the stack to a region.",
                )
            })?
        } else {
            self.region.clone()
        };

        Ok(Self::new(account, region))
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A named template bound to an environment. Deployed stacks come from CloudFormation,
/// local stacks from the synthesized assembly.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudFormationStack {
    pub stack_name: String,
    pub environment: Environment,
    pub template: CloudFormationTemplate,
}

impl CloudFormationStack {
    pub fn new(
        stack_name: impl Into<String>,
        environment: Environment,
        template: CloudFormationTemplate,
    ) -> Self {
        Self {
            stack_name: stack_name.into(),
            environment,
            template,
        }
    }

    pub fn stack_ref(&self) -> StackRef {
        StackRef {
            stack_name: self.stack_name.clone(),
            environment: self.environment.clone(),
        }
    }
}

/// Identity of a stack: its name within an environment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackRef {
    pub stack_name: String,
    pub environment: Environment,
}

/// Deployed and local stacks of a single environment.
#[derive(Debug, Clone)]
pub struct EnvironmentGroup {
    pub environment: Environment,
    pub deployed_stacks: Vec<CloudFormationStack>,
    pub local_stacks: Vec<CloudFormationStack>,
}

/// An environment whose deployed stacks could not be fetched.
#[derive(Debug)]
pub struct EnvironmentFailure {
    pub environment: Environment,
    pub error: RefactorError,
}

/// Result of [`group_stacks`]: groups ordered by environment, plus isolated failures.
#[derive(Debug, Default)]
pub struct GroupedStacks {
    pub groups: Vec<EnvironmentGroup>,
    pub failures: Vec<EnvironmentFailure>,
}

/// Partition local stacks by resolved environment and fetch what is deployed in each.
pub async fn group_stacks(
    api: &dyn CloudFormationApi,
    local_stacks: Vec<CloudFormationStack>,
) -> RefactorResult<GroupedStacks> {
    group_stacks_with(api, local_stacks, &[]).await
}

/// Like [`group_stacks`], but also fetches `extra_environments` even when no local stack
/// targets them (an explicit mapping can empty an environment's stacks entirely).
pub async fn group_stacks_with(
    api: &dyn CloudFormationApi,
    local_stacks: Vec<CloudFormationStack>,
    extra_environments: &[Environment],
) -> RefactorResult<GroupedStacks> {
    let partitions = partition_by_environment(api, local_stacks, extra_environments).await?;
    info!(
        "Refactor spans {} environment(s): {}",
        partitions.len(),
        partitions
            .keys()
            .map(|e| e.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let fetches = partitions.keys().map(|env| fetch_deployed_stacks(api, env));
    let fetched = join_all(fetches).await;

    let mut grouped = GroupedStacks::default();
    for ((environment, local_stacks), deployed) in partitions.into_iter().zip(fetched) {
        match deployed {
            Ok(deployed_stacks) => grouped.groups.push(EnvironmentGroup {
                environment,
                deployed_stacks,
                local_stacks,
            }),
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => {
                warn!("Skipping environment {}: {}", environment, error);
                grouped.failures.push(EnvironmentFailure { environment, error });
            }
        }
    }
    Ok(grouped)
}

/// Group local stacks by environment, resolving placeholder accounts/regions.
pub async fn partition_by_environment(
    api: &dyn CloudFormationApi,
    local_stacks: Vec<CloudFormationStack>,
    extra_environments: &[Environment],
) -> RefactorResult<BTreeMap<Environment, Vec<CloudFormationStack>>> {
    let needs_defaults = local_stacks
        .iter()
        .map(|s| &s.environment)
        .chain(extra_environments)
        .any(Environment::is_unresolved);
    let defaults = if needs_defaults {
        api.default_environment().await?
    } else {
        DefaultEnvironment::default()
    };

    let mut partitions: BTreeMap<Environment, Vec<CloudFormationStack>> = BTreeMap::new();
    for environment in extra_environments {
        partitions.entry(environment.resolve(&defaults)?).or_default();
    }
    for mut stack in local_stacks {
        let environment = stack.environment.resolve(&defaults)?;
        stack.environment = environment.clone();
        partitions.entry(environment).or_default().push(stack);
    }
    Ok(partitions)
}

/// List the live stacks of one environment and load every template that parses.
///
/// Templates that are neither JSON nor plain YAML (for example YAML using short-form
/// intrinsic tags) are skipped with a warning: those stacks were not created by CDK and
/// cannot take part in a refactor. A stack whose template cannot be fetched (deleted
/// after the listing, or returned without a body) is skipped the same way; network
/// errors still fail the environment.
pub async fn fetch_deployed_stacks(
    api: &dyn CloudFormationApi,
    environment: &Environment,
) -> RefactorResult<Vec<CloudFormationStack>> {
    let summaries = api.list_stacks(environment).await?;
    debug!("{} deployed stack(s) in {}", summaries.len(), environment);

    let mut stacks = Vec::with_capacity(summaries.len());
    for summary in summaries {
        let body = match api.get_template(environment, &summary.stack_name).await {
            Ok(body) => body,
            Err(e @ (RefactorError::NotFound { .. } | RefactorError::InvalidTemplate { .. })) => {
                warn!(
                    "Ignoring stack {} in {}: template could not be fetched ({})",
                    summary.stack_name, environment, e
                );
                continue;
            }
            Err(e) => return Err(e),
        };
        match CloudFormationTemplate::parse(&body) {
            Ok(template) => stacks.push(CloudFormationStack::new(
                summary.stack_name,
                environment.clone(),
                template,
            )),
            Err(e) => warn!(
                "Ignoring stack {} in {}: template could not be parsed ({})",
                summary.stack_name, environment, e
            ),
        }
    }
    stacks.sort_by(|a, b| a.stack_name.cmp(&b.stack_name));
    Ok(stacks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parse_and_display() {
        let env = Environment::parse("aws://123456789012/eu-west-1").unwrap();
        assert_eq!(env.account, "123456789012");
        assert_eq!(env.region, "eu-west-1");
        assert_eq!(env.to_string(), "aws://123456789012/eu-west-1");

        assert!(Environment::parse("123456789012/eu-west-1").is_none());
        assert!(Environment::parse("aws://123456789012").is_none());
    }

    #[test]
    fn test_resolve_placeholders() {
        let defaults = DefaultEnvironment {
            account: Some("111111111111".to_string()),
            region: Some("us-east-2".to_string()),
        };
        let env = Environment::new(UNKNOWN_ACCOUNT, UNKNOWN_REGION);
        assert!(env.is_unresolved());
        assert_eq!(
            env.resolve(&defaults).unwrap(),
            Environment::new("111111111111", "us-east-2")
        );

        let pinned = Environment::new("222222222222", "ap-south-1");
        assert_eq!(pinned.resolve(&defaults).unwrap(), pinned);
    }

    #[test]
    fn test_resolve_without_defaults_is_not_found() {
        let env = Environment::new(UNKNOWN_ACCOUNT, "us-east-1");
        let err = env.resolve(&DefaultEnvironment::default()).unwrap_err();
        assert_eq!(err.kind(), "NotFoundError");
    }
}
