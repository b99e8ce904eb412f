//! Stack refactor planning.
//!
//! [`plan_refactor`] runs the whole pipeline for a set of local stacks:
//!
//! 1. [`environment::group_stacks_with`] partitions the local stacks by environment and
//!    fetches the deployed stacks of each environment concurrently
//! 2. per environment, [`movement`] pairs deployed and local resources by [`digest`], and
//!    [`mapping`] resolves the pairs into mappings and ambiguous paths (or takes the
//!    user's explicit mapping file instead)
//! 3. [`stack_definitions`] builds the templates CloudFormation needs for the mappings
//!
//! Environments are planned independently. A non-fatal error in one environment is
//! recorded in [`RefactorPlan::errors`] and the others still produce a plan; validation
//! errors, oversized templates without a bucket and cancellation abort everything.
//! Cancellation discards all partial results.

pub mod digest;
pub mod environment;
pub mod error;
pub mod exclusions;
pub mod graph;
pub mod mapping;
pub mod movement;
pub mod report;
pub mod stack_definitions;

use crate::app::aws_client::CloudFormationApi;
use crate::app::cfn_resource_models::ResourceModelLoader;
use environment::{group_stacks_with, CloudFormationStack, Environment, EnvironmentGroup};
use error::{RefactorError, RefactorResult};
use exclusions::ExcludeList;
use futures::future::join_all;
use mapping::{ambiguous_movements, resource_mappings, AmbiguousPath, MappingGroup, ResourceMapping};
use movement::resource_movements_excluding;
use regex::Regex;
use serde::Serialize;
use stack_definitions::{generate_stack_definitions, StackDefinition};
use tokio_util::sync::CancellationToken;

/// What to plan and how.
#[derive(Debug, Clone)]
pub struct RefactorOptions {
    /// Only compute the plan. Executing a refactor is not supported.
    pub dry_run: bool,
    /// Stack name patterns (`*` wildcard); empty means every stack.
    pub stack_patterns: Vec<String>,
    /// Explicit mappings replacing detection for their environments.
    pub mapping_groups: Option<Vec<MappingGroup>>,
    /// Apply the explicit mappings in reverse.
    pub revert: bool,
    pub exclude: ExcludeList,
}

impl Default for RefactorOptions {
    fn default() -> Self {
        Self {
            dry_run: true,
            stack_patterns: Vec::new(),
            mapping_groups: None,
            revert: false,
            exclude: ExcludeList::default(),
        }
    }
}

impl RefactorOptions {
    /// Reject option combinations that cannot be planned.
    pub fn validate(&self) -> RefactorResult<()> {
        if !self.dry_run {
            return Err(RefactorError::validation(
                "Refactor is not available yet. To see the proposed changes, use the --dry-run flag.",
            ));
        }
        if self.revert && self.mapping_groups.is_none() {
            return Err(RefactorError::validation(
                "The --revert option can only be used with the --mapping-file option.",
            ));
        }
        for group in self.mapping_groups.iter().flatten() {
            group.validate_structure()?;
        }
        StackFilter::new(self.stack_patterns.as_slice()).map(|_| ())
    }

    /// Explicit groups in the direction they should be applied.
    fn effective_mapping_groups(&self) -> Option<Vec<MappingGroup>> {
        self.mapping_groups.as_ref().map(|groups| {
            if self.revert {
                groups.iter().map(MappingGroup::reversed).collect()
            } else {
                groups.clone()
            }
        })
    }
}

/// The plan for one environment.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentPlan {
    pub environment: Environment,
    pub mappings: Vec<ResourceMapping>,
    pub ambiguous: Vec<AmbiguousPath>,
    pub stack_definitions: Vec<StackDefinition>,
}

/// An environment that could not be planned.
#[derive(Debug, Clone, Serialize)]
pub struct PlanError {
    pub environment: Environment,
    pub kind: &'static str,
    pub message: String,
}

impl PlanError {
    fn new(environment: Environment, error: &RefactorError) -> Self {
        Self {
            environment,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Refactor plan across every environment, ordered by environment.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefactorPlan {
    pub environments: Vec<EnvironmentPlan>,
    pub errors: Vec<PlanError>,
}

impl RefactorPlan {
    pub fn mappings(&self) -> impl Iterator<Item = &ResourceMapping> {
        self.environments.iter().flat_map(|e| e.mappings.iter())
    }

    pub fn has_ambiguities(&self) -> bool {
        self.environments.iter().any(|e| !e.ambiguous.is_empty())
    }

    /// No mappings and no ambiguities anywhere.
    pub fn is_empty(&self) -> bool {
        self.environments
            .iter()
            .all(|e| e.mappings.is_empty() && e.ambiguous.is_empty())
    }
}

/// Stack name patterns with `*` wildcards.
#[derive(Debug, Clone, Default)]
pub struct StackFilter {
    patterns: Vec<Regex>,
}

impl StackFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> RefactorResult<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                let escaped: Vec<String> =
                    pattern.as_ref().split('*').map(regex::escape).collect();
                Regex::new(&format!("^{}$", escaped.join(".*"))).map_err(|e| {
                    RefactorError::validation(format!(
                        "Invalid stack pattern '{}': {}",
                        pattern.as_ref(),
                        e
                    ))
                })
            })
            .collect::<RefactorResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, stack_name: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.is_match(stack_name))
    }

    fn matches_mapping(&self, mapping: &ResourceMapping) -> bool {
        self.matches(mapping.source.stack_name()) || self.matches(mapping.destination.stack_name())
    }

    fn matches_ambiguity(&self, path: &AmbiguousPath) -> bool {
        path.sources
            .iter()
            .chain(&path.destinations)
            .any(|location| self.matches(location.stack_name()))
    }
}

/// Plan a refactor of `local_stacks` against what is deployed.
///
/// Returns [`RefactorError::Cancelled`] as soon as `cancel` fires.
pub async fn plan_refactor(
    api: &dyn CloudFormationApi,
    models: &dyn ResourceModelLoader,
    local_stacks: Vec<CloudFormationStack>,
    options: &RefactorOptions,
    cancel: &CancellationToken,
) -> RefactorResult<RefactorPlan> {
    options.validate()?;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            log_warn!("Refactor planning cancelled");
            Err(RefactorError::Cancelled)
        }
        plan = build_plan(api, models, local_stacks, options) => plan,
    }
}

async fn build_plan(
    api: &dyn CloudFormationApi,
    models: &dyn ResourceModelLoader,
    local_stacks: Vec<CloudFormationStack>,
    options: &RefactorOptions,
) -> RefactorResult<RefactorPlan> {
    let filter = StackFilter::new(options.stack_patterns.as_slice())?;
    let explicit = options.effective_mapping_groups();
    let explicit_environments: Vec<Environment> = explicit
        .iter()
        .flatten()
        .map(MappingGroup::environment)
        .collect();

    log_info!(
        "Planning refactor for {} local stack(s){}",
        local_stacks.len(),
        if explicit.is_some() {
            " using explicit mappings"
        } else {
            ""
        }
    );

    let grouped = group_stacks_with(api, local_stacks, &explicit_environments).await?;
    let mut plan = RefactorPlan::default();
    for failure in &grouped.failures {
        plan.errors
            .push(PlanError::new(failure.environment.clone(), &failure.error));
    }

    let planned = join_all(grouped.groups.iter().map(|group| {
        let group_mappings = explicit
            .as_ref()
            .and_then(|groups| groups.iter().find(|g| g.environment() == group.environment));
        plan_environment(api, models, group, group_mappings, options, &filter)
    }))
    .await;

    for (group, result) in grouped.groups.iter().zip(planned) {
        match result {
            Ok(environment_plan) => plan.environments.push(environment_plan),
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => {
                log_error!("Failed to plan refactor for {}: {}", group.environment, error);
                plan.errors
                    .push(PlanError::new(group.environment.clone(), &error));
            }
        }
    }

    log_info!(
        "Refactor plan: {} mapping(s) across {} environment(s), {} error(s)",
        plan.mappings().count(),
        plan.environments.len(),
        plan.errors.len()
    );
    Ok(plan)
}

async fn plan_environment(
    api: &dyn CloudFormationApi,
    models: &dyn ResourceModelLoader,
    group: &EnvironmentGroup,
    explicit: Option<&MappingGroup>,
    options: &RefactorOptions,
    filter: &StackFilter,
) -> RefactorResult<EnvironmentPlan> {
    let (mappings, ambiguous) = match explicit {
        Some(mapping_group) => {
            log_debug!(
                "{}: using {} explicit mapping(s)",
                group.environment,
                mapping_group.resources.len()
            );
            (
                mapping_group.to_mappings(&group.deployed_stacks, &group.local_stacks)?,
                Vec::new(),
            )
        }
        None => {
            let movements = resource_movements_excluding(
                &group.deployed_stacks,
                &group.local_stacks,
                models,
                &options.exclude,
            );
            trace_debug!("{}: {} movement(s)", group.environment, movements.len());
            (resource_mappings(&movements), ambiguous_movements(&movements))
        }
    };

    let mappings: Vec<ResourceMapping> = mappings
        .into_iter()
        .filter(|m| filter.matches_mapping(m))
        .collect();
    let ambiguous: Vec<AmbiguousPath> = ambiguous
        .into_iter()
        .filter(|a| filter.matches_ambiguity(a))
        .collect();

    let stack_definitions = if mappings.is_empty() {
        Vec::new()
    } else {
        generate_stack_definitions(
            &mappings,
            &group.deployed_stacks,
            &group.local_stacks,
            &group.environment,
            api,
        )
        .await?
    };

    trace_info!(
        "{}: {} mapping(s), {} ambiguous group(s), {} stack definition(s)",
        group.environment,
        mappings.len(),
        ambiguous.len(),
        stack_definitions.len()
    );

    Ok(EnvironmentPlan {
        environment: group.environment.clone(),
        mappings,
        ambiguous,
        stack_definitions,
    })
}
