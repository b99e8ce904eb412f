//! Resource movement detection.
//!
//! Deployed and local resources are indexed by `(environment, digest)`. Every digest
//! present on either side produces movements: the Cartesian product of its deployed
//! locations (sources) and local locations (destinations), or one-sided movements when
//! the digest exists on one side only. Identity pairs are kept here and filtered when
//! mappings are resolved.

use crate::app::cfn_resource_models::ResourceModelLoader;
use crate::app::cfn_template::{TemplateResource, CDK_METADATA_TYPE};
use crate::app::refactor::digest::compute_resource_digests;
use crate::app::refactor::environment::{CloudFormationStack, Environment, StackRef};
use crate::app::refactor::exclusions::ExcludeList;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use tracing::debug;

/// A resource within one stack.
///
/// Identity is `(stack, logical_resource_id)`; the construct path and type are carried
/// along for display only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLocation {
    #[serde(rename = "stackName", serialize_with = "serialize_stack_name")]
    pub stack: StackRef,
    pub logical_resource_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub construct_path: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub resource_type: String,
}

fn serialize_stack_name<S: serde::Serializer>(stack: &StackRef, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&stack.stack_name)
}

impl ResourceLocation {
    pub fn new(stack: StackRef, logical_resource_id: impl Into<String>) -> Self {
        Self {
            stack,
            logical_resource_id: logical_resource_id.into(),
            construct_path: None,
            resource_type: String::new(),
        }
    }

    /// Location of a template resource, with its construct path and type filled in.
    pub fn of_resource(stack: &CloudFormationStack, resource: &TemplateResource<'_>) -> Self {
        Self {
            stack: stack.stack_ref(),
            logical_resource_id: resource.logical_id.to_string(),
            construct_path: resource.construct_path().map(str::to_string),
            resource_type: resource.resource_type().to_string(),
        }
    }

    pub fn stack_name(&self) -> &str {
        &self.stack.stack_name
    }

    pub fn environment(&self) -> &Environment {
        &self.stack.environment
    }

    /// `Stack.LogicalId`
    pub fn to_location_string(&self) -> String {
        format!("{}.{}", self.stack.stack_name, self.logical_resource_id)
    }

    /// Construct path when known, otherwise `Stack.LogicalId`.
    pub fn to_path(&self) -> String {
        self.construct_path
            .clone()
            .unwrap_or_else(|| self.to_location_string())
    }

    fn key(&self) -> (&StackRef, &str) {
        (&self.stack, &self.logical_resource_id)
    }
}

impl PartialEq for ResourceLocation {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ResourceLocation {}

impl Hash for ResourceLocation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for ResourceLocation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceLocation {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for ResourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stack.stack_name, self.logical_resource_id)
    }
}

/// A candidate pairing of a deployed and a local location sharing a digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceMovement {
    pub digest: String,
    pub source: Option<ResourceLocation>,
    pub destination: Option<ResourceLocation>,
}

impl ResourceMovement {
    /// Both ends present and different.
    pub fn is_candidate(&self) -> bool {
        match (&self.source, &self.destination) {
            (Some(source), Some(destination)) => source != destination,
            _ => false,
        }
    }
}

/// Movements between `deployed` and `local` stacks, without exclusions.
pub fn resource_movements(
    deployed: &[CloudFormationStack],
    local: &[CloudFormationStack],
    models: &dyn ResourceModelLoader,
) -> Vec<ResourceMovement> {
    resource_movements_excluding(deployed, local, models, &ExcludeList::default())
}

/// Movements between `deployed` and `local` stacks.
///
/// Stacks may span several environments; locations are only ever paired within one.
/// `AWS::CDK::Metadata` resources and excluded resources do not move, but still
/// contribute to their dependents' digests.
pub fn resource_movements_excluding(
    deployed: &[CloudFormationStack],
    local: &[CloudFormationStack],
    models: &dyn ResourceModelLoader,
    exclude: &ExcludeList,
) -> Vec<ResourceMovement> {
    let mut index: BTreeMap<(Environment, String), (Vec<ResourceLocation>, Vec<ResourceLocation>)> =
        BTreeMap::new();

    for (environment, stacks) in by_environment(deployed) {
        for (digest, location) in digested_locations(&stacks, models, exclude) {
            index
                .entry((environment.clone(), digest))
                .or_default()
                .0
                .push(location);
        }
    }
    for (environment, stacks) in by_environment(local) {
        for (digest, location) in digested_locations(&stacks, models, exclude) {
            index
                .entry((environment.clone(), digest))
                .or_default()
                .1
                .push(location);
        }
    }

    let mut movements = Vec::new();
    for ((_, digest), (mut sources, mut destinations)) in index {
        sources.sort();
        destinations.sort();
        match (sources.is_empty(), destinations.is_empty()) {
            (false, false) => {
                for source in &sources {
                    for destination in &destinations {
                        movements.push(ResourceMovement {
                            digest: digest.clone(),
                            source: Some(source.clone()),
                            destination: Some(destination.clone()),
                        });
                    }
                }
            }
            (false, true) => movements.extend(sources.into_iter().map(|source| ResourceMovement {
                digest: digest.clone(),
                source: Some(source),
                destination: None,
            })),
            (true, false) => {
                movements.extend(destinations.into_iter().map(|destination| ResourceMovement {
                    digest: digest.clone(),
                    source: None,
                    destination: Some(destination),
                }))
            }
            (true, true) => {}
        }
    }

    debug!(
        "{} movement(s), {} candidate(s)",
        movements.len(),
        movements.iter().filter(|m| m.is_candidate()).count()
    );
    movements
}

fn by_environment(stacks: &[CloudFormationStack]) -> BTreeMap<Environment, Vec<CloudFormationStack>> {
    let mut grouped: BTreeMap<Environment, Vec<CloudFormationStack>> = BTreeMap::new();
    for stack in stacks {
        grouped
            .entry(stack.environment.clone())
            .or_default()
            .push(stack.clone());
    }
    grouped
}

/// `(digest, location)` for every movable resource of one environment's stacks.
fn digested_locations(
    stacks: &[CloudFormationStack],
    models: &dyn ResourceModelLoader,
    exclude: &ExcludeList,
) -> Vec<(String, ResourceLocation)> {
    let digests = compute_resource_digests(stacks, models);
    let mut located = Vec::new();
    for stack in stacks {
        for resource in stack.template.resources() {
            if resource.resource_type() == CDK_METADATA_TYPE {
                continue;
            }
            let location = ResourceLocation::of_resource(stack, &resource);
            if exclude.is_excluded(&location, &resource) {
                debug!("Excluding {} from refactor", location);
                continue;
            }
            if let Some(digest) = digests.get(&location.to_location_string()) {
                located.push((digest.clone(), location));
            }
        }
    }
    located
}
