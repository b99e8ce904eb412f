//! Resolving movements into mappings, and explicit mapping files.
//!
//! For every `(environment, digest)` the distinct sources and destinations of its
//! movements are collected and the locations present on both sides (resources that did
//! not move) are removed. What is left decides the outcome:
//!
//! | sources | destinations | result |
//! |---|---|---|
//! | 1 | 1 | one [`ResourceMapping`] |
//! | >= 1 | >= 1, either side > 1 | one [`AmbiguousPath`], no mapping |
//! | 0 | any | nothing (pure addition) |
//! | any | 0 | nothing (pure removal) |
//!
//! Output is sorted by location so repeated runs print the same plan.
//!
//! Users can bypass detection with a mapping file listing `"Stack.LogicalId"` pairs per
//! environment ([`MappingGroup`]).

use crate::app::refactor::environment::{CloudFormationStack, Environment, StackRef};
use crate::app::refactor::error::{RefactorError, RefactorResult};
use crate::app::refactor::movement::{ResourceLocation, ResourceMovement};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::debug;

/// A resolved move of one resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ResourceMapping {
    pub source: ResourceLocation,
    pub destination: ResourceLocation,
}

/// Display form of a mapping: type plus construct paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedMapping {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub source_path: String,
    pub destination_path: String,
}

/// One side of a CloudFormation `ResourceMappings` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceIdentifier {
    pub stack_name: String,
    pub logical_resource_id: String,
}

/// The shape `CreateStackRefactor` accepts in `ResourceMappings`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CloudFormationMapping {
    pub source: ResourceIdentifier,
    pub destination: ResourceIdentifier,
}

impl ResourceMapping {
    pub fn new(source: ResourceLocation, destination: ResourceLocation) -> Self {
        Self {
            source,
            destination,
        }
    }

    pub fn environment(&self) -> &Environment {
        self.source.environment()
    }

    pub fn to_typed(&self) -> TypedMapping {
        let resource_type = if self.source.resource_type.is_empty() {
            self.destination.resource_type.clone()
        } else {
            self.source.resource_type.clone()
        };
        TypedMapping {
            resource_type,
            source_path: self.source.to_path(),
            destination_path: self.destination.to_path(),
        }
    }

    pub fn to_cloudformation(&self) -> CloudFormationMapping {
        let identifier = |location: &ResourceLocation| ResourceIdentifier {
            stack_name: location.stack.stack_name.clone(),
            logical_resource_id: location.logical_resource_id.clone(),
        };
        CloudFormationMapping {
            source: identifier(&self.source),
            destination: identifier(&self.destination),
        }
    }
}

/// Several sources and/or destinations sharing a digest; left for the user to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmbiguousPath {
    pub sources: Vec<ResourceLocation>,
    pub destinations: Vec<ResourceLocation>,
}

enum Resolution {
    Mapped(ResourceMapping),
    Ambiguous(AmbiguousPath),
}

fn resolve(movements: &[ResourceMovement]) -> Vec<Resolution> {
    let mut groups: BTreeMap<(&Environment, &str), (BTreeSet<&ResourceLocation>, BTreeSet<&ResourceLocation>)> =
        BTreeMap::new();
    for movement in movements {
        if let (Some(source), Some(destination)) = (&movement.source, &movement.destination) {
            let group = groups
                .entry((source.environment(), movement.digest.as_str()))
                .or_default();
            group.0.insert(source);
            group.1.insert(destination);
        }
    }

    let mut resolutions = Vec::new();
    for ((environment, digest), (sources, destinations)) in groups {
        let moved_sources: Vec<ResourceLocation> = sources
            .difference(&destinations)
            .map(|l| (*l).clone())
            .collect();
        let moved_destinations: Vec<ResourceLocation> = destinations
            .difference(&sources)
            .map(|l| (*l).clone())
            .collect();

        match (moved_sources.len(), moved_destinations.len()) {
            (0, _) | (_, 0) => {}
            (1, 1) => {
                let mut sources = moved_sources.into_iter();
                let mut destinations = moved_destinations.into_iter();
                if let (Some(source), Some(destination)) = (sources.next(), destinations.next()) {
                    resolutions.push(Resolution::Mapped(ResourceMapping::new(source, destination)));
                }
            }
            _ => {
                debug!(
                    "Ambiguous digest {} in {}: {} source(s), {} destination(s)",
                    digest,
                    environment,
                    moved_sources.len(),
                    moved_destinations.len()
                );
                resolutions.push(Resolution::Ambiguous(AmbiguousPath {
                    sources: moved_sources,
                    destinations: moved_destinations,
                }));
            }
        }
    }
    resolutions
}

/// Unambiguous 1:1 moves, sorted by source then destination.
pub fn resource_mappings(movements: &[ResourceMovement]) -> Vec<ResourceMapping> {
    let mut mappings: Vec<ResourceMapping> = resolve(movements)
        .into_iter()
        .filter_map(|r| match r {
            Resolution::Mapped(mapping) => Some(mapping),
            Resolution::Ambiguous(_) => None,
        })
        .collect();
    mappings.sort();
    mappings
}

/// Digest groups that cannot be resolved automatically, sorted by their first source.
pub fn ambiguous_movements(movements: &[ResourceMovement]) -> Vec<AmbiguousPath> {
    let mut ambiguous: Vec<AmbiguousPath> = resolve(movements)
        .into_iter()
        .filter_map(|r| match r {
            Resolution::Ambiguous(path) => Some(path),
            Resolution::Mapped(_) => None,
        })
        .collect();
    ambiguous.sort_by(|a, b| a.sources.cmp(&b.sources).then_with(|| a.destinations.cmp(&b.destinations)));
    ambiguous
}

/// Top-level mapping file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MappingFile {
    pub environments: Vec<MappingGroup>,
}

/// Explicit `source -> destination` mappings for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MappingGroup {
    pub account: String,
    pub region: String,
    /// `"Stack.LogicalId"` source to `"Stack.LogicalId"` destination
    pub resources: BTreeMap<String, String>,
}

impl MappingGroup {
    pub fn environment(&self) -> Environment {
        Environment::new(&self.account, &self.region)
    }

    /// Parse and structurally validate mapping file content.
    pub fn parse_file(content: &str) -> RefactorResult<Vec<MappingGroup>> {
        let file: MappingFile = serde_json::from_str(content)
            .map_err(|e| RefactorError::validation(format!("Invalid mapping file: {}", e)))?;
        for group in &file.environments {
            group.validate_structure()?;
        }
        Ok(file.environments)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> RefactorResult<Vec<MappingGroup>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            RefactorError::not_found(
                format!("Mapping file {:?}", path),
                format!("Check the --mapping-file path ({}).", e),
            )
        })?;
        Self::parse_file(&content)
    }

    /// Every key and value is `Stack.LogicalId`, and no destination is used twice.
    pub fn validate_structure(&self) -> RefactorResult<()> {
        if self.environment().is_unresolved() {
            return Err(RefactorError::validation(format!(
                "Mapping for {} must name a concrete account and region",
                self.environment()
            )));
        }
        let mut destinations = BTreeSet::new();
        for (source, destination) in &self.resources {
            parse_location(source)?;
            parse_location(destination)?;
            if !destinations.insert(destination.as_str()) {
                return Err(RefactorError::validation(format!(
                    "Duplicate destination resource '{}' in mapping for {}",
                    destination,
                    self.environment()
                )));
            }
        }
        Ok(())
    }

    /// The same group with every mapping pointing the other way.
    pub fn reversed(&self) -> MappingGroup {
        MappingGroup {
            account: self.account.clone(),
            region: self.region.clone(),
            resources: self
                .resources
                .iter()
                .map(|(source, destination)| (destination.clone(), source.clone()))
                .collect(),
        }
    }

    /// Check the group against what is deployed and turn it into mappings.
    ///
    /// Sources must exist among `deployed`. A destination must not already be taken by a
    /// deployed resource, unless that resource is itself moved away by this group.
    /// `local` stacks only contribute construct paths for display.
    pub fn to_mappings(
        &self,
        deployed: &[CloudFormationStack],
        local: &[CloudFormationStack],
    ) -> RefactorResult<Vec<ResourceMapping>> {
        self.validate_structure()?;
        let environment = self.environment();
        let find = |stacks: &[CloudFormationStack], stack_name: &str, logical_id: &str| {
            stacks
                .iter()
                .find(|s| s.stack_name == stack_name)
                .and_then(|s| {
                    s.template
                        .resource(logical_id)
                        .map(|r| ResourceLocation::of_resource(s, &r))
                })
        };

        let mut mappings = Vec::with_capacity(self.resources.len());
        for (source_key, destination_key) in &self.resources {
            let (source_stack, source_id) = parse_location(source_key)?;
            let (destination_stack, destination_id) = parse_location(destination_key)?;

            let source = find(deployed, source_stack, source_id).ok_or_else(|| {
                RefactorError::not_found(
                    format!("Source resource '{}' in {}", source_key, environment),
                    "Mapping sources must be deployed resources.",
                )
            })?;

            if find(deployed, destination_stack, destination_id).is_some()
                && !self.resources.contains_key(destination_key)
            {
                return Err(RefactorError::validation(format!(
                    "Destination resource '{}' is already in use in {}",
                    destination_key, environment
                )));
            }

            let destination = match find(local, destination_stack, destination_id) {
                Some(mut location) => {
                    location.stack.environment = environment.clone();
                    location
                }
                None => {
                    let mut location = ResourceLocation::new(
                        StackRef {
                            stack_name: destination_stack.to_string(),
                            environment: environment.clone(),
                        },
                        destination_id,
                    );
                    location.resource_type = source.resource_type.clone();
                    location
                }
            };
            mappings.push(ResourceMapping::new(source, destination));
        }
        mappings.sort();
        Ok(mappings)
    }
}

/// Split `Stack.LogicalId`.
pub fn parse_location(location: &str) -> RefactorResult<(&str, &str)> {
    match location.split_once('.') {
        Some((stack, logical_id))
            if !stack.is_empty() && !logical_id.is_empty() && !logical_id.contains('.') =>
        {
            Ok((stack, logical_id))
        }
        _ => Err(RefactorError::validation(format!(
            "Malformed resource location '{}'; expected 'StackName.LogicalId'",
            location
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::cfn_template::CloudFormationTemplate;
    use serde_json::json;

    fn env() -> Environment {
        Environment::new("123456789012", "us-east-1")
    }

    fn loc(stack: &str, id: &str) -> ResourceLocation {
        ResourceLocation::new(
            StackRef {
                stack_name: stack.to_string(),
                environment: env(),
            },
            id,
        )
    }

    fn movement(digest: &str, source: Option<ResourceLocation>, destination: Option<ResourceLocation>) -> ResourceMovement {
        ResourceMovement {
            digest: digest.to_string(),
            source,
            destination,
        }
    }

    #[test]
    fn test_single_pair_maps() {
        let movements = vec![movement("d", Some(loc("Foo", "Bucket1")), Some(loc("Bar", "Bucket1")))];
        assert_eq!(
            resource_mappings(&movements),
            vec![ResourceMapping::new(loc("Foo", "Bucket1"), loc("Bar", "Bucket1"))]
        );
        assert!(ambiguous_movements(&movements).is_empty());
    }

    #[test]
    fn test_identity_pair_is_not_a_mapping() {
        let movements = vec![movement("d", Some(loc("Foo", "Bucket1")), Some(loc("Foo", "Bucket1")))];
        assert!(resource_mappings(&movements).is_empty());
        assert!(ambiguous_movements(&movements).is_empty());
    }

    #[test]
    fn test_unmoved_locations_are_removed_before_deciding() {
        // A stays where it is; B moves to C
        let movements = vec![
            movement("d", Some(loc("S", "A")), Some(loc("S", "A"))),
            movement("d", Some(loc("S", "A")), Some(loc("S", "C"))),
            movement("d", Some(loc("S", "B")), Some(loc("S", "A"))),
            movement("d", Some(loc("S", "B")), Some(loc("S", "C"))),
        ];
        assert_eq!(
            resource_mappings(&movements),
            vec![ResourceMapping::new(loc("S", "B"), loc("S", "C"))]
        );
    }

    #[test]
    fn test_many_to_many_is_ambiguous() {
        let mut movements = Vec::new();
        for source in ["Bucket1", "Bucket2"] {
            for destination in ["Bucket3", "Bucket4"] {
                movements.push(movement("d", Some(loc("Src", source)), Some(loc("Dst", destination))));
            }
        }
        assert!(resource_mappings(&movements).is_empty());
        assert_eq!(
            ambiguous_movements(&movements),
            vec![AmbiguousPath {
                sources: vec![loc("Src", "Bucket1"), loc("Src", "Bucket2")],
                destinations: vec![loc("Dst", "Bucket3"), loc("Dst", "Bucket4")],
            }]
        );
    }

    #[test]
    fn test_one_sided_movements_are_ignored() {
        let movements = vec![
            movement("d", Some(loc("S", "Removed")), None),
            movement("e", None, Some(loc("S", "Added"))),
        ];
        assert!(resource_mappings(&movements).is_empty());
        assert!(ambiguous_movements(&movements).is_empty());
    }

    #[test]
    fn test_typed_and_cloudformation_shapes() {
        let mut source = loc("Old", "Queue");
        source.resource_type = "AWS::SQS::Queue".into();
        source.construct_path = Some("Old/Queue/Resource".into());
        let mapping = ResourceMapping::new(source, loc("New", "Queue2"));

        assert_eq!(
            serde_json::to_value(mapping.to_typed()).unwrap(),
            json!({"type": "AWS::SQS::Queue", "sourcePath": "Old/Queue/Resource", "destinationPath": "New.Queue2"})
        );
        assert_eq!(
            serde_json::to_value(mapping.to_cloudformation()).unwrap(),
            json!({
                "Source": {"StackName": "Old", "LogicalResourceId": "Queue"},
                "Destination": {"StackName": "New", "LogicalResourceId": "Queue2"}
            })
        );
    }

    fn deployed() -> Vec<CloudFormationStack> {
        vec![CloudFormationStack::new(
            "Old",
            env(),
            CloudFormationTemplate::from_value(json!({
                "Resources": {
                    "Queue": {"Type": "AWS::SQS::Queue"},
                    "Topic": {"Type": "AWS::SNS::Topic"}
                }
            }))
            .unwrap(),
        )]
    }

    #[test]
    fn test_mapping_file_parse_and_to_mappings() {
        let groups = MappingGroup::parse_file(
            r#"{"environments": [{"account": "123456789012", "region": "us-east-1",
                "resources": {"Old.Queue": "New.Queue"}}]}"#,
        )
        .unwrap();
        assert_eq!(groups.len(), 1);
        let mappings = groups[0].to_mappings(&deployed(), &[]).unwrap();
        assert_eq!(mappings, vec![ResourceMapping::new(loc("Old", "Queue"), loc("New", "Queue"))]);
        assert_eq!(mappings[0].destination.resource_type, "AWS::SQS::Queue");
    }

    #[test]
    fn test_duplicate_destination_is_validation_error() {
        let err = MappingGroup::parse_file(
            r#"{"environments": [{"account": "1", "region": "r",
                "resources": {"Old.Queue": "New.X", "Old.Topic": "New.X"}}]}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
        assert!(err.to_string().contains("Duplicate destination"));
    }

    #[test]
    fn test_placeholder_environment_is_validation_error() {
        let err = MappingGroup::parse_file(
            r#"{"environments": [{"account": "unknown-account", "region": "us-east-1",
                "resources": {"Old.Queue": "New.Queue"}}]}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
        assert!(err.to_string().contains("aws://unknown-account/us-east-1"));
    }

    #[test]
    fn test_malformed_location_is_validation_error() {
        assert!(parse_location("NoDot").is_err());
        assert!(parse_location(".Id").is_err());
        assert_eq!(parse_location("Stack.Id").unwrap(), ("Stack", "Id"));
    }

    #[test]
    fn test_missing_source_and_occupied_destination() {
        let mut resources = BTreeMap::new();
        resources.insert("Old.Missing".to_string(), "New.Queue".to_string());
        let group = MappingGroup {
            account: "123456789012".into(),
            region: "us-east-1".into(),
            resources,
        };
        assert_eq!(group.to_mappings(&deployed(), &[]).unwrap_err().kind(), "NotFoundError");

        let mut resources = BTreeMap::new();
        resources.insert("Old.Queue".to_string(), "Old.Topic".to_string());
        let group = MappingGroup { resources, ..group };
        assert_eq!(group.to_mappings(&deployed(), &[]).unwrap_err().kind(), "ValidationError");
    }

    #[test]
    fn test_reversed_swaps_direction() {
        let mut resources = BTreeMap::new();
        resources.insert("Old.Queue".to_string(), "New.Queue".to_string());
        let group = MappingGroup {
            account: "1".into(),
            region: "r".into(),
            resources,
        };
        assert_eq!(
            group.reversed().resources.get("New.Queue").map(String::as_str),
            Some("Old.Queue")
        );
    }
}
