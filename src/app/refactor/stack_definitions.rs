//! Stack definitions for a refactor: the full target template of every affected stack.
//!
//! Which stacks get a definition:
//!
//! - a local stack that is also deployed, when its template differs from the deployed
//!   one after the deployed `CDKMetadata` resource has been spliced in (or removed, when
//!   the deployed stack has none)
//! - a local stack that is not deployed yet, when it receives a mapped resource; its
//!   `Rules` and `Parameters` are removed since a refactor cannot create stacks with them
//! - a deployed stack that has no local counterpart but loses resources to a mapping;
//!   its definition is the deployed template minus those resources, without `Outputs`
//!
//! Templates up to [`TEMPLATE_BODY_LIMIT`] bytes are sent inline. When any template is
//! larger, the environment's toolkit bucket must exist; oversized templates are uploaded
//! there and referenced by URL while the rest stay inline.

use crate::app::aws_client::CloudFormationApi;
use crate::app::cfn_template::{CloudFormationTemplate, CDK_METADATA_RESOURCE};
use crate::app::refactor::digest::template_content_hash;
use crate::app::refactor::environment::{CloudFormationStack, Environment};
use crate::app::refactor::error::{RefactorError, RefactorResult};
use crate::app::refactor::mapping::ResourceMapping;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Largest template CloudFormation accepts as `TemplateBody`.
pub const TEMPLATE_BODY_LIMIT: usize = 50 * 1024;

/// Key prefix for templates uploaded to the toolkit bucket.
pub const UPLOAD_PREFIX: &str = "cdk-refactor";

/// One entry of `CreateStackRefactor`'s `StackDefinitions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StackDefinition {
    pub stack_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_body: Option<String>,
    #[serde(rename = "TemplateURL", skip_serializing_if = "Option::is_none")]
    pub template_url: Option<String>,
}

/// Target templates of every stack the mappings affect, before the size policy.
///
/// Returned in stack name order.
pub fn target_templates(
    mappings: &[ResourceMapping],
    deployed: &[CloudFormationStack],
    local: &[CloudFormationStack],
) -> Vec<(String, CloudFormationTemplate)> {
    let deployed_by_name: BTreeMap<&str, &CloudFormationStack> =
        deployed.iter().map(|s| (s.stack_name.as_str(), s)).collect();
    let local_names: BTreeSet<&str> = local.iter().map(|s| s.stack_name.as_str()).collect();
    let destination_stacks: BTreeSet<&str> = mappings
        .iter()
        .map(|m| m.destination.stack_name())
        .collect();

    let mut targets: BTreeMap<String, CloudFormationTemplate> = BTreeMap::new();

    for stack in local {
        let mut template = stack.template.clone();
        match deployed_by_name.get(stack.stack_name.as_str()) {
            Some(deployed_stack) => {
                match deployed_stack.template.resource(CDK_METADATA_RESOURCE) {
                    Some(metadata) => template.set_resource(CDK_METADATA_RESOURCE, metadata.body.clone()),
                    None => {
                        template.remove_resource(CDK_METADATA_RESOURCE);
                    }
                }
                if template.is_equivalent_to(&deployed_stack.template) {
                    debug!("Stack {} is unchanged", stack.stack_name);
                    continue;
                }
            }
            None if destination_stacks.contains(stack.stack_name.as_str()) => {
                template.remove_resource(CDK_METADATA_RESOURCE);
                template.remove_section("Rules");
                template.remove_section("Parameters");
            }
            None => {
                debug!(
                    "Stack {} is new and receives no resources; leaving it to deployment",
                    stack.stack_name
                );
                continue;
            }
        }
        targets.insert(stack.stack_name.clone(), template);
    }

    let mut emptied: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for mapping in mappings {
        let stack_name = mapping.source.stack_name();
        if !local_names.contains(stack_name) {
            emptied
                .entry(stack_name)
                .or_default()
                .push(mapping.source.logical_resource_id.as_str());
        }
    }
    for (stack_name, logical_ids) in emptied {
        let Some(deployed_stack) = deployed_by_name.get(stack_name) else {
            continue;
        };
        let mut template = deployed_stack.template.clone();
        for logical_id in logical_ids {
            template.remove_resource(logical_id);
        }
        template.remove_section("Outputs");
        targets.insert(stack_name.to_string(), template);
    }

    targets.into_iter().collect()
}

/// Build the stack definitions for one environment, uploading oversized templates.
pub async fn generate_stack_definitions(
    mappings: &[ResourceMapping],
    deployed: &[CloudFormationStack],
    local: &[CloudFormationStack],
    environment: &Environment,
    api: &dyn CloudFormationApi,
) -> RefactorResult<Vec<StackDefinition>> {
    let rendered: Vec<(String, CloudFormationTemplate, String)> =
        target_templates(mappings, deployed, local)
            .into_iter()
            .map(|(name, template)| {
                let body = template.to_json_string();
                (name, template, body)
            })
            .collect();

    let oversized = rendered
        .iter()
        .find(|(_, _, body)| body.len() > TEMPLATE_BODY_LIMIT);

    let toolkit = match oversized {
        None => None,
        Some((stack_name, _, body)) => match api.lookup_toolkit(environment).await? {
            Some(toolkit) => Some(toolkit),
            None => {
                return Err(RefactorError::TemplateTooLarge {
                    stack_name: stack_name.clone(),
                    size: body.len(),
                })
            }
        },
    };

    let mut definitions = Vec::with_capacity(rendered.len());
    for (stack_name, template, body) in rendered {
        let definition = match &toolkit {
            Some(toolkit) if body.len() > TEMPLATE_BODY_LIMIT => {
                let key = format!(
                    "{}/{}/{}.json",
                    UPLOAD_PREFIX,
                    stack_name,
                    template_content_hash(&template)
                );
                info!(
                    "Uploading {} byte template for {} to s3://{}/{}",
                    body.len(),
                    stack_name,
                    toolkit.bucket_name,
                    key
                );
                api.upload_object(environment, &toolkit.bucket_name, &key, body.into_bytes())
                    .await?;
                StackDefinition {
                    template_url: Some(toolkit.object_url(&environment.region, &key)),
                    stack_name,
                    template_body: None,
                }
            }
            _ => StackDefinition {
                stack_name,
                template_body: Some(body),
                template_url: None,
            },
        };
        definitions.push(definition);
    }
    Ok(definitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::refactor::environment::StackRef;
    use crate::app::refactor::movement::ResourceLocation;
    use serde_json::{json, Value};

    fn env() -> Environment {
        Environment::new("123456789012", "us-east-1")
    }

    fn stack(name: &str, template: Value) -> CloudFormationStack {
        CloudFormationStack::new(name, env(), CloudFormationTemplate::from_value(template).unwrap())
    }

    fn mapping(from: (&str, &str), to: (&str, &str)) -> ResourceMapping {
        let loc = |(stack, id): (&str, &str)| {
            ResourceLocation::new(
                StackRef {
                    stack_name: stack.into(),
                    environment: env(),
                },
                id,
            )
        };
        ResourceMapping::new(loc(from), loc(to))
    }

    #[test]
    fn test_new_destination_stack_keeps_resources_without_bookkeeping() {
        let deployed = vec![stack(
            "A",
            json!({"Resources": {
                "Topic": {"Type": "AWS::SNS::Topic"},
                "Queue": {"Type": "AWS::SQS::Queue"}
            }}),
        )];
        let local = vec![
            stack(
                "A",
                json!({"Resources": {"Queue": {"Type": "AWS::SQS::Queue"}}}),
            ),
            stack(
                "B",
                json!({
                    "Parameters": {"BootstrapVersion": {"Type": "AWS::SSM::Parameter::Value<String>"}},
                    "Rules": {"CheckBootstrapVersion": {"Assertions": []}},
                    "Resources": {
                        "CDKMetadata": {"Type": "AWS::CDK::Metadata", "Properties": {"Analytics": "local"}},
                        "Topic": {"Type": "AWS::SNS::Topic"},
                        "Alarm": {"Type": "AWS::CloudWatch::Alarm"}
                    }
                }),
            ),
            stack(
                "C",
                json!({"Resources": {"Fresh": {"Type": "AWS::SNS::Topic"}}}),
            ),
        ];
        let mappings = vec![mapping(("A", "Topic"), ("B", "Topic"))];

        let targets: BTreeMap<String, CloudFormationTemplate> =
            target_templates(&mappings, &deployed, &local).into_iter().collect();

        let names: Vec<&str> = targets.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["A", "B"]);
        let b = &targets["B"];
        assert_eq!(b.resource_ids(), vec!["Topic", "Alarm"]);
        assert!(b.section("Rules").is_none());
        assert!(b.section("Parameters").is_none());
    }

    #[test]
    fn test_deployed_cdk_metadata_is_spliced_into_local() {
        let deployed = vec![stack(
            "A",
            json!({"Resources": {
                "CDKMetadata": {"Type": "AWS::CDK::Metadata", "Properties": {"Analytics": "deployed"}},
                "Old": {"Type": "AWS::SNS::Topic"}
            }}),
        )];
        let local = vec![stack(
            "A",
            json!({"Resources": {
                "CDKMetadata": {"Type": "AWS::CDK::Metadata", "Properties": {"Analytics": "local"}},
                "New": {"Type": "AWS::SNS::Topic"}
            }}),
        )];
        let targets = target_templates(&[mapping(("A", "Old"), ("A", "New"))], &deployed, &local);
        assert_eq!(targets.len(), 1);
        let metadata = targets[0].1.resource("CDKMetadata").unwrap();
        assert_eq!(metadata.body["Properties"]["Analytics"], json!("deployed"));
    }

    #[test]
    fn test_unchanged_stack_is_skipped_and_missing_metadata_stripped() {
        let deployed = vec![stack("A", json!({"Resources": {"T": {"Type": "AWS::SNS::Topic"}}}))];
        let local = vec![stack(
            "A",
            json!({"Resources": {
                "T": {"Type": "AWS::SNS::Topic"},
                "CDKMetadata": {"Type": "AWS::CDK::Metadata"}
            }}),
        )];
        assert!(target_templates(&[], &deployed, &local).is_empty());
    }

    #[test]
    fn test_source_only_stack_loses_mapped_resources_and_outputs() {
        let deployed = vec![stack(
            "Old",
            json!({
                "Resources": {"Moved": {"Type": "AWS::SQS::Queue"}, "Kept": {"Type": "AWS::SNS::Topic"}},
                "Outputs": {"Url": {"Value": {"Ref": "Moved"}}}
            }),
        )];
        let local = vec![stack(
            "New",
            json!({
                "Parameters": {"BootstrapVersion": {"Type": "String"}},
                "Rules": {"CheckBootstrapVersion": {}},
                "Resources": {"Moved": {"Type": "AWS::SQS::Queue"}}
            }),
        )];
        let targets = target_templates(&[mapping(("Old", "Moved"), ("New", "Moved"))], &deployed, &local);

        let names: Vec<&str> = targets.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["New", "Old"]);

        let new = &targets[0].1;
        assert!(new.section("Parameters").is_none());
        assert!(new.section("Rules").is_none());

        let old = &targets[1].1;
        assert_eq!(old.resource_ids(), vec!["Kept"]);
        assert!(old.section("Outputs").is_none());
    }

    #[test]
    fn test_new_stack_without_mappings_is_left_out() {
        let local = vec![stack("Fresh", json!({"Resources": {"T": {"Type": "AWS::SNS::Topic"}}}))];
        assert!(target_templates(&[], &[], &local).is_empty());
    }

    #[test]
    fn test_stack_definition_serialization() {
        let inline = StackDefinition {
            stack_name: "A".into(),
            template_body: Some("{}".into()),
            template_url: None,
        };
        assert_eq!(
            serde_json::to_value(&inline).unwrap(),
            json!({"StackName": "A", "TemplateBody": "{}"})
        );
        let uploaded = StackDefinition {
            stack_name: "B".into(),
            template_body: None,
            template_url: Some("https://b/k.json".into()),
        };
        assert_eq!(
            serde_json::to_value(&uploaded).unwrap(),
            json!({"StackName": "B", "TemplateURL": "https://b/k.json"})
        );
    }
}
