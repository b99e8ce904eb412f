//! Content digests identifying "the same resource" across template revisions.
//!
//! A resource digest is the SHA-256 of a canonical (sorted-key, compact) JSON rendering of
//! the resource's `Type`, `Properties`, `DeletionPolicy`, `UpdateReplacePolicy` and
//! `DependsOn`. Before hashing, every reference to another resource is replaced by that
//! resource's digest, so renaming a dependency does not change its dependents' digests.
//! `Metadata` (including the `aws:cdk:path` construct path) never takes part.
//!
//! When the resource model for a type declares a primary identifier and every identifier
//! property is set, the digest covers only the type and those values: two resources
//! naming the same physical resource are the same resource.
//!
//! Digests are computed in dependency order ([`ResourceGraph::sorted_nodes`]). Resources
//! on or behind a dependency cycle start from a placeholder and are re-hashed a fixed
//! number of rounds, each round using the previous round's values. The result is
//! deterministic and independent of logical IDs, though not a true fixed point.

use crate::app::cfn_intrinsic_functions::Intrinsic;
use crate::app::cfn_resource_models::ResourceModelLoader;
use crate::app::cfn_template::{CloudFormationTemplate, TemplateResource};
use crate::app::refactor::environment::CloudFormationStack;
use crate::app::refactor::graph::{node_id, split_node_id, ReferenceResolver, ResourceGraph};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::trace;

/// Digest used for a dependency whose own digest is not known yet.
const UNRESOLVED_PLACEHOLDER: &str = "unresolved";

/// Re-hash rounds for resources on or behind a cycle.
const CYCLE_ROUNDS: usize = 8;

/// Resource attributes that take part in the digest.
const DIGESTED_ATTRIBUTES: &[&str] = &[
    "Type",
    "Properties",
    "DeletionPolicy",
    "UpdateReplacePolicy",
    "DependsOn",
];

/// Stack name used when digesting a lone template.
const STANDALONE_STACK: &str = "Template";

/// Digests for every resource of `stacks`, keyed by `"{stackName}.{logicalId}"`.
///
/// The stacks should belong to one environment: `Fn::ImportValue` is resolved against
/// the exports of exactly these stacks.
pub fn compute_resource_digests(
    stacks: &[CloudFormationStack],
    models: &dyn ResourceModelLoader,
) -> BTreeMap<String, String> {
    digest_resolved(&ReferenceResolver::from_stacks(stacks), models)
}

/// Digests for every resource of a single template, keyed by logical ID.
///
/// A missing or malformed `Resources` section yields an empty map.
pub fn compute_template_digests(
    template: &CloudFormationTemplate,
    models: &dyn ResourceModelLoader,
) -> BTreeMap<String, String> {
    let resolver = ReferenceResolver::new([(STANDALONE_STACK, template)]);
    digest_resolved(&resolver, models)
        .into_iter()
        .filter_map(|(node, digest)| {
            split_node_id(&node).map(|(_, logical_id)| (logical_id.to_string(), digest))
        })
        .collect()
}

/// SHA-256 hex of a template's compact JSON, used to name uploaded templates.
pub fn template_content_hash(template: &CloudFormationTemplate) -> String {
    sha256_hex(template.to_json_string().as_bytes())
}

fn digest_resolved(
    resolver: &ReferenceResolver<'_>,
    models: &dyn ResourceModelLoader,
) -> BTreeMap<String, String> {
    let graph = ResourceGraph::from_resolver(resolver);
    let resources: BTreeMap<String, (&str, TemplateResource<'_>)> = resolver
        .templates()
        .flat_map(|(stack_name, template)| {
            template
                .resources()
                .map(move |resource| (node_id(stack_name, resource.logical_id), (stack_name, resource)))
        })
        .collect();

    let digester = Digester { resolver, models };
    let mut digests: BTreeMap<String, String> = BTreeMap::new();

    for node in graph.sorted_nodes() {
        if let Some((stack_name, resource)) = resources.get(&node) {
            let digest = digester.digest(stack_name, resource, &digests);
            trace!("Digest of {}: {}", node, digest);
            digests.insert(node, digest);
        }
    }

    let unresolved: Vec<&String> = resources
        .keys()
        .filter(|node| !digests.contains_key(*node))
        .collect();
    if !unresolved.is_empty() {
        trace_warn!(
            "Digesting {} resource(s) on or behind a dependency cycle",
            unresolved.len()
        );
        for node in &unresolved {
            digests.insert((*node).clone(), UNRESOLVED_PLACEHOLDER.to_string());
        }
        for _ in 0..CYCLE_ROUNDS {
            let round: Vec<(String, String)> = unresolved
                .iter()
                .filter_map(|node| {
                    resources.get(*node).map(|(stack_name, resource)| {
                        ((*node).clone(), digester.digest(stack_name, resource, &digests))
                    })
                })
                .collect();
            digests.extend(round);
        }
    }

    digests
}

struct Digester<'r, 'a> {
    resolver: &'r ReferenceResolver<'a>,
    models: &'r dyn ResourceModelLoader,
}

impl Digester<'_, '_> {
    fn digest(
        &self,
        stack_name: &str,
        resource: &TemplateResource<'_>,
        digests: &BTreeMap<String, String>,
    ) -> String {
        let resource_type = resource.resource_type();

        if let Some(identifier) = self.primary_identifier_values(resource) {
            let values: Vec<Value> = identifier
                .iter()
                .map(|value| self.normalize(stack_name, value, digests, true))
                .collect();
            let input = json!({"Type": resource_type, "PrimaryIdentifier": values});
            return sha256_hex(canonical_json(&input).as_bytes());
        }

        let mut digested = Map::new();
        if let Some(body) = resource.body.as_object() {
            for attribute in DIGESTED_ATTRIBUTES {
                if let Some(value) = body.get(*attribute) {
                    digested.insert(attribute.to_string(), value.clone());
                }
            }
        }
        let normalized = self.normalize(stack_name, &Value::Object(digested), digests, true);
        sha256_hex(canonical_json(&normalized).as_bytes())
    }

    /// Identifier property values, if the type has a primary identifier and all of it is set.
    fn primary_identifier_values<'v>(&self, resource: &TemplateResource<'v>) -> Option<Vec<&'v Value>> {
        let model = self.models.load_resource_model(resource.resource_type())?;
        let identifier = model.primary_identifier.filter(|names| !names.is_empty())?;
        let properties = resource.properties()?;
        identifier
            .iter()
            .map(|name| properties.get(name))
            .collect::<Option<Vec<_>>>()
    }

    fn dependency_digest(&self, node: &str, digests: &BTreeMap<String, String>) -> String {
        digests
            .get(node)
            .cloned()
            .unwrap_or_else(|| UNRESOLVED_PLACEHOLDER.to_string())
    }

    /// Copy `value`, replacing resource references with the referenced resource's digest.
    /// References to parameters and pseudo parameters are kept as written.
    fn normalize(
        &self,
        stack_name: &str,
        value: &Value,
        digests: &BTreeMap<String, String>,
        follow_imports: bool,
    ) -> Value {
        match value {
            Value::Object(obj) => {
                let mut out = Map::new();
                for (key, child) in obj {
                    let replaced = match Intrinsic::classify(key, child) {
                        Intrinsic::Ref(target) => match self.resolver.resolve_local(stack_name, target) {
                            Some(node) => Value::String(self.dependency_digest(&node, digests)),
                            None => child.clone(),
                        },
                        Intrinsic::GetAtt {
                            logical_id,
                            attribute,
                        } => match self.resolver.resolve_local(stack_name, logical_id) {
                            Some(node) => json!([self.dependency_digest(&node, digests), attribute]),
                            None => child.clone(),
                        },
                        Intrinsic::ImportValue(export_name) => {
                            match self.resolver.resolve_import(export_name).filter(|_| follow_imports) {
                                Some(source) => {
                                    self.normalize(&source.stack_name, &source.value, digests, false)
                                }
                                None => child.clone(),
                            }
                        }
                        Intrinsic::DependsOn(targets) => {
                            let mut deps: Vec<String> = targets
                                .into_iter()
                                .map(|target| match self.resolver.resolve_local(stack_name, target) {
                                    Some(node) => self.dependency_digest(&node, digests),
                                    None => target.to_string(),
                                })
                                .collect();
                            deps.sort();
                            json!(deps)
                        }
                        Intrinsic::Plain(child) => {
                            self.normalize(stack_name, child, digests, follow_imports)
                        }
                    };
                    out.insert(key.clone(), replaced);
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.normalize(stack_name, item, digests, follow_imports))
                    .collect(),
            ),
            scalar => scalar.clone(),
        }
    }
}

/// Compact JSON with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(child) = obj.get(*key) {
                    write_canonical(child, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
