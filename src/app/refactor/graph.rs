//! Resource dependency graph across one or more stacks.
//!
//! Nodes are `"{stackName}.{logicalId}"` strings. An edge `A -> B` means resource `A`
//! depends on resource `B`, discovered from `Ref`, `Fn::GetAtt`, `DependsOn` and
//! `Fn::ImportValue` (resolved through the `Outputs` exports of the stacks in the graph).
//!
//! # Core Components
//!
//! - [`ReferenceResolver`] - Resource index and export table shared with the digest
//!   calculator, so both agree on what a reference points at
//! - [`ResourceGraph`] - Immutable adjacency structure with topological ordering
//!
//! # Cycles
//!
//! CloudFormation rejects cyclic templates, but the graph is also built from local
//! templates that were never deployed. [`ResourceGraph::sorted_nodes`] therefore never
//! fails: nodes on or behind a cycle are simply left out of the ordering.

use crate::app::cfn_intrinsic_functions::{walk_intrinsics, Intrinsic};
use crate::app::cfn_template::{CloudFormationTemplate, ExportSource, ExportTable};
use crate::app::refactor::environment::CloudFormationStack;
use crate::app::refactor::error::{RefactorError, RefactorResult};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, warn};

/// Graph node identity of a resource.
pub fn node_id(stack_name: &str, logical_id: &str) -> String {
    format!("{}.{}", stack_name, logical_id)
}

/// Split a node identity back into `(stack name, logical id)`.
///
/// Stack names cannot contain dots, so the first dot is the separator.
pub fn split_node_id(node: &str) -> Option<(&str, &str)> {
    node.split_once('.')
}

/// Resolves references found in resource bodies to graph nodes.
pub struct ReferenceResolver<'a> {
    templates: BTreeMap<&'a str, &'a CloudFormationTemplate>,
    exports: ExportTable,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new<I>(templates: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a CloudFormationTemplate)>,
    {
        let templates: BTreeMap<&'a str, &'a CloudFormationTemplate> =
            templates.into_iter().collect();
        let exports = ExportTable::from_templates(templates.iter().map(|(s, t)| (*s, *t)));
        Self { templates, exports }
    }

    pub fn from_stacks(stacks: &'a [CloudFormationStack]) -> Self {
        Self::new(stacks.iter().map(|s| (s.stack_name.as_str(), &s.template)))
    }

    /// `(stack name, template)` pairs in stack name order.
    pub fn templates(&self) -> impl Iterator<Item = (&'a str, &'a CloudFormationTemplate)> + '_ {
        self.templates.iter().map(|(s, t)| (*s, *t))
    }

    /// Node for `logical_id` in `stack_name`, if that resource exists.
    pub fn resolve_local(&self, stack_name: &str, logical_id: &str) -> Option<String> {
        self.templates
            .get(stack_name)
            .and_then(|template| template.resource(logical_id))
            .map(|_| node_id(stack_name, logical_id))
    }

    /// Where an `Fn::ImportValue` argument is exported from.
    pub fn resolve_import(&self, export_name: &Value) -> Option<&ExportSource> {
        self.exports.resolve(export_name)
    }

    /// Every node the given resource body depends on.
    pub fn dependencies(&self, stack_name: &str, body: &Value) -> BTreeSet<String> {
        let mut deps = BTreeSet::new();
        walk_intrinsics(body, &mut |intrinsic| match intrinsic {
            Intrinsic::ImportValue(export_name) => match self.resolve_import(export_name) {
                Some(source) => deps.extend(self.local_references(&source.stack_name, &source.value)),
                None => debug!("Unresolved Fn::ImportValue {} in {}", export_name, stack_name),
            },
            other => deps.extend(
                other
                    .local_targets()
                    .into_iter()
                    .filter_map(|id| self.resolve_local(stack_name, id)),
            ),
        });
        deps
    }

    /// `Ref`/`Fn::GetAtt`/`DependsOn` targets inside an exported value. Imports of imports
    /// are not followed.
    fn local_references(&self, stack_name: &str, value: &Value) -> Vec<String> {
        let mut refs = Vec::new();
        walk_intrinsics(value, &mut |intrinsic| {
            refs.extend(
                intrinsic
                    .local_targets()
                    .into_iter()
                    .filter_map(|id| self.resolve_local(stack_name, id)),
            )
        });
        refs
    }
}

/// Immutable resource dependency graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceGraph {
    /// node -> nodes it depends on
    out_edges: BTreeMap<String, BTreeSet<String>>,
    /// node -> nodes depending on it
    in_edges: BTreeMap<String, BTreeSet<String>>,
}

impl ResourceGraph {
    /// Build the graph over every resource of `stacks`.
    pub fn from_stacks(stacks: &[CloudFormationStack]) -> Self {
        Self::from_resolver(&ReferenceResolver::from_stacks(stacks))
    }

    /// Build the graph over every resource known to `resolver`.
    pub fn from_resolver(resolver: &ReferenceResolver<'_>) -> Self {
        let mut out_edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut in_edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for (stack_name, template) in resolver.templates() {
            for resource in template.resources() {
                let node = node_id(stack_name, resource.logical_id);
                in_edges.entry(node.clone()).or_default();
                let mut deps = resolver.dependencies(stack_name, resource.body);
                // A resource referring to itself is not a dependency
                deps.remove(&node);
                out_edges.insert(node, deps);
            }
        }

        for (node, deps) in &out_edges {
            for dep in deps {
                in_edges.entry(dep.clone()).or_default().insert(node.clone());
            }
        }

        debug!(
            "Built resource graph with {} nodes and {} edges",
            out_edges.len(),
            out_edges.values().map(BTreeSet::len).sum::<usize>()
        );
        Self {
            out_edges,
            in_edges,
        }
    }

    /// All nodes in lexicographic order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.out_edges.keys().map(String::as_str)
    }

    pub fn contains(&self, node: &str) -> bool {
        self.out_edges.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.out_edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out_edges.is_empty()
    }

    /// Nodes depending on `node`.
    pub fn in_neighbors(&self, node: &str) -> RefactorResult<Vec<&str>> {
        self.in_edges
            .get(node)
            .map(|set| set.iter().map(String::as_str).collect())
            .ok_or_else(|| RefactorError::NodeNotFound(node.to_string()))
    }

    /// Nodes `node` depends on.
    pub fn out_neighbors(&self, node: &str) -> RefactorResult<Vec<&str>> {
        self.out_edges
            .get(node)
            .map(|set| set.iter().map(String::as_str).collect())
            .ok_or_else(|| RefactorError::NodeNotFound(node.to_string()))
    }

    /// Topological order, dependencies first (Kahn's algorithm from out-degree zero).
    ///
    /// Ties are broken lexicographically. Nodes on a cycle, and everything depending on
    /// one, are omitted; the result is then shorter than [`Self::len`].
    pub fn sorted_nodes(&self) -> Vec<String> {
        let mut remaining: BTreeMap<&str, usize> = self
            .out_edges
            .iter()
            .map(|(node, deps)| (node.as_str(), deps.len()))
            .collect();

        let mut queue: VecDeque<&str> = remaining
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| *node)
            .collect();

        let mut result = Vec::with_capacity(self.out_edges.len());
        while let Some(node) = queue.pop_front() {
            result.push(node.to_string());

            let Some(dependents) = self.in_edges.get(node) else {
                continue;
            };
            for dependent in dependents {
                if let Some(degree) = remaining.get_mut(dependent.as_str()) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        queue.push_back(dependent.as_str());
                    }
                }
            }
        }

        if result.len() != self.out_edges.len() {
            warn!(
                "Resource graph contains a cycle; {} of {} nodes could not be ordered",
                self.out_edges.len() - result.len(),
                self.out_edges.len()
            );
        }
        result
    }

    /// A new graph with every edge reversed.
    pub fn opposite(&self) -> Self {
        Self {
            out_edges: self.in_edges.clone(),
            in_edges: self.out_edges.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::refactor::environment::Environment;
    use serde_json::json;

    fn stack(name: &str, template: Value) -> CloudFormationStack {
        CloudFormationStack::new(
            name,
            Environment::new("123456789012", "us-east-1"),
            CloudFormationTemplate::from_value(template).unwrap(),
        )
    }

    #[test]
    fn test_edges_from_ref_getatt_and_depends_on() {
        let stacks = vec![stack(
            "App",
            json!({
                "Parameters": {"Env": {"Type": "String"}},
                "Resources": {
                    "Role": {"Type": "AWS::IAM::Role"},
                    "Table": {"Type": "AWS::DynamoDB::Table"},
                    "Fn": {
                        "Type": "AWS::Lambda::Function",
                        "DependsOn": "Table",
                        "Properties": {
                            "Role": {"Fn::GetAtt": ["Role", "Arn"]},
                            "Stage": {"Ref": "Env"},
                            "Region": {"Ref": "AWS::Region"}
                        }
                    }
                }
            }),
        )];

        let graph = ResourceGraph::from_stacks(&stacks);
        assert_eq!(graph.len(), 3);
        assert_eq!(
            graph.out_neighbors("App.Fn").unwrap(),
            vec!["App.Role", "App.Table"]
        );
        assert_eq!(graph.in_neighbors("App.Role").unwrap(), vec!["App.Fn"]);
    }

    #[test]
    fn test_import_value_resolves_to_exporting_stack() {
        let stacks = vec![
            stack(
                "Producer",
                json!({
                    "Resources": {"Bucket": {"Type": "AWS::S3::Bucket"}},
                    "Outputs": {
                        "BucketArn": {
                            "Value": {"Fn::GetAtt": ["Bucket", "Arn"]},
                            "Export": {"Name": "producer-bucket-arn"}
                        }
                    }
                }),
            ),
            stack(
                "Consumer",
                json!({
                    "Resources": {
                        "Policy": {
                            "Type": "AWS::IAM::Policy",
                            "Properties": {"Resource": {"Fn::ImportValue": "producer-bucket-arn"}}
                        }
                    }
                }),
            ),
        ];

        let graph = ResourceGraph::from_stacks(&stacks);
        assert_eq!(
            graph.out_neighbors("Consumer.Policy").unwrap(),
            vec!["Producer.Bucket"]
        );
    }

    #[test]
    fn test_sorted_nodes_puts_dependencies_first() {
        let stacks = vec![stack(
            "S",
            json!({
                "Resources": {
                    "C": {"Type": "T", "DependsOn": ["B"]},
                    "B": {"Type": "T", "Properties": {"X": {"Ref": "A"}}},
                    "A": {"Type": "T"}
                }
            }),
        )];
        let graph = ResourceGraph::from_stacks(&stacks);
        assert_eq!(graph.sorted_nodes(), vec!["S.A", "S.B", "S.C"]);
        assert_eq!(graph.opposite().sorted_nodes(), vec!["S.C", "S.B", "S.A"]);
    }

    #[test]
    fn test_cycle_does_not_panic_and_terminates() {
        let stacks = vec![stack(
            "S",
            json!({
                "Resources": {
                    "A": {"Type": "T", "DependsOn": "B"},
                    "B": {"Type": "T", "DependsOn": "A"},
                    "C": {"Type": "T"}
                }
            }),
        )];
        let graph = ResourceGraph::from_stacks(&stacks);
        assert_eq!(graph.sorted_nodes(), vec!["S.C"]);
    }

    #[test]
    fn test_unknown_node_is_node_not_found() {
        let graph = ResourceGraph::from_stacks(&[]);
        let err = graph.in_neighbors("S.Missing").unwrap_err();
        assert!(matches!(err, RefactorError::NodeNotFound(ref n) if n == "S.Missing"));
        assert!(graph.out_neighbors("S.Missing").is_err());
    }

    #[test]
    fn test_opposite_leaves_original_untouched() {
        let stacks = vec![stack(
            "S",
            json!({"Resources": {"A": {"Type": "T", "DependsOn": "B"}, "B": {"Type": "T"}}}),
        )];
        let graph = ResourceGraph::from_stacks(&stacks);
        let reversed = graph.opposite();
        assert_eq!(reversed.out_neighbors("S.B").unwrap(), vec!["S.A"]);
        assert_eq!(graph.out_neighbors("S.B").unwrap(), Vec::<&str>::new());
    }
}
