//! CloudFormation template representation and manipulation.
//!
//! Templates handled by the refactor engine come from two places: the `GetTemplate` API for
//! deployed stacks and the synthesized cloud assembly for local stacks. Both are kept as raw
//! JSON so that sections the engine does not understand survive untouched when a stack
//! definition is generated from them.
//!
//! # Core Components
//!
//! - [`CloudFormationTemplate`] - Order-preserving wrapper around the template JSON
//! - [`TemplateResource`] - Borrowed view of one entry of the `Resources` section
//! - [`ExportTable`] - Export name to producing stack/value lookup across stacks
//!
//! # Examples
//!
//! ```rust
//! use cdk_refactor::app::cfn_template::CloudFormationTemplate;
//!
//! let template = CloudFormationTemplate::from_json(
//!     r#"{"Resources": {"Bucket": {"Type": "AWS::S3::Bucket"}}}"#,
//! ).unwrap();
//! assert_eq!(template.resource_ids(), vec!["Bucket"]);
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Metadata key holding the CDK construct path of a resource.
pub const CONSTRUCT_PATH_METADATA: &str = "aws:cdk:path";

/// Metadata key a CDK app sets to keep a resource out of refactors.
pub const DO_NOT_REFACTOR_METADATA: &str = "aws:cdk:do-not-refactor";

/// Logical ID of the bookkeeping resource CDK adds to every stack.
pub const CDK_METADATA_RESOURCE: &str = "CDKMetadata";

/// Resource type of [`CDK_METADATA_RESOURCE`].
pub const CDK_METADATA_TYPE: &str = "AWS::CDK::Metadata";

/// A CloudFormation template kept as order-preserving JSON.
///
/// Accessors are lenient: a missing or non-object `Resources`/`Outputs` section reads as
/// empty instead of failing, because deployed templates are not under our control.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloudFormationTemplate {
    body: Map<String, Value>,
}

impl CloudFormationTemplate {
    /// Wrap an already parsed JSON value. Non-object values are rejected.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(body) => Ok(Self { body }),
            other => Err(anyhow!(
                "Template must be a JSON object, found {}",
                json_type_name(&other)
            )),
        }
    }

    /// Parse a JSON template body.
    pub fn from_json(json_content: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(json_content).context("Failed to parse JSON template")?;
        Self::from_value(value)
    }

    /// Parse a template body that may be JSON or YAML.
    ///
    /// YAML templates using short-form tags (`!Ref`) are not representable as plain data
    /// and fail to parse; callers treat that as "not a template we can refactor".
    pub fn parse(content: &str) -> Result<Self> {
        match Self::from_json(content) {
            Ok(template) => Ok(template),
            Err(json_err) => {
                let value: Value = serde_yaml::from_str(content).with_context(|| {
                    format!("Template is neither JSON ({}) nor plain YAML", json_err)
                })?;
                Self::from_value(value)
            }
        }
    }

    /// The raw template JSON.
    pub fn as_value(&self) -> Value {
        Value::Object(self.body.clone())
    }

    /// Serialize compactly, the form sent to CloudFormation.
    pub fn to_json_string(&self) -> String {
        // A Map<String, Value> always serializes
        serde_json::to_string(&self.body).unwrap_or_default()
    }

    /// Get a top-level section (`Resources`, `Outputs`, `Parameters`, ...).
    pub fn section(&self, name: &str) -> Option<&Map<String, Value>> {
        self.body.get(name).and_then(Value::as_object)
    }

    /// Remove a top-level section, returning it if it was present.
    pub fn remove_section(&mut self, name: &str) -> Option<Value> {
        self.body.shift_remove(name)
    }

    /// Iterate over resources in template order.
    pub fn resources(&self) -> impl Iterator<Item = TemplateResource<'_>> {
        self.section("Resources")
            .into_iter()
            .flat_map(|resources| resources.iter())
            .map(|(logical_id, body)| TemplateResource { logical_id, body })
    }

    /// Logical IDs of all resources in template order.
    pub fn resource_ids(&self) -> Vec<&str> {
        self.resources().map(|r| r.logical_id).collect()
    }

    /// Look up one resource.
    pub fn resource(&self, logical_id: &str) -> Option<TemplateResource<'_>> {
        self.section("Resources")
            .and_then(|resources| resources.get_key_value(logical_id))
            .map(|(logical_id, body)| TemplateResource { logical_id, body })
    }

    /// Insert or replace a resource, creating the `Resources` section if needed.
    pub fn set_resource(&mut self, logical_id: &str, body: Value) {
        let resources = self
            .body
            .entry("Resources")
            .or_insert_with(|| Value::Object(Map::new()));
        if !resources.is_object() {
            *resources = Value::Object(Map::new());
        }
        if let Value::Object(resources) = resources {
            resources.insert(logical_id.to_string(), body);
        }
    }

    /// Remove a resource, returning its body if it existed.
    pub fn remove_resource(&mut self, logical_id: &str) -> Option<Value> {
        self.body
            .get_mut("Resources")
            .and_then(Value::as_object_mut)
            .and_then(|resources| resources.shift_remove(logical_id))
    }

    /// Exports declared in `Outputs`, as `(export name, output value)` pairs.
    ///
    /// Only literal string export names can be matched against `Fn::ImportValue`, so
    /// computed names (`Fn::Sub` etc.) are skipped.
    pub fn exports(&self) -> Vec<(&str, &Value)> {
        self.section("Outputs")
            .into_iter()
            .flat_map(|outputs| outputs.values())
            .filter_map(|output| {
                let name = output.get("Export")?.get("Name")?.as_str()?;
                let value = output.get("Value")?;
                Some((name, value))
            })
            .collect()
    }

    /// Deep comparison that ignores object key order.
    pub fn is_equivalent_to(&self, other: &CloudFormationTemplate) -> bool {
        // serde_json's ordered map compares entries irrespective of insertion order
        self.body == other.body
    }
}

/// Borrowed view of a single template resource.
#[derive(Debug, Clone, Copy)]
pub struct TemplateResource<'a> {
    pub logical_id: &'a str,
    pub body: &'a Value,
}

impl<'a> TemplateResource<'a> {
    /// `Type` of the resource, empty if absent.
    pub fn resource_type(&self) -> &'a str {
        self.body.get("Type").and_then(Value::as_str).unwrap_or("")
    }

    /// `Properties` object, if present and an object.
    pub fn properties(&self) -> Option<&'a Map<String, Value>> {
        self.body.get("Properties").and_then(Value::as_object)
    }

    /// Entry of the resource `Metadata` section.
    pub fn metadata(&self, key: &str) -> Option<&'a Value> {
        self.body.get("Metadata")?.get(key)
    }

    /// CDK construct path recorded in metadata.
    pub fn construct_path(&self) -> Option<&'a str> {
        self.metadata(CONSTRUCT_PATH_METADATA).and_then(Value::as_str)
    }

    /// Whether the app opted this resource out of refactoring.
    pub fn is_refactor_disabled(&self) -> bool {
        match self.metadata(DO_NOT_REFACTOR_METADATA) {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(flag)) => flag.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }
}

/// Where an exported value comes from.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSource {
    pub stack_name: String,
    pub value: Value,
}

/// Export name to producing stack lookup, built from every stack's `Outputs`.
#[derive(Debug, Clone, Default)]
pub struct ExportTable {
    exports: BTreeMap<String, ExportSource>,
}

impl ExportTable {
    /// Build the table from `(stack name, template)` pairs. Later duplicates are ignored;
    /// CloudFormation rejects duplicate export names within a region anyway.
    pub fn from_templates<'a, I>(templates: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a CloudFormationTemplate)>,
    {
        let mut exports = BTreeMap::new();
        for (stack_name, template) in templates {
            for (name, value) in template.exports() {
                exports
                    .entry(name.to_string())
                    .or_insert_with(|| ExportSource {
                        stack_name: stack_name.to_string(),
                        value: value.clone(),
                    });
            }
        }
        Self { exports }
    }

    /// Resolve an `Fn::ImportValue` argument. Only literal names resolve.
    pub fn resolve(&self, export_name: &Value) -> Option<&ExportSource> {
        export_name.as_str().and_then(|name| self.exports.get(name))
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(value: Value) -> CloudFormationTemplate {
        CloudFormationTemplate::from_value(value).unwrap()
    }

    #[test]
    fn test_missing_resources_reads_as_empty() {
        let t = template(json!({"Description": "nothing here"}));
        assert_eq!(t.resources().count(), 0);

        let malformed = template(json!({"Resources": ["not", "an", "object"]}));
        assert_eq!(malformed.resources().count(), 0);
    }

    #[test]
    fn test_non_object_template_is_rejected() {
        assert!(CloudFormationTemplate::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn test_yaml_fallback() {
        let yaml = "Resources:\n  Queue:\n    Type: AWS::SQS::Queue\n";
        let t = CloudFormationTemplate::parse(yaml).unwrap();
        assert_eq!(t.resource("Queue").unwrap().resource_type(), "AWS::SQS::Queue");
    }

    #[test]
    fn test_set_and_remove_resource_preserve_order() {
        let mut t = template(json!({
            "Resources": {
                "A": {"Type": "AWS::SNS::Topic"},
                "B": {"Type": "AWS::SNS::Topic"},
                "C": {"Type": "AWS::SNS::Topic"}
            }
        }));
        t.remove_resource("B");
        t.set_resource("D", json!({"Type": "AWS::SQS::Queue"}));
        assert_eq!(t.resource_ids(), vec!["A", "C", "D"]);
    }

    #[test]
    fn test_equivalence_ignores_key_order() {
        let a = template(json!({"Resources": {"A": {"Type": "T", "Properties": {"X": 1, "Y": 2}}}}));
        let b = template(json!({"Resources": {"A": {"Properties": {"Y": 2, "X": 1}, "Type": "T"}}}));
        assert!(a.is_equivalent_to(&b));

        let c = template(json!({"Resources": {"A": {"Type": "T", "Properties": {"X": 1, "Y": 3}}}}));
        assert!(!a.is_equivalent_to(&c));
    }

    #[test]
    fn test_resource_metadata_helpers() {
        let t = template(json!({
            "Resources": {
                "Bucket": {
                    "Type": "AWS::S3::Bucket",
                    "Metadata": {
                        "aws:cdk:path": "App/Stack/Bucket/Resource",
                        "aws:cdk:do-not-refactor": true
                    }
                }
            }
        }));
        let bucket = t.resource("Bucket").unwrap();
        assert_eq!(bucket.construct_path(), Some("App/Stack/Bucket/Resource"));
        assert!(bucket.is_refactor_disabled());
    }

    #[test]
    fn test_export_table_resolves_literal_names() {
        let producer = template(json!({
            "Resources": {"Bucket": {"Type": "AWS::S3::Bucket"}},
            "Outputs": {
                "BucketOut": {
                    "Value": {"Ref": "Bucket"},
                    "Export": {"Name": "shared-bucket"}
                },
                "NoExport": {"Value": "x"}
            }
        }));
        let table = ExportTable::from_templates([("Producer", &producer)]);

        assert_eq!(table.len(), 1);
        let source = table.resolve(&json!("shared-bucket")).unwrap();
        assert_eq!(source.stack_name, "Producer");
        assert_eq!(source.value, json!({"Ref": "Bucket"}));
        assert!(table.resolve(&json!({"Fn::Sub": "shared-bucket"})).is_none());
    }
}
