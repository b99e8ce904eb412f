//! CloudFormation intrinsic function detection and classification utilities
//!
//! All knowledge about which JSON shapes create dependencies between resources lives in
//! this module. Both the resource graph and the digest calculator walk templates through
//! [`Intrinsic::classify`], so the two always agree on what counts as a reference.
//!
//! Classification works on a single `(key, value)` entry of a JSON object:
//!
//! - `"Ref": "X"` becomes [`Intrinsic::Ref`]
//! - `"Fn::GetAtt": ["X", "Attr"]` or `"Fn::GetAtt": "X.Attr"` becomes [`Intrinsic::GetAtt`]
//! - `"Fn::ImportValue": <export name>` becomes [`Intrinsic::ImportValue`]
//! - `"DependsOn": "X"` or `"DependsOn": ["X", "Y"]` becomes [`Intrinsic::DependsOn`]
//! - anything else is [`Intrinsic::Plain`] and should be recursed into

use serde_json::Value;

const REF: &str = "Ref";
const GET_ATT: &str = "Fn::GetAtt";
const IMPORT_VALUE: &str = "Fn::ImportValue";
const DEPENDS_ON: &str = "DependsOn";

/// One classified entry of a JSON object inside a template.
#[derive(Debug, Clone, PartialEq)]
pub enum Intrinsic<'a> {
    /// `{"Ref": "X"}`; `X` may be a resource, parameter or pseudo parameter
    Ref(&'a str),
    /// `{"Fn::GetAtt": ["X", "Attr"]}` or the dotted string form `"X.Attr"`
    GetAtt {
        logical_id: &'a str,
        attribute: Option<&'a str>,
    },
    /// `{"Fn::ImportValue": ...}` with the (possibly non-literal) export name
    ImportValue(&'a Value),
    /// Resource-level `DependsOn` attribute
    DependsOn(Vec<&'a str>),
    /// Not a reference; recurse into the value
    Plain(&'a Value),
}

impl<'a> Intrinsic<'a> {
    /// Classify a single `(key, value)` entry of a JSON object.
    pub fn classify(key: &str, value: &'a Value) -> Intrinsic<'a> {
        match (key, value) {
            (REF, Value::String(target)) => Intrinsic::Ref(target),
            (GET_ATT, Value::Array(parts)) => match parts.first().and_then(Value::as_str) {
                Some(logical_id) => Intrinsic::GetAtt {
                    logical_id,
                    attribute: parts.get(1).and_then(Value::as_str),
                },
                None => Intrinsic::Plain(value),
            },
            (GET_ATT, Value::String(dotted)) => {
                let (logical_id, attribute) = match dotted.split_once('.') {
                    Some((id, attr)) => (id, Some(attr)),
                    None => (dotted.as_str(), None),
                };
                Intrinsic::GetAtt {
                    logical_id,
                    attribute,
                }
            }
            (IMPORT_VALUE, _) => Intrinsic::ImportValue(value),
            (DEPENDS_ON, Value::String(dep)) => Intrinsic::DependsOn(vec![dep.as_str()]),
            (DEPENDS_ON, Value::Array(deps)) => {
                Intrinsic::DependsOn(deps.iter().filter_map(Value::as_str).collect())
            }
            _ => Intrinsic::Plain(value),
        }
    }

    /// The logical IDs this entry points at within its own template.
    ///
    /// `ImportValue` targets live in other stacks and need an export table to resolve,
    /// so they are not included here.
    pub fn local_targets(&self) -> Vec<&'a str> {
        match self {
            Intrinsic::Ref(id) => vec![*id],
            Intrinsic::GetAtt { logical_id, .. } => vec![*logical_id],
            Intrinsic::DependsOn(ids) => ids.clone(),
            Intrinsic::ImportValue(_) | Intrinsic::Plain(_) => Vec::new(),
        }
    }
}

/// Visit every classified entry in `value`, depth first.
///
/// The visitor sees each object entry once. `Plain` entries are recursed into after the
/// visitor has seen them; reference entries are not, since their payload is the
/// reference itself (an `ImportValue` name expression is handled by the caller).
pub fn walk_intrinsics<'a, F>(value: &'a Value, visitor: &mut F)
where
    F: FnMut(Intrinsic<'a>),
{
    match value {
        Value::Object(obj) => {
            for (key, child) in obj {
                let intrinsic = Intrinsic::classify(key, child);
                let recurse = matches!(intrinsic, Intrinsic::Plain(_));
                visitor(intrinsic);
                if recurse {
                    walk_intrinsics(child, visitor);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_intrinsics(item, visitor);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_function_is_plain() {
        let value = json!("text ${Bucket}");
        assert!(matches!(
            Intrinsic::classify("Fn::Sub", &value),
            Intrinsic::Plain(_)
        ));
    }

    #[test]
    fn test_classify_getatt_forms() {
        let array_form = json!(["Queue", "Arn"]);
        assert_eq!(
            Intrinsic::classify("Fn::GetAtt", &array_form),
            Intrinsic::GetAtt {
                logical_id: "Queue",
                attribute: Some("Arn")
            }
        );

        let dotted = json!("Queue.Arn");
        assert_eq!(
            Intrinsic::classify("Fn::GetAtt", &dotted),
            Intrinsic::GetAtt {
                logical_id: "Queue",
                attribute: Some("Arn")
            }
        );
    }

    #[test]
    fn test_classify_depends_on_forms() {
        let single = json!("A");
        assert_eq!(
            Intrinsic::classify("DependsOn", &single),
            Intrinsic::DependsOn(vec!["A"])
        );

        let many = json!(["A", "B"]);
        assert_eq!(
            Intrinsic::classify("DependsOn", &many).local_targets(),
            vec!["A", "B"]
        );
    }

    #[test]
    fn test_ref_to_non_string_is_plain() {
        let value = json!({"Fn::Sub": "x"});
        assert!(matches!(
            Intrinsic::classify("Ref", &value),
            Intrinsic::Plain(_)
        ));
    }

    #[test]
    fn test_walk_finds_nested_references() {
        let body = json!({
            "Type": "AWS::Lambda::Function",
            "DependsOn": "Role",
            "Properties": {
                "Role": {"Fn::GetAtt": ["Role", "Arn"]},
                "Environment": {"Variables": {"TABLE": {"Ref": "Table"}}},
                "Layers": [{"Fn::ImportValue": "SharedLayer"}]
            }
        });

        let mut targets = Vec::new();
        let mut imports = 0;
        walk_intrinsics(&body, &mut |intrinsic| match intrinsic {
            Intrinsic::ImportValue(_) => imports += 1,
            other => targets.extend(other.local_targets()),
        });
        targets.sort();

        assert_eq!(targets, vec!["Role", "Role", "Table"]);
        assert_eq!(imports, 1);
    }
}
