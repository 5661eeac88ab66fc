//! Boolean condition trees over entity fields.
//!
//! Evaluation is pure and total: every well-formed tree yields a boolean for
//! every snapshot. A leaf over a field the snapshot does not have is `false`,
//! whatever the operator. An empty `And` is `true` and an empty `Or` is
//! `false`.

use chrono::{DateTime, Utc};
use flowrule_core::EntitySnapshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Deepest tree accepted by [`ConditionNode::validate`].
pub const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    Gt,
    Lt,
    In,
    IsEmpty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionNode {
    Leaf {
        field: String,
        operator: Operator,
        #[serde(default)]
        value: Value,
    },
    And {
        #[serde(default)]
        children: Vec<ConditionNode>,
    },
    Or {
        #[serde(default)]
        children: Vec<ConditionNode>,
    },
}

impl Default for ConditionNode {
    fn default() -> Self {
        ConditionNode::always()
    }
}

impl ConditionNode {
    /// The empty conjunction, which always passes.
    pub fn always() -> Self {
        ConditionNode::And {
            children: Vec::new(),
        }
    }

    pub fn leaf(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        ConditionNode::Leaf {
            field: field.into(),
            operator,
            value,
        }
    }

    pub fn and(children: Vec<ConditionNode>) -> Self {
        ConditionNode::And { children }
    }

    pub fn or(children: Vec<ConditionNode>) -> Self {
        ConditionNode::Or { children }
    }

    pub fn depth(&self) -> usize {
        match self {
            ConditionNode::Leaf { .. } => 1,
            ConditionNode::And { children } | ConditionNode::Or { children } => {
                1 + children.iter().map(|c| c.depth()).max().unwrap_or(0)
            }
        }
    }

    /// Reject trees that are well-typed JSON but not meaningful.
    pub fn validate(&self) -> Result<(), String> {
        if self.depth() > MAX_DEPTH {
            return Err(format!("condition tree deeper than {} levels", MAX_DEPTH));
        }
        self.validate_node()
    }

    fn validate_node(&self) -> Result<(), String> {
        match self {
            ConditionNode::Leaf {
                field,
                operator,
                value,
            } => {
                if field.trim().is_empty() {
                    return Err("condition field name is empty".to_string());
                }
                match operator {
                    Operator::In if !value.is_array() => {
                        Err(format!("operator 'in' on '{}' needs a list value", field))
                    }
                    Operator::Gt | Operator::Lt if !(value.is_number() || value.is_string()) => {
                        Err(format!(
                            "ordering operator on '{}' needs a number, date, or string value",
                            field
                        ))
                    }
                    _ => Ok(()),
                }
            }
            ConditionNode::And { children } | ConditionNode::Or { children } => {
                children.iter().try_for_each(|c| c.validate_node())
            }
        }
    }
}

/// Evaluate `node` against `snapshot`.
pub fn evaluate(node: &ConditionNode, snapshot: &EntitySnapshot) -> bool {
    evaluate_at(node, snapshot, 0)
}

fn evaluate_at(node: &ConditionNode, snapshot: &EntitySnapshot, depth: usize) -> bool {
    // Unvalidated trees can still arrive from storage.
    if depth >= MAX_DEPTH {
        return false;
    }

    match node {
        ConditionNode::Leaf {
            field,
            operator,
            value,
        } => match lookup(snapshot, field) {
            Some(actual) => apply(*operator, actual, value),
            None => false,
        },
        ConditionNode::And { children } => children
            .iter()
            .all(|c| evaluate_at(c, snapshot, depth + 1)),
        ConditionNode::Or { children } => children
            .iter()
            .any(|c| evaluate_at(c, snapshot, depth + 1)),
    }
}

/// Resolve a field, following dots into nested objects.
pub(crate) fn lookup<'a>(snapshot: &'a EntitySnapshot, field: &str) -> Option<&'a Value> {
    if let Some(value) = snapshot.get(field) {
        return Some(value);
    }

    let mut parts = field.split('.');
    let mut current = snapshot.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn apply(operator: Operator, actual: &Value, expected: &Value) -> bool {
    match operator {
        Operator::Equals => values_equal(actual, expected),
        Operator::NotEquals => !values_equal(actual, expected),
        Operator::Contains => contains(actual, expected),
        Operator::Gt => compare(actual, expected) == Some(Ordering::Greater),
        Operator::Lt => compare(actual, expected) == Some(Ordering::Less),
        Operator::In => match expected {
            Value::Array(options) => match actual {
                Value::Array(items) => items
                    .iter()
                    .any(|item| options.iter().any(|o| values_equal(item, o))),
                _ => options.iter().any(|o| values_equal(actual, o)),
            },
            _ => false,
        },
        Operator::IsEmpty => is_empty(actual),
    }
}

/// Equality after coercing both sides to a common type.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            match (n.as_f64(), s.trim().parse::<f64>()) {
                (Some(x), Ok(y)) => x == y,
                _ => false,
            }
        }
        (Value::Bool(x), Value::String(s)) | (Value::String(s), Value::Bool(x)) => {
            s.trim().parse::<bool>().map(|y| *x == y).unwrap_or(false)
        }
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len()
                && xs.iter().all(|x| ys.iter().any(|y| values_equal(x, y)))
                && ys.iter().all(|y| xs.iter().any(|x| values_equal(x, y)))
        }
        _ => a == b,
    }
}

fn contains(actual: &Value, needle: &Value) -> bool {
    match actual {
        Value::String(haystack) => match needle {
            Value::String(n) => haystack.contains(n.as_str()),
            Value::Number(n) => haystack.contains(&n.to_string()),
            _ => false,
        },
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => needle.as_str().map(|k| map.contains_key(k)).unwrap_or(false),
        _ => false,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => match (as_datetime(x), as_datetime(y)) {
            (Some(dx), Some(dy)) => Some(dx.cmp(&dy)),
            _ => Some(x.as_str().cmp(y.as_str())),
        },
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|d| d.and_utc())
        })
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrule_core::{EntityId, ProjectId, WorkspaceId};
    use serde_json::json;

    fn snapshot() -> EntitySnapshot {
        EntitySnapshot::new(EntityId::new(), ProjectId::new(), WorkspaceId::new(), "work_item")
            .with_field("priority", json!("high"))
            .with_field("estimate", json!(5))
            .with_field("estimate_text", json!("8"))
            .with_field("labels", json!(["bug", "ui"]))
            .with_field("title", json!("Login button broken"))
            .with_field("description", json!(""))
            .with_field("assignee", Value::Null)
            .with_field("target_date", json!("2024-06-01"))
            .with_field("meta", json!({"source": {"kind": "import"}}))
            .with_field("blocked", json!(false))
    }

    fn leaf(field: &str, operator: Operator, value: Value) -> ConditionNode {
        ConditionNode::leaf(field, operator, value)
    }

    #[test]
    fn test_identity_elements() {
        let empty = EntitySnapshot::new(EntityId::new(), ProjectId::new(), WorkspaceId::new(), "x");
        for s in [snapshot(), empty] {
            assert!(evaluate(&ConditionNode::and(vec![]), &s));
            assert!(!evaluate(&ConditionNode::or(vec![]), &s));
            assert!(evaluate(&ConditionNode::default(), &s));
        }
    }

    #[test]
    fn test_missing_field_is_false_for_every_operator() {
        let s = snapshot();
        for op in [
            Operator::Equals,
            Operator::NotEquals,
            Operator::Contains,
            Operator::Gt,
            Operator::Lt,
            Operator::In,
            Operator::IsEmpty,
        ] {
            assert!(!evaluate(&leaf("missing", op, json!([1])), &s), "{:?}", op);
        }
    }

    #[test]
    fn test_equality_with_coercion() {
        let s = snapshot();
        assert!(evaluate(&leaf("priority", Operator::Equals, json!("high")), &s));
        assert!(!evaluate(&leaf("priority", Operator::Equals, json!("low")), &s));
        assert!(evaluate(&leaf("priority", Operator::NotEquals, json!("low")), &s));
        assert!(evaluate(&leaf("estimate", Operator::Equals, json!("5")), &s));
        assert!(evaluate(&leaf("estimate", Operator::Equals, json!(5.0)), &s));
        assert!(evaluate(&leaf("blocked", Operator::Equals, json!("false")), &s));
        assert!(evaluate(&leaf("labels", Operator::Equals, json!(["ui", "bug"])), &s));
        assert!(evaluate(&leaf("assignee", Operator::Equals, Value::Null), &s));
    }

    #[test]
    fn test_contains() {
        let s = snapshot();
        assert!(evaluate(&leaf("title", Operator::Contains, json!("button")), &s));
        assert!(!evaluate(&leaf("title", Operator::Contains, json!("modal")), &s));
        assert!(evaluate(&leaf("labels", Operator::Contains, json!("bug")), &s));
        assert!(!evaluate(&leaf("estimate", Operator::Contains, json!(5)), &s));
    }

    #[test]
    fn test_ordering() {
        let s = snapshot();
        assert!(evaluate(&leaf("estimate", Operator::Gt, json!(3)), &s));
        assert!(evaluate(&leaf("estimate", Operator::Lt, json!("10")), &s));
        assert!(evaluate(&leaf("estimate_text", Operator::Gt, json!(5)), &s));
        assert!(evaluate(&leaf("target_date", Operator::Lt, json!("2024-07-01T00:00:00Z")), &s));
        assert!(!evaluate(&leaf("labels", Operator::Gt, json!(1)), &s));
    }

    #[test]
    fn test_in_and_is_empty() {
        let s = snapshot();
        assert!(evaluate(&leaf("priority", Operator::In, json!(["urgent", "high"])), &s));
        assert!(evaluate(&leaf("labels", Operator::In, json!(["ui"])), &s));
        assert!(!evaluate(&leaf("priority", Operator::In, json!("high")), &s));
        assert!(evaluate(&leaf("description", Operator::IsEmpty, Value::Null), &s));
        assert!(evaluate(&leaf("assignee", Operator::IsEmpty, Value::Null), &s));
        assert!(!evaluate(&leaf("title", Operator::IsEmpty, Value::Null), &s));
    }

    #[test]
    fn test_nested_field() {
        let s = snapshot();
        assert!(evaluate(&leaf("meta.source.kind", Operator::Equals, json!("import")), &s));
        assert!(!evaluate(&leaf("meta.source.missing", Operator::Equals, json!("import")), &s));
    }

    #[test]
    fn test_combinators() {
        let s = snapshot();
        let tree = ConditionNode::and(vec![
            leaf("priority", Operator::Equals, json!("high")),
            ConditionNode::or(vec![
                leaf("missing", Operator::Equals, json!(1)),
                leaf("labels", Operator::Contains, json!("ui")),
            ]),
        ]);
        assert!(evaluate(&tree, &s));

        let tree = ConditionNode::or(vec![
            leaf("priority", Operator::Equals, json!("low")),
            ConditionNode::and(vec![leaf("missing", Operator::IsEmpty, Value::Null)]),
        ]);
        assert!(!evaluate(&tree, &s));
    }

    #[test]
    fn test_validate() {
        assert!(ConditionNode::always().validate().is_ok());
        assert!(leaf("", Operator::Equals, json!(1)).validate().is_err());
        assert!(leaf("priority", Operator::In, json!("high")).validate().is_err());
        assert!(leaf("estimate", Operator::Gt, json!([1])).validate().is_err());

        let mut deep = leaf("priority", Operator::Equals, json!("high"));
        for _ in 0..MAX_DEPTH {
            deep = ConditionNode::and(vec![deep]);
        }
        assert!(deep.validate().is_err());
        // Still total.
        assert!(!evaluate(&deep, &snapshot()));
    }

    #[test]
    fn test_deserialize_tree() {
        let tree: ConditionNode = serde_json::from_value(json!({
            "type": "and",
            "children": [
                {"type": "leaf", "field": "priority", "operator": "equals", "value": "high"},
                {"type": "or"}
            ]
        }))
        .unwrap();
        assert!(!evaluate(&tree, &snapshot()));
    }
}
