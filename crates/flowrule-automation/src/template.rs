//! `{{field}}` interpolation against an entity snapshot.

use crate::condition::lookup;
use flowrule_core::EntitySnapshot;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}\}").expect("placeholder pattern is valid")
});

/// Replace every `{{field}}` with the snapshot's value. Missing fields render
/// as the empty string.
pub fn render(template: &str, snapshot: &EntitySnapshot) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            resolve(&caps[1], snapshot).unwrap_or_default()
        })
        .into_owned()
}

/// Field names referenced by a template, in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}

fn resolve(name: &str, snapshot: &EntitySnapshot) -> Option<String> {
    match name {
        "entity_id" => return Some(snapshot.entity_id.to_string()),
        "entity_type" => return Some(snapshot.entity_type.clone()),
        "project_id" => return Some(snapshot.project_id.to_string()),
        _ => {}
    }
    lookup(snapshot, name).map(display)
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(display).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrule_core::{EntityId, ProjectId, WorkspaceId};
    use serde_json::json;

    fn snapshot() -> EntitySnapshot {
        EntitySnapshot::new(EntityId::new(), ProjectId::new(), WorkspaceId::new(), "work_item")
            .with_field("name", json!("Fix login"))
            .with_field("estimate", json!(3))
            .with_field("labels", json!(["bug", "ui"]))
            .with_field("owner", json!({"name": "sam"}))
    }

    #[test]
    fn test_render_fields() {
        let s = snapshot();
        assert_eq!(
            render("{{name}} ({{ estimate }} pts) [{{labels}}] by {{owner.name}}", &s),
            "Fix login (3 pts) [bug, ui] by sam"
        );
    }

    #[test]
    fn test_render_missing_and_builtin() {
        let s = snapshot();
        assert_eq!(render("x{{nope}}y", &s), "xy");
        assert_eq!(render("{{entity_type}}", &s), "work_item");
        assert_eq!(render("{{entity_id}}", &s), s.entity_id.to_string());
        assert_eq!(render("no placeholders", &s), "no placeholders");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(
            placeholders("{{a}} and {{ b.c }} and {{a}}"),
            vec!["a".to_string(), "b.c".to_string(), "a".to_string()]
        );
    }
}
