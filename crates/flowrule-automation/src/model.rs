//! Automation definitions.

use crate::condition::{values_equal, ConditionNode};
use crate::template;
use crate::{AutomationError, Result};
use chrono::{DateTime, Utc};
use flowrule_core::{
    AutomationId, EntityEvent, EntitySnapshot, EventKind, Principal, Scope, STATE_FIELD,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Enable/disable state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutomationState {
    #[default]
    Disabled,
    Enabled,
}

/// Narrows a trigger to events that changed a particular field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub field: String,
    /// Only match when the field changed to this value.
    #[serde(default)]
    pub to: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub event_kind: EventKind,
    pub entity_type: String,
    /// Further restrict a workspace automation to one project, or the reverse.
    #[serde(default)]
    pub scope_filter: Option<Scope>,
    #[serde(default)]
    pub change_filter: Option<ChangeFilter>,
}

impl TriggerSpec {
    pub fn new(event_kind: EventKind, entity_type: impl Into<String>) -> Self {
        Self {
            event_kind,
            entity_type: entity_type.into(),
            scope_filter: None,
            change_filter: None,
        }
    }

    pub fn with_scope_filter(mut self, scope: Scope) -> Self {
        self.scope_filter = Some(scope);
        self
    }

    /// Match only changes of `field`, optionally to a specific value.
    pub fn on_change(mut self, field: impl Into<String>, to: Option<Value>) -> Self {
        self.change_filter = Some(ChangeFilter {
            field: field.into(),
            to,
        });
        self
    }

    pub fn matches(&self, event: &EntityEvent) -> bool {
        if self.event_kind != event.kind || self.entity_type != event.entity_type {
            return false;
        }

        let in_scope = match self.scope_filter {
            None => true,
            Some(Scope::Project(project_id)) => event.project_id == project_id,
            Some(Scope::Workspace(workspace_id)) => event.workspace_id == workspace_id,
        };
        if !in_scope {
            return false;
        }

        match (&self.change_filter, &event.change) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(filter), Some(change)) => {
                change.field == filter.field
                    && filter
                        .to
                        .as_ref()
                        .map(|to| values_equal(&change.new_value, to))
                        .unwrap_or(true)
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.entity_type.trim().is_empty() {
            return Err(AutomationError::Validation(
                "trigger entity_type is required".to_string(),
            ));
        }
        if let Some(filter) = &self.change_filter {
            if filter.field.trim().is_empty() {
                return Err(AutomationError::Validation(
                    "trigger change filter needs a field".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Replace the value.
    #[default]
    Set,
    /// Add values to a multi-valued property, skipping ones already present.
    Add,
    /// Remove values from a multi-valued property.
    Remove,
}

impl ChangeType {
    /// The property value after applying `operand` to `current`.
    pub fn apply(&self, current: Option<&Value>, operand: Value) -> Value {
        match self {
            ChangeType::Set => operand,
            ChangeType::Add => {
                let mut items = as_list(current);
                for value in into_list(operand) {
                    if !items.iter().any(|existing| values_equal(existing, &value)) {
                        items.push(value);
                    }
                }
                Value::Array(items)
            }
            ChangeType::Remove => {
                let removed = into_list(operand);
                let items = as_list(current)
                    .into_iter()
                    .filter(|existing| !removed.iter().any(|r| values_equal(existing, r)))
                    .collect();
                Value::Array(items)
            }
        }
    }
}

fn as_list(value: Option<&Value>) -> Vec<Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
    }
}

fn into_list(value: Value) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    }
}

/// Source of the value a property action writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueExpr {
    Literal { value: Value },
    /// Copy another field of the entity.
    Field { field: String },
    /// Render a `{{field}}` template to a string.
    Template { template: String },
}

impl ValueExpr {
    pub fn literal(value: Value) -> Self {
        ValueExpr::Literal { value }
    }

    pub fn resolve(&self, snapshot: &EntitySnapshot) -> Value {
        match self {
            ValueExpr::Literal { value } => value.clone(),
            ValueExpr::Field { field } => crate::condition::lookup(snapshot, field)
                .cloned()
                .unwrap_or(Value::Null),
            ValueExpr::Template { template } => {
                Value::String(template::render(template, snapshot))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    ChangeProperty {
        property_name: String,
        #[serde(default)]
        change_type: ChangeType,
        value: ValueExpr,
    },
    AddComment {
        body_template: String,
    },
}

impl Action {
    pub fn set_property(property_name: impl Into<String>, value: Value) -> Self {
        Action::ChangeProperty {
            property_name: property_name.into(),
            change_type: ChangeType::Set,
            value: ValueExpr::literal(value),
        }
    }

    pub fn comment(body_template: impl Into<String>) -> Self {
        Action::AddComment {
            body_template: body_template.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::ChangeProperty { .. } => "change_property",
            Action::AddComment { .. } => "add_comment",
        }
    }

    /// Whether the action writes the workflow-governed state field.
    pub fn is_governed(&self) -> bool {
        matches!(self, Action::ChangeProperty { property_name, .. } if property_name == STATE_FIELD)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            Action::ChangeProperty {
                property_name,
                change_type,
                ..
            } => {
                if property_name.trim().is_empty() {
                    return Err(AutomationError::Validation(
                        "change_property needs a property_name".to_string(),
                    ));
                }
                if property_name == STATE_FIELD && *change_type != ChangeType::Set {
                    return Err(AutomationError::Validation(
                        "the state field only supports change_type 'set'".to_string(),
                    ));
                }
                Ok(())
            }
            Action::AddComment { body_template } => {
                if body_template.trim().is_empty() {
                    return Err(AutomationError::Validation(
                        "add_comment needs a body".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// A stored automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Automation {
    pub id: AutomationId,
    pub scope: Scope,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub state: AutomationState,
    #[serde(default)]
    pub trigger: Option<TriggerSpec>,
    #[serde(default)]
    pub condition: ConditionNode,
    #[serde(default)]
    pub actions: Vec<Action>,
    pub created_by: Principal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Monotonic creation order across the store; ties on `created_at` never occur.
    pub creation_seq: u64,
    /// Bumped on every definition change.
    pub revision: u64,
}

impl Automation {
    pub fn is_enabled(&self) -> bool {
        self.state == AutomationState::Enabled
    }

    /// Preconditions for entering the enabled state.
    pub(crate) fn check_enableable(&self) -> Result<()> {
        if self.trigger.is_none() {
            return Err(AutomationError::Validation(
                "an automation needs a trigger before it can be enabled".to_string(),
            ));
        }
        if self.actions.is_empty() {
            return Err(AutomationError::Validation(
                "an automation needs at least one action before it can be enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn validate_definition(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AutomationError::Validation("name is required".to_string()));
        }
        if let Some(trigger) = &self.trigger {
            trigger.validate()?;
        }
        self.condition
            .validate()
            .map_err(AutomationError::Validation)?;
        self.actions.iter().try_for_each(Action::validate)
    }
}

/// Input for creating an automation. New automations start disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationDraft {
    pub scope: Scope,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub trigger: Option<TriggerSpec>,
    #[serde(default)]
    pub condition: ConditionNode,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl AutomationDraft {
    pub fn new(scope: Scope, name: impl Into<String>) -> Self {
        Self {
            scope,
            name: name.into(),
            description: None,
            trigger: None,
            condition: ConditionNode::always(),
            actions: Vec::new(),
        }
    }

    pub fn with_trigger(mut self, trigger: TriggerSpec) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_condition(mut self, condition: ConditionNode) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Partial update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutomationUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub trigger: Option<TriggerSpec>,
    #[serde(default)]
    pub condition: Option<ConditionNode>,
    #[serde(default)]
    pub actions: Option<Vec<Action>>,
}

impl AutomationUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.trigger.is_none()
            && self.condition.is_none()
            && self.actions.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityKind {
    Created,
    Updated,
    Enabled,
    Disabled,
    ActionAdded { index: usize },
    ActionRemoved { index: usize },
    Deleted,
}

/// One entry in an automation's activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationActivity {
    pub id: Uuid,
    pub automation_id: AutomationId,
    pub actor: Principal,
    #[serde(flatten)]
    pub kind: ActivityKind,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
}

impl AutomationActivity {
    pub fn new(automation: &Automation, actor: &Principal, kind: ActivityKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            automation_id: automation.id,
            actor: actor.clone(),
            kind,
            revision: automation.revision,
            created_at: Utc::now(),
        }
    }
}
