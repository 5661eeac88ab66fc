//! Entity lifecycle events delivered by the event bus.

use crate::types::{
    AutomationId, EntityId, EntitySnapshot, EventId, ExecutionId, Principal, ProjectId,
    WorkspaceId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of entity lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    EntityCreated,
    PropertyChanged,
    StateChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::EntityCreated => "entity_created",
            EventKind::PropertyChanged => "property_changed",
            EventKind::StateChanged => "state_changed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The field-level change carried by update and transition events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyChange {
    pub field: String,
    pub old_value: serde_json::Value,
    pub new_value: serde_json::Value,
}

/// Who caused an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventOrigin {
    #[default]
    User,
    Automation {
        automation_id: AutomationId,
        execution_id: ExecutionId,
    },
}

/// An entity lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEvent {
    pub event_id: EventId,
    pub entity_id: EntityId,
    pub project_id: ProjectId,
    pub workspace_id: WorkspaceId,
    pub entity_type: String,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    pub actor: Principal,
    /// Per-entity commit sequence number (the entity version after the write).
    pub sequence: u64,
    #[serde(default)]
    pub change: Option<PropertyChange>,
    #[serde(default)]
    pub origin: EventOrigin,
    /// How many automation hops produced this event (0 for user writes).
    #[serde(default)]
    pub cascade_depth: u32,
    /// Entity state right after the write, when the producer has it.
    #[serde(default)]
    pub snapshot: Option<EntitySnapshot>,
}

impl EntityEvent {
    /// Build an event describing the committed state in `snapshot`.
    pub fn new(kind: EventKind, snapshot: &EntitySnapshot, actor: Principal) -> Self {
        Self {
            event_id: EventId::new(),
            entity_id: snapshot.entity_id,
            project_id: snapshot.project_id,
            workspace_id: snapshot.workspace_id,
            entity_type: snapshot.entity_type.clone(),
            kind,
            occurred_at: Utc::now(),
            actor,
            sequence: snapshot.version,
            change: None,
            origin: EventOrigin::User,
            cascade_depth: 0,
            snapshot: Some(snapshot.clone()),
        }
    }

    pub fn with_change(
        mut self,
        field: impl Into<String>,
        old_value: serde_json::Value,
        new_value: serde_json::Value,
    ) -> Self {
        self.change = Some(PropertyChange {
            field: field.into(),
            old_value,
            new_value,
        });
        self
    }

    pub fn with_origin(mut self, origin: EventOrigin, cascade_depth: u32) -> Self {
        self.origin = origin;
        self.cascade_depth = cascade_depth;
        self
    }

    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn without_snapshot(mut self) -> Self {
        self.snapshot = None;
        self
    }

    /// The automation that produced this event, if any.
    pub fn originating_automation(&self) -> Option<AutomationId> {
        match self.origin {
            EventOrigin::Automation { automation_id, .. } => Some(automation_id),
            EventOrigin::User => None,
        }
    }
}
