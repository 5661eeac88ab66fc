use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

/// Name of the workflow-governed state field on every entity.
pub const STATE_FIELD: &str = "state";

// Newtype wrappers for type safety

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

define_id!(
    /// Identifier of a project.
    ProjectId
);
define_id!(
    /// Identifier of a workspace (a group of projects).
    WorkspaceId
);
define_id!(
    /// Identifier of a tracked entity such as a work item.
    EntityId
);
define_id!(
    /// Identifier of a workflow state.
    StateId
);
define_id!(AutomationId);
define_id!(ExecutionId);
define_id!(
    /// Identifier assigned by the event bus; the unit of at-least-once delivery.
    EventId
);
define_id!(CommentId);

/// A user, service account, or the automation actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Principal {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Principal {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Where an automation lives and which events it can see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Scope {
    Project(ProjectId),
    Workspace(WorkspaceId),
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Project(_) => "project",
            Scope::Workspace(_) => "workspace",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Project(id) => write!(f, "project:{}", id),
            Scope::Workspace(id) => write!(f, "workspace:{}", id),
        }
    }
}

/// Point-in-time copy of an entity's fields.
///
/// `version` is the entity store's optimistic-concurrency token and doubles as
/// the per-entity commit sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_id: EntityId,
    pub project_id: ProjectId,
    pub workspace_id: WorkspaceId,
    pub entity_type: String,
    pub version: u64,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl EntitySnapshot {
    pub fn new(
        entity_id: EntityId,
        project_id: ProjectId,
        workspace_id: WorkspaceId,
        entity_type: impl Into<String>,
    ) -> Self {
        Self {
            entity_id,
            project_id,
            workspace_id,
            entity_type: entity_type.into(),
            version: 1,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_state(self, state: StateId) -> Self {
        self.with_field(STATE_FIELD, serde_json::Value::String(state.to_string()))
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field)
    }

    /// Current workflow state, if the entity has a parseable one.
    pub fn state_id(&self) -> Option<StateId> {
        self.fields
            .get(STATE_FIELD)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }
}
