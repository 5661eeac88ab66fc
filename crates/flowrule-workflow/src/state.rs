use chrono::{DateTime, Utc};
use flowrule_core::{ProjectId, StateId};
use serde::{Deserialize, Serialize};

/// A workflow state within a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub id: StateId,
    pub project_id: ProjectId,
    pub name: String,
    /// The unconditional creation target. Exactly one per project.
    pub is_default: bool,
    /// Whether new work items may be created directly in this state.
    pub allow_issue_creation: bool,
    /// Position in the project's state list.
    pub sequence: u32,
    pub created_at: DateTime<Utc>,
}

impl State {
    pub fn new(project_id: ProjectId, name: impl Into<String>) -> Self {
        Self {
            id: StateId::new(),
            project_id,
            name: name.into(),
            is_default: false,
            allow_issue_creation: true,
            sequence: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: StateId) -> Self {
        self.id = id;
        self
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self.allow_issue_creation = true;
        self
    }

    pub fn with_creation_allowed(mut self, allowed: bool) -> Self {
        self.allow_issue_creation = allowed;
        self
    }
}
