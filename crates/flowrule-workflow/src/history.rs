use chrono::{DateTime, Utc};
use flowrule_core::{Principal, ProjectId, StateId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a workflow edit did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowChangeKind {
    WorkflowEnabled,
    WorkflowDisabled,
    WorkflowReset,
    StateAdded { state_id: StateId },
    DefaultStateChanged { state_id: StateId },
    CreationAllowed { state_id: StateId },
    CreationDisallowed { state_id: StateId },
    TransitionAdded { from: StateId, to: StateId },
    TransitionRemoved { from: StateId, to: StateId },
    MoverAdded { from: StateId, to: StateId, mover: Principal },
    MoverRemoved { from: StateId, to: StateId, mover: Principal },
}

/// One entry of a project's workflow audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowChange {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub actor: Principal,
    #[serde(flatten)]
    pub kind: WorkflowChangeKind,
    /// Graph version produced by this edit.
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl WorkflowChange {
    pub fn new(
        project_id: ProjectId,
        actor: Principal,
        kind: WorkflowChangeKind,
        version: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            actor,
            kind,
            version,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_serializes_flat() {
        let change = WorkflowChange::new(
            ProjectId::new(),
            "admin".into(),
            WorkflowChangeKind::MoverAdded {
                from: StateId::new(),
                to: StateId::new(),
                mover: "lead".into(),
            },
            4,
        );

        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value["type"], "mover_added");
        assert_eq!(value["mover"], "lead");
        assert_eq!(value["actor"], "admin");
        assert_eq!(value["version"], 4);
    }
}
