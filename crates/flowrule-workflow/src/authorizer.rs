//! Transition authorization.
//!
//! [`decide`] is the whole rule and is pure. [`TransitionAuthorizer`] takes a
//! graph snapshot, asks the identity service for the override only when the
//! actor is not already a mover, and never mutates anything.

use crate::graph::WorkflowGraph;
use crate::state::State;
use crate::store::StateGraphStore;
use crate::{Result, WorkflowError};
use flowrule_core::{EntityId, IdentityService, Principal, ProjectId, StateId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    UnknownState,
    NoSuchTransition,
    NotAuthorizedMover,
    CreationNotAllowed,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::UnknownState => "unknown_state",
            DenyReason::NoSuchTransition => "no_such_transition",
            DenyReason::NotAuthorizedMover => "not_authorized_mover",
            DenyReason::CreationNotAllowed => "creation_not_allowed",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Decide a state transition against one graph snapshot.
///
/// The destination must be a state of the graph even when the workflow is
/// disabled.
pub fn decide(
    graph: &WorkflowGraph,
    from: StateId,
    to: StateId,
    actor: &Principal,
    has_override: bool,
) -> Decision {
    if graph.state(to).is_none() {
        return Decision::Deny(DenyReason::UnknownState);
    }
    if from == to || !graph.is_workflow_enabled() {
        return Decision::Allow;
    }

    match graph.rule(from, to) {
        None => Decision::Deny(DenyReason::NoSuchTransition),
        Some(rule) if rule.is_mover(actor) || has_override => Decision::Allow,
        Some(_) => Decision::Deny(DenyReason::NotAuthorizedMover),
    }
}

/// Decide whether a work item may be created directly in `state`.
pub fn decide_creation(state: &State, workflow_enabled: bool) -> Decision {
    if !workflow_enabled || state.is_default || state.allow_issue_creation {
        Decision::Allow
    } else {
        Decision::Deny(DenyReason::CreationNotAllowed)
    }
}

pub struct TransitionAuthorizer {
    graphs: Arc<StateGraphStore>,
    identity: Arc<dyn IdentityService>,
}

impl TransitionAuthorizer {
    pub fn new(graphs: Arc<StateGraphStore>, identity: Arc<dyn IdentityService>) -> Self {
        Self { graphs, identity }
    }

    pub fn graphs(&self) -> &Arc<StateGraphStore> {
        &self.graphs
    }

    pub async fn authorize(
        &self,
        project_id: ProjectId,
        entity_id: EntityId,
        from: StateId,
        to: StateId,
        actor: &Principal,
    ) -> Result<Decision> {
        let graph = self.graphs.snapshot(project_id).await?;

        let mut decision = decide(&graph, from, to, actor, false);
        if decision == Decision::Deny(DenyReason::NotAuthorizedMover)
            && self.identity.has_override(project_id, actor).await?
        {
            decision = decide(&graph, from, to, actor, true);
        }

        match decision {
            Decision::Allow => debug!(
                project_id = %project_id,
                entity_id = %entity_id,
                actor = %actor,
                version = graph.version(),
                "Transition allowed"
            ),
            Decision::Deny(reason) => warn!(
                project_id = %project_id,
                entity_id = %entity_id,
                from = %from,
                to = %to,
                actor = %actor,
                reason = %reason,
                "Transition denied"
            ),
        }

        Ok(decision)
    }

    pub async fn authorize_creation(
        &self,
        project_id: ProjectId,
        state_id: StateId,
        actor: &Principal,
    ) -> Result<Decision> {
        let graph = self.graphs.snapshot(project_id).await?;
        if !graph.is_workflow_enabled() {
            return Ok(Decision::Allow);
        }

        let state = graph
            .state(state_id)
            .ok_or(WorkflowError::StateNotFound(state_id))?;
        let decision = decide_creation(state, true);
        if let Decision::Deny(reason) = decision {
            warn!(
                project_id = %project_id,
                state_id = %state_id,
                actor = %actor,
                reason = %reason,
                "Work item creation denied"
            );
        }
        Ok(decision)
    }
}
