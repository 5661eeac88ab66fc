//! Workflow state graphs for Flowrule projects
//!
//! This crate provides:
//! - Per-project states and the directed transition graph with movers
//! - Copy-on-write graph snapshots cached by `(project, version)`
//! - A pure transition authorizer plus an async wrapper that consults the
//!   identity service for the administrative override
//! - An audit trail of graph edits
//! - The serialized write path that changes an entity's state
//! - An ordered outbox that publishes committed events outside entity locks

pub mod authorizer;
pub mod graph;
pub mod history;
pub mod outbox;
pub mod state;
pub mod store;
pub mod transition;

pub use authorizer::{decide, Decision, DenyReason, TransitionAuthorizer};
pub use graph::{TransitionRule, WorkflowGraph};
pub use history::{WorkflowChange, WorkflowChangeKind};
pub use outbox::EventOutbox;
pub use state::State;
pub use store::{InMemoryStateGraphRepository, StateGraphRepository, StateGraphStore};
pub use transition::{TransitionRequest, TransitionService};

use flowrule_core::{ProjectId, StateId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Project not found: {0}")]
    ProjectNotFound(ProjectId),

    #[error("State not found: {0}")]
    StateNotFound(StateId),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transition denied: {0}")]
    Denied(DenyReason),

    #[error("Core error: {0}")]
    Core(#[from] flowrule_core::AppError),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
