//! Automation engine for Flowrule
//!
//! An entity event flows through the pipeline:
//! - [`dispatcher`] resolves enabled automations whose trigger matches and
//!   enqueues one ledger record per automation, in creation order
//! - [`runner`] evaluates the captured condition and runs the actions in
//!   order under the entity lock, stopping at the first failure
//! - [`executor`] performs one action with timeouts, bounded retry, and
//!   version-conflict re-validation
//! - [`ledger`] keeps the auditable record of every run
//!
//! [`processor`] feeds events from the bus into the dispatcher on a fixed set
//! of per-entity lanes, and [`engine`] wires everything together.

pub mod condition;
pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod ledger;
pub mod model;
pub mod processor;
pub mod runner;
pub mod store;
pub mod template;

pub use condition::{evaluate, ConditionNode, Operator};
pub use dispatcher::TriggerDispatcher;
pub use engine::{AutomationEngine, Collaborators};
pub use executor::{ActionContext, ActionExecutor, ActionRun};
pub use ledger::{
    ActionOutcome, ActionOutcomeRecord, AutomationStats, Enqueued, ExecutionLedger,
    ExecutionQuery, ExecutionRecord, ExecutionStatus, FailureReason, InMemoryLedgerRepository,
    LedgerRepository,
};
pub use model::{
    Action, ActivityKind, Automation, AutomationActivity, AutomationDraft, AutomationState,
    AutomationUpdate, ChangeFilter, ChangeType, TriggerSpec, ValueExpr,
};
pub use processor::EventProcessor;
pub use runner::ExecutionRunner;
pub use store::{AutomationRepository, AutomationStore, InMemoryAutomationRepository};

use flowrule_workflow::{DenyReason, WorkflowError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Not an authorized mover: {0}")]
    NotAuthorizedMover(String),

    #[error("Illegal state transition: {0}")]
    IllegalStateTransition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Core error: {0}")]
    Core(#[from] flowrule_core::AppError),
}

impl AutomationError {
    /// Stable machine-readable code for API clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            AutomationError::Validation(_) => "VALIDATION_ERROR",
            AutomationError::PreconditionFailed(_) => "PRECONDITION_FAILED",
            AutomationError::NotAuthorizedMover(_) => "NOT_AUTHORIZED_MOVER",
            AutomationError::IllegalStateTransition(_) => "ILLEGAL_STATE_TRANSITION",
            AutomationError::NotFound(_) => "NOT_FOUND",
            AutomationError::Workflow(WorkflowError::ProjectNotFound(_))
            | AutomationError::Workflow(WorkflowError::StateNotFound(_)) => "NOT_FOUND",
            AutomationError::Workflow(WorkflowError::Validation(_)) => "VALIDATION_ERROR",
            AutomationError::Workflow(WorkflowError::Denied(DenyReason::UnknownState)) => {
                "VALIDATION_ERROR"
            }
            AutomationError::Workflow(WorkflowError::Denied(_)) => "NOT_AUTHORIZED_MOVER",
            AutomationError::Workflow(WorkflowError::Core(e)) | AutomationError::Core(e) => {
                core_error_code(e)
            }
        }
    }
}

fn core_error_code(err: &flowrule_core::AppError) -> &'static str {
    use flowrule_core::AppError;
    match err {
        AppError::VersionConflict { .. } => "VERSION_CONFLICT",
        AppError::Timeout(_) => "TIMEOUT",
        AppError::TransientIo(_) => "TRANSIENT_IO_FAILURE",
        AppError::NotFound(_) => "NOT_FOUND",
        AppError::Serialization(_) => "SERIALIZATION_ERROR",
        AppError::Internal(_) => "INTERNAL_ERROR",
    }
}

pub type Result<T> = std::result::Result<T, AutomationError>;
