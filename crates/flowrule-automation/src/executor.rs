//! Runs a single automation action against the collaborators.

use crate::condition::evaluate;
use crate::ledger::{ActionOutcome, ExecutionRecord, FailureReason};
use crate::model::{Action, Automation, ChangeType, ValueExpr};
use crate::template;
use flowrule_core::{
    AppError, CommentService, EngineConfig, EntityEvent, EntityId, EntitySnapshot, EntityStore,
    EventKind, EventOrigin, ExecutionId, Principal, StateId,
};
use flowrule_infra::{retry_with, with_timeout, RetryPolicy};
use flowrule_workflow::{Decision, DenyReason, EventOutbox, TransitionAuthorizer, WorkflowError};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where an action sits within its run.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    pub execution_id: ExecutionId,
    pub automation: &'a Automation,
    pub index: usize,
    /// Cascade depth of the event that triggered the run.
    pub cascade_depth: u32,
}

impl<'a> ActionContext<'a> {
    pub fn new(record: &'a ExecutionRecord, index: usize) -> Self {
        Self {
            execution_id: record.id,
            automation: &record.automation,
            index,
            cascade_depth: record.cascade_depth,
        }
    }

    /// Key that makes a retried side effect land at most once.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.execution_id, self.index)
    }
}

/// What running an action produced.
#[derive(Debug, Clone)]
pub struct ActionRun {
    pub outcome: ActionOutcome,
    pub attempts: u32,
    /// Latest known entity state, for the next action of the run.
    pub snapshot: EntitySnapshot,
}

struct Failure {
    reason: FailureReason,
    message: String,
}

impl Failure {
    fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl From<AppError> for Failure {
    fn from(err: AppError) -> Self {
        Self::new(FailureReason::from(&err), err.to_string())
    }
}

/// A resolved `change_property` action.
struct PropertyWrite<'a> {
    property: &'a str,
    change_type: ChangeType,
    value: &'a ValueExpr,
    governed: bool,
}

/// Executes actions with bounded timeouts, retry of transient failures, and
/// re-validation after version conflicts.
///
/// Callers hold the entity lock for the duration of [`ActionExecutor::run`].
/// Follow-up events are queued on the outbox under that lock and published
/// from a background flush, so a full event bus never stalls a run.
pub struct ActionExecutor {
    authorizer: Arc<TransitionAuthorizer>,
    entities: Arc<dyn EntityStore>,
    comments: Arc<dyn CommentService>,
    outbox: Arc<EventOutbox>,
    principal: Principal,
    retry: RetryPolicy,
    timeout: Duration,
    conflict_retries: u32,
}

impl ActionExecutor {
    pub fn new(
        authorizer: Arc<TransitionAuthorizer>,
        entities: Arc<dyn EntityStore>,
        comments: Arc<dyn CommentService>,
        outbox: Arc<EventOutbox>,
        config: &EngineConfig,
    ) -> Self {
        let retry = RetryPolicy::exponential(
            config.max_action_attempts,
            config.initial_backoff(),
            config.max_backoff(),
        );
        Self {
            authorizer,
            entities,
            comments,
            outbox,
            principal: Principal::new(config.automation_principal.clone()),
            retry,
            timeout: config.action_timeout(),
            conflict_retries: config.conflict_retries,
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn outbox(&self) -> &Arc<EventOutbox> {
        &self.outbox
    }

    pub async fn run(
        &self,
        ctx: &ActionContext<'_>,
        action: &Action,
        snapshot: EntitySnapshot,
    ) -> ActionRun {
        let mut attempts = 0;
        let result = match action {
            Action::ChangeProperty {
                property_name,
                change_type,
                value,
            } => {
                let write = PropertyWrite {
                    property: property_name,
                    change_type: *change_type,
                    value,
                    governed: action.is_governed(),
                };
                self.change_property(ctx, &write, snapshot.clone(), &mut attempts).await
            }
            Action::AddComment { body_template } => self
                .add_comment(ctx, body_template, &snapshot, &mut attempts)
                .await
                .map(|_| snapshot.clone()),
        };

        match result {
            Ok(snapshot) => ActionRun {
                outcome: ActionOutcome::Success,
                attempts,
                snapshot,
            },
            Err(failure) => ActionRun {
                outcome: ActionOutcome::failure(failure.reason, failure.message),
                attempts,
                snapshot,
            },
        }
    }

    /// Fetch the current entity with the same timeout and retry as actions.
    pub async fn fetch_snapshot(
        &self,
        entity_id: EntityId,
    ) -> std::result::Result<EntitySnapshot, AppError> {
        let mut attempts = 0;
        self.call("get_snapshot", &mut attempts, || {
            self.entities.get_snapshot(entity_id)
        })
        .await
    }

    async fn change_property(
        &self,
        ctx: &ActionContext<'_>,
        write: &PropertyWrite<'_>,
        mut snapshot: EntitySnapshot,
        attempts: &mut u32,
    ) -> std::result::Result<EntitySnapshot, Failure> {
        let entity_id = snapshot.entity_id;
        let mut conflicts = 0;
        loop {
            match self.try_change_property(ctx, write, &snapshot, attempts).await {
                Ok(updated) => return Ok(updated),
                Err(failure) if failure.reason == FailureReason::VersionConflict => {
                    if conflicts >= self.conflict_retries {
                        return Err(failure);
                    }
                    conflicts += 1;
                    debug!(
                        execution_id = %ctx.execution_id,
                        action_index = ctx.index,
                        conflicts,
                        "Version conflict, re-validating"
                    );

                    snapshot = self
                        .call("get_snapshot", attempts, || {
                            self.entities.get_snapshot(entity_id)
                        })
                        .await?;
                    if !evaluate(&ctx.automation.condition, &snapshot) {
                        return Err(Failure::new(
                            FailureReason::ConditionNoLongerMet,
                            "entity no longer satisfies the condition",
                        ));
                    }
                }
                Err(failure) => return Err(failure),
            }
        }
    }

    async fn try_change_property(
        &self,
        ctx: &ActionContext<'_>,
        write: &PropertyWrite<'_>,
        snapshot: &EntitySnapshot,
        attempts: &mut u32,
    ) -> std::result::Result<EntitySnapshot, Failure> {
        let property = write.property;
        let current = snapshot.get(property).cloned();
        let next = write
            .change_type
            .apply(current.as_ref(), write.value.resolve(snapshot));

        if write.governed {
            self.authorize_state_change(snapshot, &next).await?;
        }

        if current.as_ref() == Some(&next) {
            debug!(
                execution_id = %ctx.execution_id,
                action_index = ctx.index,
                property,
                "Property already has the target value"
            );
            return Ok(snapshot.clone());
        }

        let entity_id = snapshot.entity_id;
        let expected = snapshot.version;
        let timed_out = AtomicBool::new(false);
        let written = self
            .call_observed("apply_property_change", attempts, &timed_out, || {
                self.entities
                    .apply_property_change(entity_id, property, next.clone(), expected)
            })
            .await;
        let updated = match written {
            Ok(updated) => updated,
            Err(err) if timed_out.load(Ordering::SeqCst) => {
                self.recover_timed_out_write(
                    ctx, entity_id, property, &next, expected, err, attempts,
                )
                .await?
            }
            Err(err) => return Err(err.into()),
        };

        info!(
            execution_id = %ctx.execution_id,
            automation_id = %ctx.automation.id,
            entity_id = %entity_id,
            property,
            version = updated.version,
            "Automation changed property"
        );

        let kind = if write.governed {
            EventKind::StateChanged
        } else {
            EventKind::PropertyChanged
        };
        let event = EntityEvent::new(kind, &updated, self.principal.clone())
            .with_change(property, current.unwrap_or(Value::Null), next)
            .with_origin(
                EventOrigin::Automation {
                    automation_id: ctx.automation.id,
                    execution_id: ctx.execution_id,
                },
                ctx.cascade_depth + 1,
            );
        self.emit(event).await;

        Ok(updated)
    }

    /// A write whose call timed out may still have committed. When the entity
    /// moved past `expected` and now holds `next`, treat the write as ours so
    /// its event is not lost.
    #[allow(clippy::too_many_arguments)]
    async fn recover_timed_out_write(
        &self,
        ctx: &ActionContext<'_>,
        entity_id: EntityId,
        property: &str,
        next: &Value,
        expected: u64,
        err: AppError,
        attempts: &mut u32,
    ) -> std::result::Result<EntitySnapshot, Failure> {
        let fresh = self
            .call("get_snapshot", attempts, || self.entities.get_snapshot(entity_id))
            .await?;
        if fresh.version > expected && fresh.get(property) == Some(next) {
            warn!(
                execution_id = %ctx.execution_id,
                entity_id = %entity_id,
                property,
                version = fresh.version,
                "Write committed despite timeout"
            );
            Ok(fresh)
        } else {
            Err(err.into())
        }
    }

    async fn authorize_state_change(
        &self,
        snapshot: &EntitySnapshot,
        next: &Value,
    ) -> std::result::Result<(), Failure> {
        let to: StateId = next
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                Failure::new(
                    FailureReason::InvalidValue,
                    format!("'{}' is not a workflow state id", next),
                )
            })?;
        let from = snapshot.state_id().ok_or_else(|| {
            Failure::new(
                FailureReason::InvalidValue,
                format!("entity {} has no workflow state", snapshot.entity_id),
            )
        })?;

        let decision = self
            .authorizer
            .authorize(snapshot.project_id, snapshot.entity_id, from, to, &self.principal)
            .await
            .map_err(|e| match e {
                WorkflowError::Core(err) => Failure::from(err),
                WorkflowError::ProjectNotFound(_) | WorkflowError::StateNotFound(_) => {
                    Failure::new(FailureReason::NotFound, e.to_string())
                }
                other => Failure::new(FailureReason::Internal, other.to_string()),
            })?;

        match decision {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => {
                let failure_reason = match reason {
                    DenyReason::UnknownState => FailureReason::InvalidValue,
                    DenyReason::NoSuchTransition => FailureReason::NoSuchTransition,
                    DenyReason::NotAuthorizedMover | DenyReason::CreationNotAllowed => {
                        FailureReason::NotAuthorizedMover
                    }
                };
                Err(Failure::new(
                    failure_reason,
                    format!("{} may not move {} to {}", self.principal, snapshot.entity_id, to),
                ))
            }
        }
    }

    async fn add_comment(
        &self,
        ctx: &ActionContext<'_>,
        body_template: &str,
        snapshot: &EntitySnapshot,
        attempts: &mut u32,
    ) -> std::result::Result<(), Failure> {
        let body = template::render(body_template, snapshot);
        let key = ctx.idempotency_key();
        let entity_id = snapshot.entity_id;

        let comment_id = self
            .call("post_comment", attempts, || {
                self.comments.post_comment(entity_id, &body, &key)
            })
            .await?;

        info!(
            execution_id = %ctx.execution_id,
            automation_id = %ctx.automation.id,
            entity_id = %entity_id,
            comment_id = %comment_id,
            "Automation posted comment"
        );
        Ok(())
    }

    /// Publish failures do not fail the action: the write is already committed.
    async fn emit(&self, event: EntityEvent) {
        self.outbox.enqueue(event).await;
        self.outbox.spawn_flush();
    }

    /// One collaborator call under the action timeout, retried while the
    /// failure is transient. `attempts` counts every call made.
    async fn call<T, F, Fut>(
        &self,
        operation: &str,
        attempts: &mut u32,
        f: F,
    ) -> std::result::Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = flowrule_core::Result<T>>,
    {
        let timed_out = AtomicBool::new(false);
        self.call_observed(operation, attempts, &timed_out, f).await
    }

    /// [`ActionExecutor::call`] that also reports whether any attempt timed out.
    async fn call_observed<T, F, Fut>(
        &self,
        operation: &str,
        attempts: &mut u32,
        timed_out: &AtomicBool,
        mut f: F,
    ) -> std::result::Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = flowrule_core::Result<T>>,
    {
        let timeout = self.timeout;
        retry_with(
            &self.retry,
            |_attempt| {
                *attempts += 1;
                let fut = f();
                async move {
                    match with_timeout(timeout, operation, || fut).await {
                        Ok(result) => result,
                        Err(e) => {
                            timed_out.store(true, Ordering::SeqCst);
                            Err(AppError::Timeout(e.to_string()))
                        }
                    }
                }
            },
            AppError::is_retryable,
        )
        .await
    }
}
