//! Drives one execution record from queued to a terminal status.

use crate::condition::evaluate;
use crate::executor::{ActionContext, ActionExecutor};
use crate::ledger::{
    ActionOutcome, ActionOutcomeRecord, ExecutionLedger, ExecutionRecord, ExecutionStatus,
    FailureReason,
};
use crate::Result;
use flowrule_core::{EntityId, ExecutionId};
use flowrule_infra::KeyedLock;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct ExecutionRunner {
    ledger: Arc<ExecutionLedger>,
    executor: Arc<ActionExecutor>,
    entity_locks: KeyedLock<EntityId>,
}

impl ExecutionRunner {
    pub fn new(
        ledger: Arc<ExecutionLedger>,
        executor: Arc<ActionExecutor>,
        entity_locks: KeyedLock<EntityId>,
    ) -> Self {
        Self {
            ledger,
            executor,
            entity_locks,
        }
    }

    /// Run a record to completion.
    ///
    /// The condition is evaluated against the snapshot captured at trigger
    /// time; actions run in order against the live entity and stop at the
    /// first failure. Actions that already have a recorded success are not
    /// repeated, so a record interrupted mid-run can be driven again safely.
    pub async fn run(&self, execution_id: ExecutionId) -> Result<ExecutionRecord> {
        let record = self.ledger.get(execution_id).await?;
        if record.is_terminal() {
            return Ok(record);
        }

        let _guard = self.entity_locks.lock(record.entity_id).await;
        let record = self.ledger.get(execution_id).await?;
        let record = match record.status {
            ExecutionStatus::Queued => {
                if !evaluate(&record.automation.condition, &record.entity) {
                    info!(
                        execution_id = %execution_id,
                        automation_id = %record.automation_id,
                        "Condition not met, skipping"
                    );
                    return self.ledger.finish(execution_id, ExecutionStatus::Skipped).await;
                }
                self.ledger.start(execution_id).await?
            }
            ExecutionStatus::Running => record,
            _ => return Ok(record),
        };

        let mut snapshot = match self.executor.fetch_snapshot(record.entity_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    execution_id = %execution_id,
                    entity_id = %record.entity_id,
                    error = %e,
                    "Could not load entity for execution"
                );
                if let Some((index, action)) = record
                    .automation
                    .actions
                    .iter()
                    .enumerate()
                    .find(|(index, _)| record.outcome(*index).is_none())
                {
                    self.ledger
                        .record_action_outcome(
                            execution_id,
                            ActionOutcomeRecord::new(
                                index,
                                action,
                                ActionOutcome::failure(FailureReason::from(&e), e.to_string()),
                                1,
                            ),
                        )
                        .await?;
                }
                return self.ledger.finish(execution_id, ExecutionStatus::Failed).await;
            }
        };

        for (index, action) in record.automation.actions.iter().enumerate() {
            if let Some(previous) = record.outcome(index) {
                if previous.outcome.is_success() {
                    continue;
                }
                return self.ledger.finish(execution_id, ExecutionStatus::Failed).await;
            }

            let ctx = ActionContext::new(&record, index);
            let run = self.executor.run(&ctx, action, snapshot).await;
            snapshot = run.snapshot;
            let failed = !run.outcome.is_success();

            self.ledger
                .record_action_outcome(
                    execution_id,
                    ActionOutcomeRecord::new(index, action, run.outcome, run.attempts),
                )
                .await?;

            if failed {
                return self.ledger.finish(execution_id, ExecutionStatus::Failed).await;
            }
        }

        self.ledger
            .finish(execution_id, ExecutionStatus::Succeeded)
            .await
    }

    /// Drive every queued or running record, oldest first. Returns the
    /// records that reached a terminal status.
    pub async fn resume_pending(&self) -> Result<Vec<ExecutionRecord>> {
        let pending = self.ledger.pending().await?;
        if !pending.is_empty() {
            info!(count = pending.len(), "Resuming pending executions");
        }

        let mut finished = Vec::with_capacity(pending.len());
        for record in pending {
            match self.run(record.id).await {
                Ok(record) => finished.push(record),
                Err(e) => error!(execution_id = %record.id, error = %e, "Failed to resume execution"),
            }
        }
        Ok(finished)
    }
}
