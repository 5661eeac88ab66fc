//! Execution ledger
//!
//! One [`ExecutionRecord`] per automation run. Records carry a copy of the
//! automation definition and the entity snapshot taken at trigger time, and
//! become immutable once they reach a terminal status.

use crate::model::{Action, Automation};
use crate::{AutomationError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flowrule_core::{
    AppError, AutomationId, EntityEvent, EntityId, EntitySnapshot, EventId, EventKind,
    ExecutionId, Principal, ProjectId,
};
use flowrule_infra::KeyedLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Matched, condition not yet evaluated
    Queued,
    /// Condition passed, actions executing
    Running,
    Succeeded,
    Failed,
    /// Condition evaluated false
    Skipped,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
        }
    }

    fn can_become(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Skipped)
                | (Queued, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = AutomationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(ExecutionStatus::Queued),
            "running" => Ok(ExecutionStatus::Running),
            "succeeded" => Ok(ExecutionStatus::Succeeded),
            "failed" => Ok(ExecutionStatus::Failed),
            "skipped" => Ok(ExecutionStatus::Skipped),
            other => Err(AutomationError::Validation(format!(
                "unknown execution status '{}'",
                other
            ))),
        }
    }
}

/// Why an action failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NotAuthorizedMover,
    NoSuchTransition,
    Timeout,
    TransientIo,
    /// The entity changed under us and no longer satisfies the condition.
    ConditionNoLongerMet,
    VersionConflict,
    InvalidValue,
    NotFound,
    Internal,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NotAuthorizedMover => "not_authorized_mover",
            FailureReason::NoSuchTransition => "no_such_transition",
            FailureReason::Timeout => "timeout",
            FailureReason::TransientIo => "transient_io",
            FailureReason::ConditionNoLongerMet => "condition_no_longer_met",
            FailureReason::VersionConflict => "version_conflict",
            FailureReason::InvalidValue => "invalid_value",
            FailureReason::NotFound => "not_found",
            FailureReason::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&AppError> for FailureReason {
    fn from(err: &AppError) -> Self {
        match err {
            AppError::VersionConflict { .. } => FailureReason::VersionConflict,
            AppError::Timeout(_) => FailureReason::Timeout,
            AppError::TransientIo(_) => FailureReason::TransientIo,
            AppError::NotFound(_) => FailureReason::NotFound,
            AppError::Serialization(_) | AppError::Internal(_) => FailureReason::Internal,
        }
    }
}

/// Result of one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Failure {
        reason: FailureReason,
        message: String,
    },
}

impl ActionOutcome {
    pub fn failure(reason: FailureReason, message: impl Into<String>) -> Self {
        ActionOutcome::Failure {
            reason,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ActionOutcome::Success)
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            ActionOutcome::Success => None,
            ActionOutcome::Failure { reason, .. } => Some(*reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcomeRecord {
    pub index: usize,
    pub action_kind: String,
    #[serde(flatten)]
    pub outcome: ActionOutcome,
    /// Calls made to collaborators, including retries.
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

impl ActionOutcomeRecord {
    pub fn new(index: usize, action: &Action, outcome: ActionOutcome, attempts: u32) -> Self {
        Self {
            index,
            action_kind: action.kind().to_string(),
            outcome,
            attempts,
            recorded_at: Utc::now(),
        }
    }
}

/// One automation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub automation_id: AutomationId,
    pub event_id: EventId,
    pub event_kind: EventKind,
    pub entity_id: EntityId,
    pub project_id: ProjectId,
    /// Actor of the triggering event.
    pub initiator: Principal,
    pub status: ExecutionStatus,
    /// Automation definition as it was when the event matched.
    pub automation: Automation,
    /// Entity as it was when the event matched.
    pub entity: EntitySnapshot,
    /// Cascade depth of the triggering event.
    pub cascade_depth: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub action_outcomes: Vec<ActionOutcomeRecord>,
}

impl ExecutionRecord {
    pub fn new(automation: Automation, event: &EntityEvent, entity: EntitySnapshot) -> Self {
        Self {
            id: ExecutionId::new(),
            automation_id: automation.id,
            event_id: event.event_id,
            event_kind: event.kind,
            entity_id: event.entity_id,
            project_id: event.project_id,
            initiator: event.actor.clone(),
            status: ExecutionStatus::Queued,
            automation,
            entity,
            cascade_depth: event.cascade_depth,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            action_outcomes: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn outcome(&self, index: usize) -> Option<&ActionOutcomeRecord> {
        self.action_outcomes.iter().find(|o| o.index == index)
    }

    pub fn has_failures(&self) -> bool {
        self.status == ExecutionStatus::Failed
            || self.action_outcomes.iter().any(|o| !o.outcome.is_success())
    }

    /// Wall time from start (or creation, for skipped runs) to finish.
    pub fn duration_ms(&self) -> Option<i64> {
        let finished = self.finished_at?;
        let started = self.started_at.unwrap_or(self.created_at);
        Some((finished - started).num_milliseconds().max(0))
    }
}

/// Ledger query filters. Dates bound `created_at`, inclusive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionQuery {
    #[serde(default)]
    pub automation_id: Option<AutomationId>,
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failures_only: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ExecutionQuery {
    pub fn for_automation(automation_id: AutomationId) -> Self {
        Self {
            automation_id: Some(automation_id),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn failures_only(mut self) -> Self {
        self.failures_only = true;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.automation_id
            .map(|id| record.automation_id == id)
            .unwrap_or(true)
            && self.status.map(|s| record.status == s).unwrap_or(true)
            && self.from.map(|from| record.created_at >= from).unwrap_or(true)
            && self.to.map(|to| record.created_at <= to).unwrap_or(true)
            && (!self.failures_only || record.has_failures())
    }
}

/// Run statistics for one automation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutomationStats {
    pub executions: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub in_flight: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<ExecutionStatus>,
    /// Mean duration of terminal runs, in milliseconds.
    pub avg_duration_ms: Option<f64>,
}

/// Outcome of enqueueing a run.
#[derive(Debug, Clone)]
pub enum Enqueued {
    Created(ExecutionRecord),
    /// A record already exists for this `(automation, event)` pair.
    Duplicate(ExecutionId),
}

/// Persistence for execution records.
///
/// `(automation_id, event_id)` is unique across all records, which is what
/// makes at-least-once event delivery safe.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Insert a new record unless one exists for the same automation and
    /// event, in which case the existing id is returned.
    async fn insert_unique(&self, record: &ExecutionRecord) -> Result<Option<ExecutionId>>;

    async fn get(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>>;

    /// Replace an existing record.
    async fn save(&self, record: &ExecutionRecord) -> Result<()>;

    /// Matching records, newest first.
    async fn query(&self, query: &ExecutionQuery) -> Result<Vec<ExecutionRecord>>;

    /// Non-terminal records, oldest first.
    async fn pending(&self) -> Result<Vec<ExecutionRecord>>;

    /// Delete terminal records that finished before `cutoff`. The
    /// `(automation_id, event_id)` key of a purged record stays reserved, so a
    /// redelivery after expiry is still reported as a duplicate.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// In-memory ledger repository
pub struct InMemoryLedgerRepository {
    records: DashMap<ExecutionId, ExecutionRecord>,
    /// Outlives purged records as a dedup tombstone.
    by_trigger: DashMap<(AutomationId, EventId), ExecutionId>,
}

impl InMemoryLedgerRepository {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            by_trigger: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for InMemoryLedgerRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerRepository for InMemoryLedgerRepository {
    async fn insert_unique(&self, record: &ExecutionRecord) -> Result<Option<ExecutionId>> {
        match self.by_trigger.entry((record.automation_id, record.event_id)) {
            Entry::Occupied(existing) => Ok(Some(*existing.get())),
            Entry::Vacant(slot) => {
                self.records.insert(record.id, record.clone());
                slot.insert(record.id);
                Ok(None)
            }
        }
    }

    async fn get(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>> {
        Ok(self.records.get(&id).map(|r| r.clone()))
    }

    async fn save(&self, record: &ExecutionRecord) -> Result<()> {
        match self.records.get_mut(&record.id) {
            Some(mut existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(AutomationError::NotFound(format!("execution {}", record.id))),
        }
    }

    async fn query(&self, query: &ExecutionQuery) -> Result<Vec<ExecutionRecord>> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|r| query.matches(r))
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn pending(&self) -> Result<Vec<ExecutionRecord>> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|r| !r.is_terminal())
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let expired: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.is_terminal() && r.finished_at.map(|t| t < cutoff).unwrap_or(false))
            .map(|r| r.id)
            .collect();

        let mut removed = 0u64;
        for id in expired {
            if self.records.remove(&id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Status transitions and audit queries over a [`LedgerRepository`].
///
/// Writes to one record are serialized; unrelated records never contend.
pub struct ExecutionLedger {
    repository: Arc<dyn LedgerRepository>,
    locks: KeyedLock<ExecutionId>,
}

impl ExecutionLedger {
    pub fn new(repository: Arc<dyn LedgerRepository>) -> Self {
        Self {
            repository,
            locks: KeyedLock::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryLedgerRepository::new()))
    }

    pub async fn enqueue(&self, record: ExecutionRecord) -> Result<Enqueued> {
        match self.repository.insert_unique(&record).await? {
            Some(existing) => {
                debug!(
                    automation_id = %record.automation_id,
                    event_id = %record.event_id,
                    execution_id = %existing,
                    "Duplicate event delivery ignored"
                );
                Ok(Enqueued::Duplicate(existing))
            }
            None => {
                info!(
                    execution_id = %record.id,
                    automation_id = %record.automation_id,
                    event_id = %record.event_id,
                    entity_id = %record.entity_id,
                    "Execution queued"
                );
                Ok(Enqueued::Created(record))
            }
        }
    }

    /// Move a queued run to running. Starting a running record is a no-op.
    pub async fn start(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        let _guard = self.locks.lock(id).await;
        let mut record = self.load(id).await?;
        match record.status {
            ExecutionStatus::Running => Ok(record),
            ExecutionStatus::Queued => {
                record.status = ExecutionStatus::Running;
                record.started_at = Some(Utc::now());
                self.repository.save(&record).await?;
                debug!(execution_id = %id, "Execution started");
                Ok(record)
            }
            status => Err(illegal(id, status, ExecutionStatus::Running)),
        }
    }

    /// Record the outcome of one action. The first outcome recorded for an
    /// index wins; later ones are ignored.
    pub async fn record_action_outcome(
        &self,
        id: ExecutionId,
        outcome: ActionOutcomeRecord,
    ) -> Result<ExecutionRecord> {
        let _guard = self.locks.lock(id).await;
        let mut record = self.load(id).await?;
        if record.status != ExecutionStatus::Running {
            return Err(AutomationError::IllegalStateTransition(format!(
                "execution {} is {}, outcomes can only be recorded while running",
                id, record.status
            )));
        }
        if record.outcome(outcome.index).is_some() {
            return Ok(record);
        }

        if let ActionOutcome::Failure { reason, message } = &outcome.outcome {
            warn!(
                execution_id = %id,
                automation_id = %record.automation_id,
                action_index = outcome.index,
                reason = %reason,
                message = %message,
                "Action failed"
            );
        }
        record.action_outcomes.push(outcome);
        self.repository.save(&record).await?;
        Ok(record)
    }

    /// Move a record to a terminal status. Repeating the same terminal status
    /// is a no-op.
    pub async fn finish(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
    ) -> Result<ExecutionRecord> {
        let _guard = self.locks.lock(id).await;
        let mut record = self.load(id).await?;

        if !status.is_terminal() {
            return Err(illegal(id, record.status, status));
        }
        if record.status == status {
            return Ok(record);
        }
        if !record.status.can_become(status) {
            return Err(illegal(id, record.status, status));
        }

        record.status = status;
        record.finished_at = Some(Utc::now());
        self.repository.save(&record).await?;

        info!(
            execution_id = %id,
            automation_id = %record.automation_id,
            status = %status,
            duration_ms = record.duration_ms().unwrap_or(0),
            "Execution finished"
        );
        Ok(record)
    }

    pub async fn get(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        self.load(id).await
    }

    pub async fn query(&self, query: &ExecutionQuery) -> Result<Vec<ExecutionRecord>> {
        self.repository.query(query).await
    }

    pub async fn pending(&self) -> Result<Vec<ExecutionRecord>> {
        self.repository.pending().await
    }

    pub async fn stats(&self, automation_id: AutomationId) -> Result<AutomationStats> {
        let records = self
            .repository
            .query(&ExecutionQuery::for_automation(automation_id))
            .await?;

        let mut stats = AutomationStats::default();
        let mut durations = Vec::new();
        for record in &records {
            stats.executions += 1;
            match record.status {
                ExecutionStatus::Succeeded => stats.succeeded += 1,
                ExecutionStatus::Failed => stats.failed += 1,
                ExecutionStatus::Skipped => stats.skipped += 1,
                ExecutionStatus::Queued | ExecutionStatus::Running => stats.in_flight += 1,
            }
            if let Some(ms) = record.duration_ms() {
                durations.push(ms as f64);
            }
        }

        // Newest first.
        if let Some(latest) = records.first() {
            stats.last_run_at = Some(latest.created_at);
            stats.last_status = Some(latest.status);
        }
        if !durations.is_empty() {
            stats.avg_duration_ms = Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        Ok(stats)
    }

    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let removed = self.repository.purge_before(cutoff).await?;
        info!(removed, cutoff = %cutoff, "Purged execution records");
        Ok(removed)
    }

    async fn load(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| AutomationError::NotFound(format!("execution {}", id)))
    }
}

fn illegal(id: ExecutionId, from: ExecutionStatus, to: ExecutionStatus) -> AutomationError {
    warn!(execution_id = %id, from = %from, to = %to, "Rejected execution status change");
    AutomationError::IllegalStateTransition(format!(
        "execution {} cannot go from {} to {}",
        id, from, to
    ))
}
