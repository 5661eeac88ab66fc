//! Wiring for the whole rule engine.

use crate::dispatcher::TriggerDispatcher;
use crate::executor::ActionExecutor;
use crate::ledger::{ExecutionLedger, ExecutionRecord};
use crate::processor::EventProcessor;
use crate::runner::ExecutionRunner;
use crate::store::AutomationStore;
use crate::Result;
use chrono::Utc;
use flowrule_core::{
    CommentService, EngineConfig, EntityEvent, EntityId, EntitySnapshot, EntityStore,
    EventPublisher, ExecutionId, IdentityService,
};
use flowrule_infra::{KeyedLock, RetryPolicy};
use flowrule_workflow::{
    EventOutbox, StateGraphStore, TransitionAuthorizer, TransitionRequest, TransitionService,
};
use std::sync::Arc;
use tracing::info;

/// External systems the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub entities: Arc<dyn EntityStore>,
    pub comments: Arc<dyn CommentService>,
    pub identity: Arc<dyn IdentityService>,
    pub publisher: Arc<dyn EventPublisher>,
}

/// Owns the stores, the ledger, and the execution pipeline.
///
/// State transitions requested by users and property changes made by
/// automations share one per-entity lock table and one event outbox, so the
/// events they emit reach the bus in commit order.
pub struct AutomationEngine {
    config: EngineConfig,
    outbox: Arc<EventOutbox>,
    graphs: Arc<StateGraphStore>,
    automations: Arc<AutomationStore>,
    ledger: Arc<ExecutionLedger>,
    runner: Arc<ExecutionRunner>,
    dispatcher: Arc<TriggerDispatcher>,
    transitions: TransitionService,
}

impl AutomationEngine {
    /// Engine backed by in-memory stores.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        Self::with_stores(
            config,
            collaborators,
            Arc::new(StateGraphStore::in_memory()),
            Arc::new(AutomationStore::in_memory()),
            Arc::new(ExecutionLedger::in_memory()),
        )
    }

    pub fn with_stores(
        config: EngineConfig,
        collaborators: Collaborators,
        graphs: Arc<StateGraphStore>,
        automations: Arc<AutomationStore>,
        ledger: Arc<ExecutionLedger>,
    ) -> Self {
        let Collaborators {
            entities,
            comments,
            identity,
            publisher,
        } = collaborators;

        let entity_locks: KeyedLock<EntityId> = KeyedLock::new();
        let outbox = Arc::new(EventOutbox::new(
            publisher,
            RetryPolicy::exponential(
                config.max_action_attempts,
                config.initial_backoff(),
                config.max_backoff(),
            ),
            config.action_timeout(),
        ));
        let authorizer = Arc::new(TransitionAuthorizer::new(Arc::clone(&graphs), identity));

        let executor = Arc::new(ActionExecutor::new(
            Arc::clone(&authorizer),
            Arc::clone(&entities),
            comments,
            Arc::clone(&outbox),
            &config,
        ));
        let runner = Arc::new(ExecutionRunner::new(
            Arc::clone(&ledger),
            executor,
            entity_locks.clone(),
        ));
        let dispatcher = Arc::new(TriggerDispatcher::new(
            Arc::clone(&automations),
            Arc::clone(&ledger),
            Arc::clone(&runner),
            Arc::clone(&entities),
            config.max_cascade_depth,
        ));
        let transitions =
            TransitionService::new(authorizer, entities, Arc::clone(&outbox), entity_locks)
                .with_conflict_retries(config.conflict_retries);

        Self {
            config,
            outbox,
            graphs,
            automations,
            ledger,
            runner,
            dispatcher,
            transitions,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn graphs(&self) -> &Arc<StateGraphStore> {
        &self.graphs
    }

    pub fn automations(&self) -> &Arc<AutomationStore> {
        &self.automations
    }

    pub fn ledger(&self) -> &Arc<ExecutionLedger> {
        &self.ledger
    }

    pub fn dispatcher(&self) -> &Arc<TriggerDispatcher> {
        &self.dispatcher
    }

    /// Dispatch one event inline and return the records it enqueued.
    ///
    /// Events emitted by the runs are published before this returns. Must not
    /// be called from a task that consumes the event bus.
    pub async fn on_event(&self, event: &EntityEvent) -> Result<Vec<ExecutionId>> {
        let enqueued = self.dispatcher.on_event(event).await?;
        self.outbox.flush().await;
        Ok(enqueued)
    }

    /// Authorized state change on behalf of a user.
    pub async fn transition(&self, request: TransitionRequest) -> Result<EntitySnapshot> {
        Ok(self.transitions.transition(request).await?)
    }

    pub async fn resume_pending(&self) -> Result<Vec<ExecutionRecord>> {
        self.runner.resume_pending().await
    }

    /// Delete terminal records older than the configured retention.
    pub async fn purge_expired(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.config.ledger_retention();
        self.ledger.purge_before(cutoff).await
    }

    /// Spawn the per-entity dispatch lanes.
    pub fn start_processor(&self) -> EventProcessor {
        info!(
            lanes = self.config.dispatch_lanes,
            buffer = self.config.event_buffer_size,
            "Starting automation processor"
        );
        EventProcessor::start(
            Arc::clone(&self.dispatcher),
            self.config.dispatch_lanes,
            self.config.event_buffer_size,
        )
    }
}
