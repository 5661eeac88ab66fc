//! Matches entity events to enabled automations.

use crate::ledger::{Enqueued, ExecutionLedger, ExecutionRecord};
use crate::model::Automation;
use crate::runner::ExecutionRunner;
use crate::store::AutomationStore;
use crate::Result;
use flowrule_core::{EntityEvent, EntityStore, ExecutionId, Scope};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct TriggerDispatcher {
    automations: Arc<AutomationStore>,
    ledger: Arc<ExecutionLedger>,
    runner: Arc<ExecutionRunner>,
    entities: Arc<dyn EntityStore>,
    max_cascade_depth: u32,
}

impl TriggerDispatcher {
    pub fn new(
        automations: Arc<AutomationStore>,
        ledger: Arc<ExecutionLedger>,
        runner: Arc<ExecutionRunner>,
        entities: Arc<dyn EntityStore>,
        max_cascade_depth: u32,
    ) -> Self {
        Self {
            automations,
            ledger,
            runner,
            entities,
            max_cascade_depth,
        }
    }

    /// Enabled automations that should react to `event`, in creation order.
    ///
    /// Project and workspace automations are both considered. An automation
    /// never reacts to an event its own actions produced.
    pub async fn matching(&self, event: &EntityEvent) -> Result<Vec<Automation>> {
        let origin = event.originating_automation();
        let mut matched = Vec::new();
        for scope in [
            Scope::Project(event.project_id),
            Scope::Workspace(event.workspace_id),
        ] {
            let candidates = self.automations.list_enabled_for(scope, event.kind).await?;
            matched.extend(
                candidates
                    .iter()
                    .filter(|a| Some(a.id) != origin)
                    .filter(|a| a.trigger.as_ref().map(|t| t.matches(event)).unwrap_or(false))
                    .cloned(),
            );
        }
        matched.sort_by_key(|a| a.creation_seq);
        Ok(matched)
    }

    /// Enqueue one record per matching automation, then run them in order.
    ///
    /// Returns the ids of newly enqueued records; redelivered events return
    /// an empty list. A failing run is logged and does not stop the others.
    pub async fn on_event(&self, event: &EntityEvent) -> Result<Vec<ExecutionId>> {
        if event.cascade_depth > self.max_cascade_depth {
            warn!(
                event_id = %event.event_id,
                entity_id = %event.entity_id,
                cascade_depth = event.cascade_depth,
                max = self.max_cascade_depth,
                "Dropping event past the cascade limit"
            );
            return Ok(Vec::new());
        }

        let matched = self.matching(event).await?;
        if matched.is_empty() {
            debug!(event_id = %event.event_id, kind = %event.kind, "No automations matched");
            return Ok(Vec::new());
        }

        let snapshot = match &event.snapshot {
            Some(snapshot) => snapshot.clone(),
            None => self.entities.get_snapshot(event.entity_id).await?,
        };

        let mut enqueued = Vec::with_capacity(matched.len());
        for automation in matched {
            let record = ExecutionRecord::new(automation, event, snapshot.clone());
            if let Enqueued::Created(record) = self.ledger.enqueue(record).await? {
                enqueued.push(record.id);
            }
        }

        for id in &enqueued {
            if let Err(e) = self.runner.run(*id).await {
                error!(
                    execution_id = %id,
                    event_id = %event.event_id,
                    error = %e,
                    "Execution failed to run"
                );
            }
        }

        Ok(enqueued)
    }
}
