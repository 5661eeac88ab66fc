//! The user-facing write path that moves a work item between states.

use crate::authorizer::{Decision, TransitionAuthorizer};
use crate::outbox::EventOutbox;
use crate::{Result, WorkflowError};
use flowrule_core::{
    AppError, EntityEvent, EntityId, EntitySnapshot, EntityStore, EventKind, Principal, StateId,
    STATE_FIELD,
};
use flowrule_infra::KeyedLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub entity_id: EntityId,
    pub to_state: StateId,
    pub actor: Principal,
}

/// Serialized, authorized state changes.
///
/// The entity lock is held from the snapshot read until the resulting event is
/// queued on the outbox, so no other transition or automation action on the
/// same entity can interleave. The outbox is flushed after the lock is
/// released.
pub struct TransitionService {
    authorizer: Arc<TransitionAuthorizer>,
    entities: Arc<dyn EntityStore>,
    outbox: Arc<EventOutbox>,
    entity_locks: KeyedLock<EntityId>,
    conflict_retries: u32,
}

impl TransitionService {
    pub fn new(
        authorizer: Arc<TransitionAuthorizer>,
        entities: Arc<dyn EntityStore>,
        outbox: Arc<EventOutbox>,
        entity_locks: KeyedLock<EntityId>,
    ) -> Self {
        Self {
            authorizer,
            entities,
            outbox,
            entity_locks,
            conflict_retries: 3,
        }
    }

    /// How many version conflicts a single request absorbs before failing.
    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    pub async fn transition(&self, request: TransitionRequest) -> Result<EntitySnapshot> {
        let TransitionRequest {
            entity_id,
            to_state,
            actor,
        } = request;

        let (from_state, updated) = {
            let _guard = self.entity_locks.lock(entity_id).await;
            let mut conflicts = 0;
            loop {
                let snapshot = self.entities.get_snapshot(entity_id).await?;
                let from_state = snapshot.state_id().ok_or_else(|| {
                    WorkflowError::Validation(format!(
                        "entity {} has no workflow state",
                        entity_id
                    ))
                })?;

                let decision = self
                    .authorizer
                    .authorize(snapshot.project_id, entity_id, from_state, to_state, &actor)
                    .await?;
                if let Decision::Deny(reason) = decision {
                    return Err(WorkflowError::Denied(reason));
                }

                if from_state == to_state {
                    return Ok(snapshot);
                }

                let old_value = Value::String(from_state.to_string());
                let new_value = Value::String(to_state.to_string());
                let written = self
                    .entities
                    .apply_property_change(
                        entity_id,
                        STATE_FIELD,
                        new_value.clone(),
                        snapshot.version,
                    )
                    .await;
                match written {
                    Ok(updated) => {
                        let event =
                            EntityEvent::new(EventKind::StateChanged, &updated, actor.clone())
                                .with_change(STATE_FIELD, old_value, new_value);
                        self.outbox.enqueue(event).await;
                        break (from_state, updated);
                    }
                    Err(AppError::VersionConflict { .. }) if conflicts < self.conflict_retries => {
                        conflicts += 1;
                        debug!(
                            entity_id = %entity_id,
                            conflicts,
                            "Version conflict, re-reading entity"
                        );
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        self.outbox.flush().await;

        info!(
            entity_id = %entity_id,
            from = %from_state,
            to = %to_state,
            actor = %actor,
            version = updated.version,
            "State changed"
        );

        Ok(updated)
    }
}
