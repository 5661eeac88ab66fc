//! Contracts for the collaborators the engine consumes but does not own.

use crate::error::Result;
use crate::events::EntityEvent;
use crate::types::{CommentId, EntityId, EntitySnapshot, Principal, ProjectId};
use async_trait::async_trait;

/// Work-item storage with optimistic concurrency.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetch the current fields and version of an entity.
    async fn get_snapshot(&self, entity_id: EntityId) -> Result<EntitySnapshot>;

    /// Write one field if the entity is still at `expected_version`.
    ///
    /// Returns the committed snapshot, or `AppError::VersionConflict` when
    /// another writer got there first.
    async fn apply_property_change(
        &self,
        entity_id: EntityId,
        field: &str,
        value: serde_json::Value,
        expected_version: u64,
    ) -> Result<EntitySnapshot>;
}

/// Comment / notification subsystem.
#[async_trait]
pub trait CommentService: Send + Sync {
    /// Post a comment. Repeating a call with the same `idempotency_key`
    /// returns the original comment instead of creating a second one.
    async fn post_comment(
        &self,
        entity_id: EntityId,
        body: &str,
        idempotency_key: &str,
    ) -> Result<CommentId>;
}

/// Identity / permission subsystem.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Whether `actor` holds the administrative override for workflow rules
    /// in `project_id`.
    async fn has_override(&self, project_id: ProjectId, actor: &Principal) -> Result<bool>;
}

/// Outbound side of the event bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: EntityEvent) -> Result<()>;
}
