//! In-process collaborator implementations.
//!
//! Used by the server binary when no external backends are configured and by
//! every test suite. The entity store and comment service support fault
//! injection so retry and conflict paths can be exercised deterministically.

use crate::error::{AppError, Result};
use crate::events::EntityEvent;
use crate::traits::{CommentService, EntityStore, EventPublisher, IdentityService};
use crate::types::{CommentId, EntityId, EntitySnapshot, Principal, ProjectId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Consume one unit from a fault-injection counter.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Entity store backed by a map.
pub struct InMemoryEntityStore {
    entities: RwLock<HashMap<EntityId, EntitySnapshot>>,
    injected_conflicts: AtomicU32,
    latency: Option<Duration>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            injected_conflicts: AtomicU32::new(0),
            latency: None,
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub async fn insert(&self, snapshot: EntitySnapshot) {
        let mut entities = self.entities.write().await;
        entities.insert(snapshot.entity_id, snapshot);
    }

    /// Write a field as an outside writer would, bumping the version.
    pub async fn touch(
        &self,
        entity_id: EntityId,
        field: &str,
        value: serde_json::Value,
    ) -> Result<EntitySnapshot> {
        let mut entities = self.entities.write().await;
        let entity = entities
            .get_mut(&entity_id)
            .ok_or_else(|| AppError::NotFound(format!("entity {}", entity_id)))?;
        entity.fields.insert(field.to_string(), value);
        entity.version += 1;
        Ok(entity.clone())
    }

    /// Make the next `count` writes lose a race against a concurrent writer.
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for InMemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get_snapshot(&self, entity_id: EntityId) -> Result<EntitySnapshot> {
        self.simulate_latency().await;
        let entities = self.entities.read().await;
        entities
            .get(&entity_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("entity {}", entity_id)))
    }

    async fn apply_property_change(
        &self,
        entity_id: EntityId,
        field: &str,
        value: serde_json::Value,
        expected_version: u64,
    ) -> Result<EntitySnapshot> {
        self.simulate_latency().await;
        let mut entities = self.entities.write().await;
        let entity = entities
            .get_mut(&entity_id)
            .ok_or_else(|| AppError::NotFound(format!("entity {}", entity_id)))?;

        if take_one(&self.injected_conflicts) {
            entity.version += 1;
        }

        if entity.version != expected_version {
            return Err(AppError::VersionConflict {
                entity_id: entity_id.to_string(),
                expected: expected_version,
                actual: entity.version,
            });
        }

        entity.fields.insert(field.to_string(), value);
        entity.version += 1;
        debug!(entity_id = %entity_id, field = field, version = entity.version, "Entity updated");
        Ok(entity.clone())
    }
}

/// A posted comment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub entity_id: EntityId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

struct CommentLog {
    comments: Vec<Comment>,
    by_key: HashMap<String, CommentId>,
}

/// Comment service that keeps comments in memory and deduplicates by
/// idempotency key.
pub struct InMemoryCommentService {
    log: RwLock<CommentLog>,
    pending_failures: AtomicU32,
    latency: Option<Duration>,
}

impl InMemoryCommentService {
    pub fn new() -> Self {
        Self {
            log: RwLock::new(CommentLog {
                comments: Vec::new(),
                by_key: HashMap::new(),
            }),
            pending_failures: AtomicU32::new(0),
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `count` calls with a transient I/O error.
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    pub async fn comments_for(&self, entity_id: EntityId) -> Vec<Comment> {
        let log = self.log.read().await;
        log.comments
            .iter()
            .filter(|c| c.entity_id == entity_id)
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.log.read().await.comments.len()
    }
}

impl Default for InMemoryCommentService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommentService for InMemoryCommentService {
    async fn post_comment(
        &self,
        entity_id: EntityId,
        body: &str,
        idempotency_key: &str,
    ) -> Result<CommentId> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if take_one(&self.pending_failures) {
            return Err(AppError::TransientIo("comment service unavailable".to_string()));
        }

        let mut log = self.log.write().await;
        if let Some(existing) = log.by_key.get(idempotency_key) {
            return Ok(*existing);
        }

        let comment = Comment {
            id: CommentId::new(),
            entity_id,
            body: body.to_string(),
            created_at: Utc::now(),
        };
        let id = comment.id;
        log.by_key.insert(idempotency_key.to_string(), id);
        log.comments.push(comment);
        Ok(id)
    }
}

/// Identity service with a fixed set of override holders.
pub struct StaticIdentityService {
    overrides: RwLock<HashSet<Principal>>,
}

impl StaticIdentityService {
    pub fn new() -> Self {
        Self {
            overrides: RwLock::new(HashSet::new()),
        }
    }

    pub fn with_override(principals: impl IntoIterator<Item = Principal>) -> Self {
        Self {
            overrides: RwLock::new(principals.into_iter().collect()),
        }
    }

    pub async fn grant_override(&self, principal: Principal) {
        self.overrides.write().await.insert(principal);
    }
}

impl Default for StaticIdentityService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityService for StaticIdentityService {
    async fn has_override(&self, _project_id: ProjectId, actor: &Principal) -> Result<bool> {
        Ok(self.overrides.read().await.contains(actor))
    }
}

/// Event publisher that records every event and optionally forwards it to
/// a channel feeding the event processor.
pub struct InMemoryEventPublisher {
    published: RwLock<Vec<EntityEvent>>,
    forward: Option<mpsc::Sender<EntityEvent>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self {
            published: RwLock::new(Vec::new()),
            forward: None,
        }
    }

    pub fn with_channel(sender: mpsc::Sender<EntityEvent>) -> Self {
        Self {
            published: RwLock::new(Vec::new()),
            forward: Some(sender),
        }
    }

    pub async fn published(&self) -> Vec<EntityEvent> {
        self.published.read().await.clone()
    }
}

impl Default for InMemoryEventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, event: EntityEvent) -> Result<()> {
        self.published.write().await.push(event.clone());
        if let Some(ref sender) = self.forward {
            sender
                .send(event)
                .await
                .map_err(|_| AppError::TransientIo("event bus closed".to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::types::{ProjectId, WorkspaceId};
    use serde_json::json;

    fn entity() -> EntitySnapshot {
        EntitySnapshot::new(
            EntityId::new(),
            ProjectId::new(),
            WorkspaceId::new(),
            "work_item",
        )
        .with_field("priority", json!("low"))
    }

    #[tokio::test]
    async fn test_entity_store_optimistic_write() {
        let store = InMemoryEntityStore::new();
        let snap = entity();
        store.insert(snap.clone()).await;

        let updated = store
            .apply_property_change(snap.entity_id, "priority", json!("high"), 1)
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.get("priority"), Some(&json!("high")));

        let stale = store
            .apply_property_change(snap.entity_id, "priority", json!("low"), 1)
            .await;
        assert!(matches!(stale, Err(AppError::VersionConflict { actual: 2, .. })));
    }

    #[tokio::test]
    async fn test_entity_store_injected_conflict() {
        let store = InMemoryEntityStore::new();
        let snap = entity();
        store.insert(snap.clone()).await;
        store.inject_conflicts(1);

        let first = store
            .apply_property_change(snap.entity_id, "priority", json!("high"), 1)
            .await;
        assert!(first.unwrap_err().is_conflict());

        let fresh = store.get_snapshot(snap.entity_id).await.unwrap();
        let second = store
            .apply_property_change(snap.entity_id, "priority", json!("high"), fresh.version)
            .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_missing_entity() {
        let store = InMemoryEntityStore::new();
        let err = store.get_snapshot(EntityId::new()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_comment_idempotency_key() {
        let comments = InMemoryCommentService::new();
        let entity_id = EntityId::new();

        let first = comments.post_comment(entity_id, "hello", "exec:0").await.unwrap();
        let second = comments.post_comment(entity_id, "hello", "exec:0").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(comments.count().await, 1);
    }

    #[tokio::test]
    async fn test_comment_fault_injection() {
        let comments = InMemoryCommentService::new();
        comments.fail_next(2);
        let entity_id = EntityId::new();

        assert!(comments.post_comment(entity_id, "a", "k").await.is_err());
        assert!(comments.post_comment(entity_id, "a", "k").await.is_err());
        assert!(comments.post_comment(entity_id, "a", "k").await.is_ok());
        assert_eq!(comments.comments_for(entity_id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_identity_override() {
        let identity = StaticIdentityService::with_override(vec![Principal::from("owner")]);
        let project = ProjectId::new();
        assert!(identity.has_override(project, &"owner".into()).await.unwrap());
        assert!(!identity.has_override(project, &"member".into()).await.unwrap());

        identity.grant_override("member".into()).await;
        assert!(identity.has_override(project, &"member".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_publisher_forwards_to_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let publisher = InMemoryEventPublisher::with_channel(tx);
        let event = EntityEvent::new(EventKind::EntityCreated, &entity(), "member".into());

        publisher.publish(event.clone()).await.unwrap();

        assert_eq!(publisher.published().await.len(), 1);
        assert_eq!(rx.recv().await.unwrap().event_id, event.event_id);
    }
}
