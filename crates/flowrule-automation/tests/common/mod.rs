#![allow(dead_code)]

use flowrule_automation::{Automation, AutomationDraft, AutomationEngine, Collaborators};
use flowrule_core::memory::{
    InMemoryCommentService, InMemoryEntityStore, InMemoryEventPublisher, StaticIdentityService,
};
use flowrule_core::{
    EngineConfig, EntityEvent, EntityId, EntitySnapshot, EntityStore, EventKind, Principal,
    ProjectId, StateId, WorkspaceId,
};
use flowrule_workflow::State;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const ENTITY_TYPE: &str = "work_item";

pub fn admin() -> Principal {
    "admin".into()
}

pub fn member() -> Principal {
    "member".into()
}

pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_backoff(1, 10)
        .with_action_timeout_ms(1_000)
        .with_dispatch_lanes(4)
}

/// An engine over in-memory collaborators with one project whose workflow
/// has `Todo -> Done` (movers: `admin` and `automation`).
pub struct Harness {
    pub engine: AutomationEngine,
    pub entities: Arc<InMemoryEntityStore>,
    pub comments: Arc<InMemoryCommentService>,
    pub publisher: Arc<InMemoryEventPublisher>,
    pub identity: Arc<StaticIdentityService>,
    pub project: ProjectId,
    pub workspace: WorkspaceId,
    pub todo: StateId,
    pub done: StateId,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        Self::build(
            config,
            InMemoryEventPublisher::new(),
            InMemoryCommentService::new(),
        )
        .await
    }

    pub async fn with_comments(config: EngineConfig, comments: InMemoryCommentService) -> Self {
        Self::build(config, InMemoryEventPublisher::new(), comments).await
    }

    /// Harness whose published events are forwarded to the returned receiver.
    pub async fn with_bus(config: EngineConfig) -> (Self, mpsc::Receiver<EntityEvent>) {
        Self::with_bus_capacity(config, 256).await
    }

    pub async fn with_bus_capacity(
        config: EngineConfig,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<EntityEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let harness = Self::build(
            config,
            InMemoryEventPublisher::with_channel(tx),
            InMemoryCommentService::new(),
        )
        .await;
        (harness, rx)
    }

    async fn build(
        config: EngineConfig,
        publisher: InMemoryEventPublisher,
        comments: InMemoryCommentService,
    ) -> Self {
        let entities = Arc::new(InMemoryEntityStore::new());
        let comments = Arc::new(comments);
        let publisher = Arc::new(publisher);
        let identity = Arc::new(StaticIdentityService::new());

        let engine = AutomationEngine::new(
            config,
            Collaborators {
                entities: entities.clone(),
                comments: comments.clone(),
                identity: identity.clone(),
                publisher: publisher.clone(),
            },
        );

        let project = ProjectId::new();
        let graphs = engine.graphs();
        graphs.create_project(project).await.unwrap();
        let todo = State::new(project, "Todo");
        let done = State::new(project, "Done");
        let (todo_id, done_id) = (todo.id, done.id);
        graphs.add_state(todo, &admin()).await.unwrap();
        graphs.add_state(done, &admin()).await.unwrap();
        graphs
            .add_transition(
                project,
                todo_id,
                done_id,
                vec![admin(), Principal::from("automation")],
                &admin(),
            )
            .await
            .unwrap();
        graphs
            .set_workflow_enabled(project, true, &admin())
            .await
            .unwrap();

        Self {
            engine,
            entities,
            comments,
            publisher,
            identity,
            project,
            workspace: WorkspaceId::new(),
            todo: todo_id,
            done: done_id,
        }
    }

    /// Insert a work item in `Todo` with the given fields.
    pub async fn entity(&self, fields: &[(&str, Value)]) -> EntitySnapshot {
        let mut snapshot =
            EntitySnapshot::new(EntityId::new(), self.project, self.workspace, ENTITY_TYPE)
                .with_state(self.todo);
        for (name, value) in fields {
            snapshot = snapshot.with_field(*name, value.clone());
        }
        self.entities.insert(snapshot.clone()).await;
        snapshot
    }

    pub async fn current(&self, entity_id: EntityId) -> EntitySnapshot {
        self.entities.get_snapshot(entity_id).await.unwrap()
    }

    /// Create and enable an automation.
    pub async fn enabled(&self, draft: AutomationDraft) -> Automation {
        let automation = self
            .engine
            .automations()
            .create(draft, &admin())
            .await
            .unwrap();
        self.engine
            .automations()
            .enable(automation.id, &admin())
            .await
            .unwrap()
    }

    /// A user edit of `field`, committed and described by an event.
    pub async fn user_edit(&self, entity_id: EntityId, field: &str, value: Value) -> EntityEvent {
        let before = self.current(entity_id).await;
        let old = before.get(field).cloned().unwrap_or(Value::Null);
        let after = self
            .entities
            .touch(entity_id, field, value.clone())
            .await
            .unwrap();
        EntityEvent::new(EventKind::PropertyChanged, &after, member()).with_change(field, old, value)
    }

    pub fn created_event(&self, snapshot: &EntitySnapshot) -> EntityEvent {
        EntityEvent::new(EventKind::EntityCreated, snapshot, member())
    }
}
