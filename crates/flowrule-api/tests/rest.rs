use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use flowrule_api::{create_router, AppState};
use flowrule_automation::{AutomationEngine, Collaborators};
use flowrule_core::memory::{
    InMemoryCommentService, InMemoryEntityStore, InMemoryEventPublisher, StaticIdentityService,
};
use flowrule_core::{
    EngineConfig, EntityEvent, EntityId, EntitySnapshot, EventKind, Principal, ProjectId, StateId,
    WorkspaceId,
};
use flowrule_workflow::State;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::ServiceExt;

struct TestApp {
    engine: Arc<AutomationEngine>,
    entities: Arc<InMemoryEntityStore>,
    comments: Arc<InMemoryCommentService>,
    project: ProjectId,
    todo: StateId,
    done: StateId,
}

impl TestApp {
    async fn new() -> Self {
        let entities = Arc::new(InMemoryEntityStore::new());
        let comments = Arc::new(InMemoryCommentService::new());
        let engine = Arc::new(AutomationEngine::new(
            EngineConfig::default().with_backoff(1, 10),
            Collaborators {
                entities: entities.clone(),
                comments: comments.clone(),
                identity: Arc::new(StaticIdentityService::new()),
                publisher: Arc::new(InMemoryEventPublisher::new()),
            },
        ));

        let admin = Principal::from("admin");
        let project = ProjectId::new();
        let graphs = engine.graphs();
        graphs.create_project(project).await.unwrap();
        let todo = State::new(project, "Todo");
        let done = State::new(project, "Done");
        let (todo_id, done_id) = (todo.id, done.id);
        graphs.add_state(todo, &admin).await.unwrap();
        graphs.add_state(done, &admin).await.unwrap();
        graphs
            .add_transition(project, todo_id, done_id, vec![admin.clone()], &admin)
            .await
            .unwrap();
        graphs
            .set_workflow_enabled(project, true, &admin)
            .await
            .unwrap();

        Self {
            engine,
            entities,
            comments,
            project,
            todo: todo_id,
            done: done_id,
        }
    }

    fn router(&self) -> Router {
        create_router(AppState::new(Arc::clone(&self.engine)))
    }

    async fn send(&self, method: &str, uri: &str, actor: &str, body: Option<Value>) -> (StatusCode, Value) {
        send(self.router(), method, uri, actor, body).await
    }

    async fn entity(&self) -> EntitySnapshot {
        let snapshot = EntitySnapshot::new(EntityId::new(), self.project, WorkspaceId::new(), "work_item")
            .with_state(self.todo)
            .with_field("name", json!("Crash on save"));
        self.entities.insert(snapshot.clone()).await;
        snapshot
    }

    fn welcome_draft(&self) -> Value {
        json!({
            "scope": { "type": "project", "id": self.project },
            "name": "Welcome",
            "trigger": { "event_kind": "entity_created", "entity_type": "work_item" },
            "actions": [
                { "type": "add_comment", "body_template": "Thanks for reporting {{name}}" }
            ]
        })
    }

    async fn create_enabled(&self) -> String {
        let (status, created) = self
            .send("POST", "/api/v1/automations", "admin", Some(self.welcome_draft()))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap().to_string();
        let (status, _) = self
            .send("POST", &format!("/api/v1/automations/{id}/enable"), "admin", None)
            .await;
        assert_eq!(status, StatusCode::OK);
        id
    }
}

async fn send(
    router: Router,
    method: &str,
    uri: &str,
    actor: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-actor", actor);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = router.oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn health_is_served_at_root_and_under_api() {
    let app = TestApp::new().await;
    for uri in ["/health", "/api/v1/health"] {
        let (status, body) = app.send("GET", uri, "anyone", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}

#[tokio::test]
async fn automation_lifecycle() {
    let app = TestApp::new().await;

    let (status, created) = app
        .send("POST", "/api/v1/automations", "admin", Some(app.welcome_draft()))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["state"], "disabled");
    assert_eq!(created["created_by"], "admin");
    let id = created["id"].as_str().unwrap().to_string();

    let (status, updated) = app
        .send(
            "PUT",
            &format!("/api/v1/automations/{id}"),
            "admin",
            Some(json!({ "name": "Greeter" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["name"], "Greeter");

    let (status, enabled) = app
        .send("POST", &format!("/api/v1/automations/{id}/enable"), "admin", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(enabled["state"], "enabled");

    let (status, body) = app
        .send("DELETE", &format!("/api/v1/automations/{id}"), "admin", None)
        .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["error"]["code"], "PRECONDITION_FAILED");

    app.send("POST", &format!("/api/v1/automations/{id}/disable"), "admin", None)
        .await;
    let (status, _) = app
        .send("DELETE", &format!("/api/v1/automations/{id}"), "admin", None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = app
        .send("GET", &format!("/api/v1/automations/{id}"), "admin", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn enabling_without_actions_is_rejected() {
    let app = TestApp::new().await;
    let mut draft = app.welcome_draft();
    draft["actions"] = json!([]);
    let (_, created) = app.send("POST", "/api/v1/automations", "admin", Some(draft)).await;
    let id = created["id"].as_str().unwrap();

    let (status, body) = app
        .send("POST", &format!("/api/v1/automations/{id}/enable"), "admin", None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn ingested_events_run_automations_and_fill_the_ledger() {
    let app = TestApp::new().await;
    let id = app.create_enabled().await;
    let entity = app.entity().await;

    let event = EntityEvent::new(EventKind::EntityCreated, &entity, Principal::from("member"));
    let (status, body) = app
        .send("POST", "/api/v1/events", "member", Some(serde_json::to_value(&event).unwrap()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queued"], false);
    assert_eq!(body["executions"].as_array().unwrap().len(), 1);

    let comments = app.comments.comments_for(entity.entity_id).await;
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].body, "Thanks for reporting Crash on save");

    let (status, executions) = app
        .send("GET", &format!("/api/v1/automations/{id}/executions"), "admin", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(executions[0]["status"], "succeeded");

    let (_, failed) = app
        .send(
            "GET",
            &format!("/api/v1/automations/{id}/executions?failures_only=true"),
            "admin",
            None,
        )
        .await;
    assert!(failed.as_array().unwrap().is_empty());

    let (_, by_status) = app
        .send(
            "GET",
            &format!("/api/v1/automations/{id}/executions?status=skipped"),
            "admin",
            None,
        )
        .await;
    assert!(by_status.as_array().unwrap().is_empty());

    let (status, stats) = app
        .send("GET", &format!("/api/v1/automations/{id}/stats"), "admin", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["executions"], 1);
    assert_eq!(stats["succeeded"], 1);
    assert_eq!(stats["last_status"], "succeeded");
}

#[tokio::test]
async fn inverted_date_range_is_a_bad_request() {
    let app = TestApp::new().await;
    let id = app.create_enabled().await;
    let (status, body) = app
        .send(
            "GET",
            &format!(
                "/api/v1/automations/{id}/executions?from=2026-02-01T00:00:00Z&to=2026-01-01T00:00:00Z"
            ),
            "admin",
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn queued_ingestion_hands_events_to_the_processor() {
    let app = TestApp::new().await;
    let (tx, mut rx) = mpsc::channel(8);
    let router = create_router(AppState::new(Arc::clone(&app.engine)).with_event_queue(tx));
    let entity = app.entity().await;
    let event = EntityEvent::new(EventKind::EntityCreated, &entity, Principal::from("member"));

    let (status, body) = send(
        router,
        "POST",
        "/api/v1/events",
        "member",
        Some(serde_json::to_value(&event).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["queued"], true);
    assert_eq!(rx.recv().await.unwrap().event_id, event.event_id);
}

#[tokio::test]
async fn transitions_are_authorized_per_actor() {
    let app = TestApp::new().await;
    let entity = app.entity().await;
    let uri = format!("/api/v1/entities/{}/transition", entity.entity_id);
    let body = json!({ "to_state": app.done });

    let (status, denied) = app.send("POST", &uri, "member", Some(body.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(denied["error"]["code"], "NOT_AUTHORIZED_MOVER");

    let (status, moved) = app.send("POST", &uri, "admin", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(moved["fields"]["state"], json!(app.done));
}

#[tokio::test]
async fn workflow_views() {
    let app = TestApp::new().await;

    let (status, transitions) = app
        .send(
            "GET",
            &format!("/api/v1/projects/{}/transitions", app.project),
            "admin",
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(transitions.as_array().unwrap().len(), 1);
    assert_eq!(transitions[0]["movers"], json!(["admin"]));

    let (status, history) = app
        .send(
            "GET",
            &format!("/api/v1/projects/{}/workflow/history", app.project),
            "admin",
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let kinds: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|change| change["type"].as_str().unwrap())
        .collect();
    assert!(kinds.contains(&"transition_added"));
    assert_eq!(kinds.last(), Some(&"workflow_enabled"));

    let (status, _) = app
        .send(
            "GET",
            &format!("/api/v1/projects/{}/transitions", ProjectId::new()),
            "admin",
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn workflow_can_be_built_over_http() {
    let app = TestApp::new().await;
    let project = ProjectId::new();
    let base = format!("/api/v1/projects/{project}");

    let (status, created) = app.send("POST", &base, "admin", None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["workflow_enabled"], false);

    let (status, _) = app.send("POST", &base, "admin", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, open) = app
        .send(
            "POST",
            &format!("{base}/states"),
            "admin",
            Some(json!({ "name": "Open", "is_default": true })),
        )
        .await;
    let (_, closed) = app
        .send(
            "POST",
            &format!("{base}/states"),
            "admin",
            Some(json!({ "name": "Closed", "allow_issue_creation": false })),
        )
        .await;
    assert_eq!(closed["allow_issue_creation"], false);

    let (status, rule) = app
        .send(
            "POST",
            &format!("{base}/transitions"),
            "admin",
            Some(json!({
                "from_state": open["id"],
                "to_state": closed["id"],
                "movers": ["lead"]
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(rule["movers"], json!(["lead"]));

    let (status, toggled) = app
        .send(
            "PUT",
            &format!("{base}/workflow"),
            "admin",
            Some(json!({ "enabled": true })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(toggled["workflow_enabled"], true);

    let (_, states) = app.send("GET", &format!("{base}/states"), "admin", None).await;
    assert_eq!(states.as_array().unwrap().len(), 2);

    let (status, _) = app
        .send(
            "DELETE",
            &format!(
                "{base}/transitions/{}/{}",
                open["id"].as_str().unwrap(),
                closed["id"].as_str().unwrap()
            ),
            "admin",
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, transitions) = app
        .send("GET", &format!("{base}/transitions"), "admin", None)
        .await;
    assert!(transitions.as_array().unwrap().is_empty());
}
