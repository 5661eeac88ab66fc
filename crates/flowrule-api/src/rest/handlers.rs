//! HTTP request handlers

use crate::error::{ApiError, ApiResult};
use crate::rest::extract::Actor;
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use flowrule_automation::{
    Automation, AutomationActivity, AutomationDraft, AutomationStats, AutomationUpdate,
    ExecutionQuery, ExecutionRecord, ExecutionStatus,
};
use flowrule_core::{
    AppError, AutomationId, EntityEvent, EntityId, EntitySnapshot, Principal, ProjectId, Scope,
    StateId, WorkspaceId,
};
use flowrule_workflow::{
    State as WorkflowState, TransitionRequest, TransitionRule, WorkflowChange,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

type Shared = State<Arc<AppState>>;

// Workflow

pub async fn create_project(
    State(state): Shared,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<impl IntoResponse> {
    let graph = state.engine.graphs().create_project(project_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "project_id": project_id,
            "version": graph.version(),
            "workflow_enabled": graph.is_workflow_enabled(),
        })),
    ))
}

pub async fn list_states(
    State(state): Shared,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<Json<Vec<WorkflowState>>> {
    Ok(Json(state.engine.graphs().list_states(project_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct NewState {
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub allow_issue_creation: Option<bool>,
}

pub async fn add_state(
    State(state): Shared,
    Actor(actor): Actor,
    Path(project_id): Path<ProjectId>,
    Json(body): Json<NewState>,
) -> ApiResult<impl IntoResponse> {
    let mut new_state = WorkflowState::new(project_id, body.name);
    if body.is_default {
        new_state = new_state.as_default();
    } else if let Some(allowed) = body.allow_issue_creation {
        new_state = new_state.with_creation_allowed(allowed);
    }
    let state_id = new_state.id;
    let graph = state.engine.graphs().add_state(new_state, &actor).await?;
    let created = graph.state(state_id).cloned();
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Debug, Deserialize)]
pub struct NewTransition {
    pub from_state: StateId,
    pub to_state: StateId,
    #[serde(default)]
    pub movers: Vec<Principal>,
}

pub async fn add_transition(
    State(state): Shared,
    Actor(actor): Actor,
    Path(project_id): Path<ProjectId>,
    Json(body): Json<NewTransition>,
) -> ApiResult<impl IntoResponse> {
    let graph = state
        .engine
        .graphs()
        .add_transition(project_id, body.from_state, body.to_state, body.movers, &actor)
        .await?;
    let rule = graph.rule(body.from_state, body.to_state).cloned();
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn remove_transition(
    State(state): Shared,
    Actor(actor): Actor,
    Path((project_id, from, to)): Path<(ProjectId, StateId, StateId)>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .graphs()
        .remove_transition(project_id, from, to, &actor)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Delete every transition rule of the project.
pub async fn reset_workflow(
    State(state): Shared,
    Actor(actor): Actor,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<StatusCode> {
    state.engine.graphs().reset_workflow(project_id, &actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct WorkflowToggle {
    pub enabled: bool,
}

pub async fn set_workflow_enabled(
    State(state): Shared,
    Actor(actor): Actor,
    Path(project_id): Path<ProjectId>,
    Json(body): Json<WorkflowToggle>,
) -> ApiResult<Json<serde_json::Value>> {
    let graph = state
        .engine
        .graphs()
        .set_workflow_enabled(project_id, body.enabled, &actor)
        .await?;
    Ok(Json(json!({
        "project_id": project_id,
        "version": graph.version(),
        "workflow_enabled": graph.is_workflow_enabled(),
    })))
}

pub async fn list_transitions(
    State(state): Shared,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<Json<Vec<TransitionRule>>> {
    let rules = state.engine.graphs().list_transitions(project_id).await?;
    Ok(Json(rules))
}

pub async fn workflow_history(
    State(state): Shared,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<Json<Vec<WorkflowChange>>> {
    let history = state.engine.graphs().change_history(project_id).await?;
    Ok(Json(history))
}

#[derive(Debug, Deserialize)]
pub struct TransitionBody {
    pub to_state: StateId,
}

pub async fn transition_entity(
    State(state): Shared,
    Actor(actor): Actor,
    Path(entity_id): Path<EntityId>,
    Json(body): Json<TransitionBody>,
) -> ApiResult<Json<EntitySnapshot>> {
    let snapshot = state
        .engine
        .transition(TransitionRequest {
            entity_id,
            to_state: body.to_state,
            actor,
        })
        .await?;
    Ok(Json(snapshot))
}

// Automations

#[derive(Debug, Default, Deserialize)]
pub struct ListAutomationsParams {
    pub project_id: Option<ProjectId>,
    pub workspace_id: Option<WorkspaceId>,
}

pub async fn list_automations(
    State(state): Shared,
    Query(params): Query<ListAutomationsParams>,
) -> ApiResult<Json<Vec<Automation>>> {
    let scope = match (params.project_id, params.workspace_id) {
        (Some(_), Some(_)) => {
            return Err(ApiError::BadRequest(
                "filter by project_id or workspace_id, not both".to_string(),
            ))
        }
        (Some(project), None) => Some(Scope::Project(project)),
        (None, Some(workspace)) => Some(Scope::Workspace(workspace)),
        (None, None) => None,
    };
    Ok(Json(state.engine.automations().list(scope).await?))
}

pub async fn create_automation(
    State(state): Shared,
    Actor(actor): Actor,
    Json(draft): Json<AutomationDraft>,
) -> ApiResult<impl IntoResponse> {
    let automation = state.engine.automations().create(draft, &actor).await?;
    Ok((StatusCode::CREATED, Json(automation)))
}

pub async fn get_automation(
    State(state): Shared,
    Path(id): Path<AutomationId>,
) -> ApiResult<Json<Automation>> {
    Ok(Json(state.engine.automations().get(id).await?))
}

pub async fn update_automation(
    State(state): Shared,
    Actor(actor): Actor,
    Path(id): Path<AutomationId>,
    Json(update): Json<AutomationUpdate>,
) -> ApiResult<Json<Automation>> {
    Ok(Json(
        state.engine.automations().update(id, update, &actor).await?,
    ))
}

pub async fn delete_automation(
    State(state): Shared,
    Actor(actor): Actor,
    Path(id): Path<AutomationId>,
) -> ApiResult<StatusCode> {
    state.engine.automations().delete(id, &actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn enable_automation(
    State(state): Shared,
    Actor(actor): Actor,
    Path(id): Path<AutomationId>,
) -> ApiResult<Json<Automation>> {
    Ok(Json(state.engine.automations().enable(id, &actor).await?))
}

pub async fn disable_automation(
    State(state): Shared,
    Actor(actor): Actor,
    Path(id): Path<AutomationId>,
) -> ApiResult<Json<Automation>> {
    Ok(Json(state.engine.automations().disable(id, &actor).await?))
}

pub async fn automation_activity(
    State(state): Shared,
    Path(id): Path<AutomationId>,
) -> ApiResult<Json<Vec<AutomationActivity>>> {
    Ok(Json(state.engine.automations().activity(id).await?))
}

// Executions

#[derive(Debug, Default, Deserialize)]
pub struct ExecutionsParams {
    pub status: Option<ExecutionStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failures_only: bool,
    pub limit: Option<usize>,
}

impl ExecutionsParams {
    fn into_query(self, automation_id: AutomationId) -> ApiResult<ExecutionQuery> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(ApiError::BadRequest(
                    "`from` must not be after `to`".to_string(),
                ));
            }
        }
        Ok(ExecutionQuery {
            automation_id: Some(automation_id),
            status: self.status,
            from: self.from,
            to: self.to,
            failures_only: self.failures_only,
            limit: self.limit,
        })
    }
}

pub async fn list_executions(
    State(state): Shared,
    Path(id): Path<AutomationId>,
    Query(params): Query<ExecutionsParams>,
) -> ApiResult<Json<Vec<ExecutionRecord>>> {
    let query = params.into_query(id)?;
    Ok(Json(state.engine.ledger().query(&query).await?))
}

pub async fn automation_stats(
    State(state): Shared,
    Path(id): Path<AutomationId>,
) -> ApiResult<Json<AutomationStats>> {
    Ok(Json(state.engine.ledger().stats(id).await?))
}

// Events

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub event_id: String,
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executions: Option<Vec<String>>,
}

/// Accept an entity event. Queued when the processor is running, otherwise
/// dispatched before responding.
pub async fn ingest_event(
    State(state): Shared,
    Json(event): Json<EntityEvent>,
) -> ApiResult<impl IntoResponse> {
    let event_id = event.event_id.to_string();

    if let Some(queue) = &state.events {
        queue.send(event).await.map_err(|_| {
            ApiError::from(flowrule_automation::AutomationError::Core(
                AppError::TransientIo("event queue is closed".to_string()),
            ))
        })?;
        debug!(event_id = %event_id, "Event queued");
        return Ok((
            StatusCode::ACCEPTED,
            Json(IngestResponse {
                event_id,
                queued: true,
                executions: None,
            }),
        ));
    }

    let executions = state.engine.on_event(&event).await?;
    info!(
        event_id = %event_id,
        executions = executions.len(),
        "Event dispatched"
    );
    Ok((
        StatusCode::OK,
        Json(IngestResponse {
            event_id,
            queued: false,
            executions: Some(executions.iter().map(ToString::to_string).collect()),
        }),
    ))
}

// Health

pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "flowrule",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
