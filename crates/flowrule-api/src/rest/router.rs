//! Axum router configuration

use crate::{rest::handlers, AppState};
use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    routing::{delete, get, post, put},
    Router,
};
use std::{sync::Arc, time::Duration};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::extract::ACTOR_HEADER;

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    let api_v1 = Router::new()
        // Workflow routes
        .route("/projects/:project_id", post(handlers::create_project))
        .route(
            "/projects/:project_id/states",
            get(handlers::list_states).post(handlers::add_state),
        )
        .route(
            "/projects/:project_id/transitions",
            get(handlers::list_transitions)
                .post(handlers::add_transition)
                .delete(handlers::reset_workflow),
        )
        .route(
            "/projects/:project_id/transitions/:from_state/:to_state",
            delete(handlers::remove_transition),
        )
        .route(
            "/projects/:project_id/workflow",
            put(handlers::set_workflow_enabled),
        )
        .route(
            "/projects/:project_id/workflow/history",
            get(handlers::workflow_history),
        )
        .route(
            "/entities/:entity_id/transition",
            post(handlers::transition_entity),
        )
        // Automation routes
        .route(
            "/automations",
            get(handlers::list_automations).post(handlers::create_automation),
        )
        .route(
            "/automations/:id",
            get(handlers::get_automation)
                .put(handlers::update_automation)
                .delete(handlers::delete_automation),
        )
        .route("/automations/:id/enable", post(handlers::enable_automation))
        .route("/automations/:id/disable", post(handlers::disable_automation))
        .route("/automations/:id/activity", get(handlers::automation_activity))
        // Ledger routes
        .route("/automations/:id/executions", get(handlers::list_executions))
        .route("/automations/:id/stats", get(handlers::automation_stats))
        // Event ingestion
        .route("/events", post(handlers::ingest_event))
        .route("/health", get(handlers::health_check));

    Router::new()
        .nest("/api/v1", api_v1)
        .route("/health", get(handlers::health_check))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Configure CORS layer
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(
            std::env::var("CORS_ALLOWED_ORIGINS")
                .ok()
                .and_then(|origin| origin.parse::<HeaderValue>().ok())
                .unwrap_or(HeaderValue::from_static("*")),
        )
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::ACCEPT,
            header::CONTENT_TYPE,
            HeaderName::from_static(ACTOR_HEADER),
        ])
        .max_age(Duration::from_secs(3600))
}
