//! REST API for Flowrule
//!
//! Exposes the workflow graph, automation management, the execution ledger,
//! and event ingestion over HTTP.

pub mod error;
pub mod rest;

pub use error::{ApiError, ApiResult};
pub use rest::create_router;

use flowrule_automation::AutomationEngine;
use flowrule_core::EntityEvent;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AutomationEngine>,
    /// When set, ingested events are queued here instead of dispatched inline.
    pub events: Option<mpsc::Sender<EntityEvent>>,
}

impl AppState {
    pub fn new(engine: Arc<AutomationEngine>) -> Self {
        Self {
            engine,
            events: None,
        }
    }

    pub fn with_event_queue(mut self, events: mpsc::Sender<EntityEvent>) -> Self {
        self.events = Some(events);
        self
    }
}
