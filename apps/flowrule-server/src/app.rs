//! Application wiring and lifecycle

use anyhow::{Context, Result};
use async_trait::async_trait;
use flowrule_api::AppState;
use flowrule_automation::{AutomationEngine, Collaborators};
use flowrule_core::memory::{InMemoryCommentService, InMemoryEntityStore, StaticIdentityService};
use flowrule_core::{AppConfig, AppError, EntityEvent, EventPublisher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::server::{shutdown_signal, Server};

/// Publishes events onto the in-process bus that feeds the processor.
pub struct ChannelPublisher {
    sender: mpsc::Sender<EntityEvent>,
}

impl ChannelPublisher {
    pub fn new(sender: mpsc::Sender<EntityEvent>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl EventPublisher for ChannelPublisher {
    async fn publish(&self, event: EntityEvent) -> flowrule_core::Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| AppError::TransientIo("event bus is closed".to_string()))
    }
}

pub struct App {
    config: AppConfig,
    engine: Arc<AutomationEngine>,
    events: mpsc::Sender<EntityEvent>,
    bus: mpsc::Receiver<EntityEvent>,
    purge_interval: Duration,
}

impl App {
    /// Wire the engine over in-process collaborators.
    pub fn build(config: AppConfig, purge_interval: Duration) -> Self {
        let (events, bus) = mpsc::channel(config.engine.event_buffer_size.max(1));

        let collaborators = Collaborators {
            entities: Arc::new(InMemoryEntityStore::new()),
            comments: Arc::new(InMemoryCommentService::new()),
            identity: Arc::new(StaticIdentityService::new()),
            publisher: Arc::new(ChannelPublisher::new(events.clone())),
        };
        let engine = Arc::new(AutomationEngine::new(config.engine.clone(), collaborators));

        Self {
            config,
            engine,
            events,
            bus,
            purge_interval,
        }
    }

    pub fn engine(&self) -> &Arc<AutomationEngine> {
        &self.engine
    }

    /// Run until Ctrl+C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            signal.cancel();
        });
        self.run_until(shutdown).await
    }

    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            config,
            engine,
            events,
            bus,
            purge_interval,
        } = self;

        let resumed = engine
            .resume_pending()
            .await
            .context("Failed to resume pending executions")?;
        if !resumed.is_empty() {
            info!(count = resumed.len(), "Resumed pending executions");
        }

        let processor = engine.start_processor();
        let processing = tokio::spawn(processor.run(bus, shutdown.clone().cancelled_owned()));
        let purging = tokio::spawn(purge_loop(
            Arc::clone(&engine),
            purge_interval,
            shutdown.clone(),
        ));

        let state = AppState::new(Arc::clone(&engine)).with_event_queue(events);
        let served = match Server::bind(&config.server.address(), state).await {
            Ok(server) => server.run(shutdown.clone()).await,
            Err(e) => Err(e),
        };

        // Stop background work even when the server failed to start.
        shutdown.cancel();
        if let Err(e) = processing.await {
            error!(error = %e, "Event processor task failed");
        }
        if let Err(e) = purging.await {
            error!(error = %e, "Purge task failed");
        }

        served
    }
}

/// Delete expired ledger records every `interval` until cancelled.
async fn purge_loop(
    engine: Arc<AutomationEngine>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let interval = interval.max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => match engine.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "Purged expired execution records"),
                Err(e) => warn!(error = %e, "Execution ledger purge failed"),
            },
        }
    }
}
