//! Event processing lanes
//!
//! Events are spread over a fixed number of lanes by entity id. Each lane is a
//! single task, so events for one entity are dispatched one at a time while
//! different entities proceed in parallel. A lane remembers the last sequence
//! number it dispatched per entity and drops events that are not newer, so a
//! late or repeated delivery never runs after the write that superseded it.

use crate::dispatcher::TriggerDispatcher;
use crate::{AutomationError, Result};
use flowrule_core::{AppError, EntityEvent, EntityId};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct EventProcessor {
    lanes: Vec<mpsc::Sender<EntityEvent>>,
    workers: Vec<JoinHandle<()>>,
}

impl EventProcessor {
    /// Spawn `lanes` workers, each with a queue of `buffer_size` events.
    pub fn start(dispatcher: Arc<TriggerDispatcher>, lanes: usize, buffer_size: usize) -> Self {
        let lanes = lanes.max(1);
        let mut senders = Vec::with_capacity(lanes);
        let mut workers = Vec::with_capacity(lanes);

        for lane in 0..lanes {
            let (sender, receiver) = mpsc::channel(buffer_size.max(1));
            senders.push(sender);
            workers.push(tokio::spawn(run_lane(
                lane,
                Arc::clone(&dispatcher),
                receiver,
            )));
        }

        info!(lanes, buffer_size, "Started event processor");
        Self {
            lanes: senders,
            workers,
        }
    }

    pub fn lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Queue an event on its entity's lane. Waits while the lane is full.
    pub async fn submit(&self, event: EntityEvent) -> Result<()> {
        let lane = self.lane_for(event.entity_id);
        self.lanes[lane].send(event).await.map_err(|_| {
            AutomationError::Core(AppError::TransientIo(
                "event processor is stopped".to_string(),
            ))
        })
    }

    /// Feed events from the bus until it closes or `shutdown` resolves, then
    /// drain the lanes.
    pub async fn run<F>(self, mut bus: mpsc::Receiver<EntityEvent>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                event = bus.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.submit(event).await {
                            error!(error = %e, "Failed to queue event");
                        }
                    }
                    None => break,
                },
                _ = &mut shutdown => break,
            }
        }
        self.shutdown().await;
    }

    /// Stop accepting events and wait for queued ones to be dispatched.
    pub async fn shutdown(self) {
        let Self { lanes, workers } = self;
        drop(lanes);
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Event lane panicked");
            }
        }
        info!("Event processor stopped");
    }

    fn lane_for(&self, entity_id: EntityId) -> usize {
        let mut hasher = DefaultHasher::new();
        entity_id.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }
}

async fn run_lane(
    lane: usize,
    dispatcher: Arc<TriggerDispatcher>,
    mut receiver: mpsc::Receiver<EntityEvent>,
) {
    let mut last_sequence: HashMap<EntityId, u64> = HashMap::new();

    while let Some(event) = receiver.recv().await {
        if let Some(&last) = last_sequence.get(&event.entity_id) {
            if event.sequence <= last {
                warn!(
                    lane,
                    event_id = %event.event_id,
                    entity_id = %event.entity_id,
                    sequence = event.sequence,
                    last_sequence = last,
                    "Dropping out-of-order event"
                );
                continue;
            }
        }
        last_sequence.insert(event.entity_id, event.sequence);

        match dispatcher.on_event(&event).await {
            Ok(enqueued) => debug!(
                lane,
                event_id = %event.event_id,
                executions = enqueued.len(),
                "Event dispatched"
            ),
            Err(e) => error!(
                lane,
                event_id = %event.event_id,
                entity_id = %event.entity_id,
                error = %e,
                "Event dispatch failed"
            ),
        }
    }
}
