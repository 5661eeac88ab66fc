//! Ordered hand-off of committed events to the event bus.
//!
//! Writers queue their event while they still hold the entity lock, so queue
//! order is commit order. Publishing happens afterwards, outside any entity
//! lock, with one flusher at a time. A slow or full bus therefore never holds
//! up another writer or the lanes that consume the bus.

use flowrule_core::{AppError, EntityEvent, EventPublisher};
use flowrule_infra::{retry_with, with_timeout, RetryPolicy};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error};

pub struct EventOutbox {
    publisher: Arc<dyn EventPublisher>,
    pending: Mutex<VecDeque<EntityEvent>>,
    flushing: Mutex<()>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl EventOutbox {
    pub fn new(publisher: Arc<dyn EventPublisher>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            publisher,
            pending: Mutex::new(VecDeque::new()),
            flushing: Mutex::new(()),
            retry,
            timeout,
        }
    }

    /// Queue an event behind everything queued before it.
    pub async fn enqueue(&self, event: EntityEvent) {
        self.pending.lock().await.push_back(event);
    }

    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Publish everything queued so far, oldest first. Returns how many events
    /// reached the bus.
    ///
    /// An event that still fails after the retry policy is exhausted is logged
    /// and dropped; the write it describes is already committed.
    pub async fn flush(&self) -> usize {
        let _flushing = self.flushing.lock().await;
        let mut delivered = 0;
        loop {
            let next = self.pending.lock().await.pop_front();
            let Some(event) = next else {
                break;
            };
            if self.publish(event).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Flush on a background task, for callers that must not wait on the bus.
    pub fn spawn_flush(self: &Arc<Self>) {
        let outbox = Arc::clone(self);
        tokio::spawn(async move {
            outbox.flush().await;
        });
    }

    async fn publish(&self, event: EntityEvent) -> bool {
        let publisher = &self.publisher;
        let timeout = self.timeout;
        let result = retry_with(
            &self.retry,
            |_attempt| {
                let event = event.clone();
                async move {
                    match with_timeout(timeout, "publish", || publisher.publish(event)).await {
                        Ok(result) => result,
                        Err(e) => Err(AppError::Timeout(e.to_string())),
                    }
                }
            },
            AppError::is_retryable,
        )
        .await;

        match result {
            Ok(()) => {
                debug!(
                    event_id = %event.event_id,
                    entity_id = %event.entity_id,
                    sequence = event.sequence,
                    "Event published"
                );
                true
            }
            Err(e) => {
                error!(
                    event_id = %event.event_id,
                    entity_id = %event.entity_id,
                    kind = %event.kind,
                    sequence = event.sequence,
                    error = %e,
                    "Dropping event after failed publish"
                );
                false
            }
        }
    }
}
