//! Publish path: durable append with a bounded local retry queue.
//!
//! A publish first tries a synchronous append to the event log within a small
//! time budget so API handlers never block on a slow database. On timeout or
//! error the envelope is parked in a bounded in-memory queue and a background
//! flusher retries with exponential backoff. The queue drops low-priority
//! sync notifications first when full; lifecycle events are kept.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tasksync_core::{defaults, Envelope, Error, EventStore, EventType, Result};

use crate::broker::Broker;

/// Outcome of a publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishAck {
    /// Durably appended at this sequence number and fanned out live.
    Stored(i64),
    /// The event_id was already in the log; nothing happened.
    Duplicate,
    /// The append did not complete within the publish budget; the envelope is
    /// queued and will be flushed in the background.
    Queued,
}

struct QueuedPublish {
    topic: String,
    envelope: Envelope,
}

struct PublisherInner {
    store: Arc<dyn EventStore>,
    broker: Broker,
    queue: Mutex<VecDeque<QueuedPublish>>,
    queue_capacity: usize,
    flush_wake: Notify,
}

/// Shared handle to the publish path. Cheap to clone.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

/// Handle for controlling the background flusher.
pub struct PublisherHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl PublisherHandle {
    /// Signal the flusher to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }
}

impl Publisher {
    pub fn new(store: Arc<dyn EventStore>, broker: Broker) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                store,
                broker,
                queue: Mutex::new(VecDeque::new()),
                queue_capacity: defaults::PUBLISH_QUEUE_CAPACITY,
                flush_wake: Notify::new(),
            }),
        }
    }

    /// Publish an envelope to a topic.
    ///
    /// Never returns an error for store trouble; the envelope is queued
    /// instead. Only an invalid envelope is rejected outright.
    pub async fn publish(&self, topic: &str, envelope: Envelope) -> Result<PublishAck> {
        envelope.validate()?;

        let budget = Duration::from_millis(defaults::PUBLISH_TIMEOUT_MS);
        match timeout(budget, self.inner.store.append(topic, &envelope)).await {
            Ok(Ok(Some(stored))) => {
                self.inner.broker.publish(&stored);
                Ok(PublishAck::Stored(stored.seq))
            }
            Ok(Ok(None)) => {
                debug!(
                    subsystem = "bus",
                    component = "publisher",
                    event_id = %envelope.event_id,
                    topic = topic,
                    "Duplicate publish ignored"
                );
                Ok(PublishAck::Duplicate)
            }
            Ok(Err(e)) => {
                warn!(
                    subsystem = "bus",
                    component = "publisher",
                    event_id = %envelope.event_id,
                    topic = topic,
                    error = %e,
                    "Append failed, queueing for background flush"
                );
                self.enqueue(topic, envelope).await;
                Ok(PublishAck::Queued)
            }
            Err(_) => {
                warn!(
                    subsystem = "bus",
                    component = "publisher",
                    event_id = %envelope.event_id,
                    topic = topic,
                    budget_ms = defaults::PUBLISH_TIMEOUT_MS,
                    "Append exceeded publish budget, queueing for background flush"
                );
                self.enqueue(topic, envelope).await;
                Ok(PublishAck::Queued)
            }
        }
    }

    /// Announce a task mutation on the `task-events` topic.
    ///
    /// The save-then-notify convenience for write paths: the caller's own
    /// database write is already committed, so this never propagates store
    /// trouble back (the envelope is queued instead).
    pub async fn notify_task_event(
        &self,
        event_type: EventType,
        subject_id: Uuid,
        user_id: Uuid,
        payload: JsonValue,
    ) -> Result<PublishAck> {
        self.publish(
            tasksync_core::TOPIC_TASK_EVENTS,
            Envelope::new(event_type, subject_id, user_id, payload),
        )
        .await
    }

    /// Number of envelopes waiting for the background flusher.
    pub async fn queued_len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    async fn enqueue(&self, topic: &str, envelope: Envelope) {
        let mut queue = self.inner.queue.lock().await;
        if queue.len() >= self.inner.queue_capacity {
            // Full queue sheds load: prefer dropping a sync notification
            // (recoverable by the client's next poll) over a lifecycle event.
            let victim = queue
                .iter()
                .position(|q| q.envelope.event_type == EventType::SyncTaskChanged)
                .unwrap_or(0);
            if let Some(dropped) = queue.remove(victim) {
                error!(
                    subsystem = "bus",
                    component = "publisher",
                    event_id = %dropped.envelope.event_id,
                    event_type = %dropped.envelope.event_type,
                    topic = %dropped.topic,
                    "Publish queue full, dropping queued envelope"
                );
            }
        }
        queue.push_back(QueuedPublish {
            topic: topic.to_string(),
            envelope,
        });
        drop(queue);
        self.inner.flush_wake.notify_one();
    }

    /// Start the background flusher and return a handle for control.
    pub fn start(&self) -> PublisherHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let publisher = self.clone();

        tokio::spawn(async move {
            publisher.run_flusher(&mut shutdown_rx).await;
        });

        PublisherHandle { shutdown_tx }
    }

    async fn run_flusher(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        info!(
            subsystem = "bus",
            component = "publisher",
            queue_capacity = self.inner.queue_capacity,
            "Publish flusher started"
        );

        let mut backoff = Duration::from_millis(defaults::BACKOFF_BASE_MS);
        let backoff_cap = Duration::from_secs(defaults::BACKOFF_CAP_SECS);

        loop {
            let next = { self.inner.queue.lock().await.pop_front() };

            let Some(item) = next else {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = self.inner.flush_wake.notified() => continue,
                }
            };

            match self.inner.store.append(&item.topic, &item.envelope).await {
                Ok(Some(stored)) => {
                    self.inner.broker.publish(&stored);
                    debug!(
                        subsystem = "bus",
                        component = "publisher",
                        event_id = %item.envelope.event_id,
                        topic = %item.topic,
                        seq = stored.seq,
                        "Flushed queued envelope"
                    );
                    backoff = Duration::from_millis(defaults::BACKOFF_BASE_MS);
                }
                Ok(None) => {
                    // The original append landed even though it blew the
                    // publish budget. Nobody broadcast it, so recover the
                    // stored row and fan it out now; live subscribers on a
                    // quiet topic would otherwise never see it.
                    match self.inner.store.get_by_event_id(item.envelope.event_id).await {
                        Ok(Some(stored)) => {
                            self.inner.broker.publish(&stored);
                            debug!(
                                subsystem = "bus",
                                component = "publisher",
                                event_id = %item.envelope.event_id,
                                topic = %item.topic,
                                seq = stored.seq,
                                "Broadcast recovered for already-stored envelope"
                            );
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(
                                subsystem = "bus",
                                component = "publisher",
                                event_id = %item.envelope.event_id,
                                topic = %item.topic,
                                error = %e,
                                "Failed to recover stored envelope for broadcast"
                            );
                        }
                    }
                    backoff = Duration::from_millis(defaults::BACKOFF_BASE_MS);
                }
                Err(e) => {
                    warn!(
                        subsystem = "bus",
                        component = "publisher",
                        event_id = %item.envelope.event_id,
                        topic = %item.topic,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Flush attempt failed, backing off"
                    );
                    // Back onto the front so ordering within the queue holds.
                    self.inner.queue.lock().await.push_front(item);
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(backoff_cap);
                }
            }
        }

        let remaining = self.inner.queue.lock().await.len();
        info!(
            subsystem = "bus",
            component = "publisher",
            queued = remaining,
            "Publish flusher stopped"
        );
    }
}
