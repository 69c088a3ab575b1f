//! Consumer-group subscription worker.
//!
//! Each subscription is a consumer group over one topic with a durable
//! cursor. The worker first catches up from the event log (everything after
//! the stored cursor), then switches to the live broadcast stream. A lagged
//! receiver or a sequence gap sends it back to catch-up, so at-least-once
//! delivery holds without the live channel being reliable.
//!
//! A handler classifies every failure: `Retry` errors are retried with
//! backoff up to the attempt budget, then treated as terminal. Terminal
//! errors dead-letter the envelope and advance the cursor, so one poison
//! event cannot wedge the group.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use tasksync_core::{
    defaults, DeadLetterRepository, Error, EventStore, NewDeadLetter, OffsetStore, Result,
    StoredEvent,
};

use crate::broker::Broker;

/// How a handler classified one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Processed; advance the cursor.
    Success,
    /// Transient failure; deliver again after backoff.
    Retry(String),
    /// Permanent failure for this envelope; dead-letter and move on.
    Terminal(String),
}

/// A consumer-group event handler.
///
/// Handlers must be idempotent: the bus redelivers on restart and on retry,
/// and deduplicates nothing on their behalf.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one stored event. `attempt` starts at 1.
    async fn handle(&self, event: &StoredEvent, attempt: i32) -> HandlerOutcome;
}

/// Configuration for a subscription worker.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Delivery attempts per envelope before a Retry becomes terminal.
    pub max_attempts: i32,
    /// Events per catch-up read.
    pub catch_up_batch: i64,
    /// Base delay between retry attempts (doubles per attempt).
    pub retry_base: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::CONSUMER_MAX_ATTEMPTS,
            catch_up_batch: defaults::CATCH_UP_BATCH,
            retry_base: Duration::from_millis(defaults::BACKOFF_BASE_MS),
        }
    }
}

impl SubscriberConfig {
    /// Fast retries for tests.
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    pub fn with_max_attempts(mut self, max: i32) -> Self {
        self.max_attempts = max;
        self
    }
}

/// Handle for controlling a running subscription.
pub struct SubscriptionHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SubscriptionHandle {
    /// Signal the subscription worker to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }
}

/// One consumer group's delivery worker.
pub struct Subscription {
    topic: String,
    group: String,
    handler: Arc<dyn EventHandler>,
    store: Arc<dyn EventStore>,
    offsets: Arc<dyn OffsetStore>,
    dead_letters: Arc<dyn DeadLetterRepository>,
    broker: Broker,
    config: SubscriberConfig,
}

impl Subscription {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topic: impl Into<String>,
        group: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        store: Arc<dyn EventStore>,
        offsets: Arc<dyn OffsetStore>,
        dead_letters: Arc<dyn DeadLetterRepository>,
        broker: Broker,
        config: SubscriberConfig,
    ) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            handler,
            store,
            offsets,
            dead_letters,
            broker,
            config,
        }
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> SubscriptionHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        SubscriptionHandle { shutdown_tx }
    }

    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        info!(
            subsystem = "bus",
            component = "subscription",
            topic = %self.topic,
            consumer_group = %self.group,
            "Subscription worker started"
        );

        // Subscribe live before catching up so nothing published during
        // catch-up is missed. Events seen on both paths dedupe by cursor.
        let mut live = self.broker.subscribe(&self.topic);

        let mut cursor = match self.offsets.get(&self.topic, &self.group).await {
            Ok(seq) => seq,
            Err(e) => {
                error!(
                    subsystem = "bus",
                    component = "subscription",
                    topic = %self.topic,
                    consumer_group = %self.group,
                    error = %e,
                    "Failed to load cursor, starting from 0"
                );
                0
            }
        };

        loop {
            match self.catch_up(cursor, shutdown_rx).await {
                Ok(Some(new_cursor)) => cursor = new_cursor,
                Ok(None) => break, // shutdown during catch-up
                Err(e) => {
                    error!(
                        subsystem = "bus",
                        component = "subscription",
                        topic = %self.topic,
                        consumer_group = %self.group,
                        error = %e,
                        "Catch-up read failed, retrying"
                    );
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = sleep(self.config.retry_base) => continue,
                    }
                }
            }

            // Live phase. Any anomaly falls back to catch-up.
            loop {
                let event = tokio::select! {
                    _ = shutdown_rx.recv() => return self.stopped(cursor),
                    received = live.recv() => received,
                };

                match event {
                    Ok(event) if event.seq <= cursor => continue, // seen in catch-up
                    Ok(event) if event.seq == cursor + 1 => {
                        if self.deliver(&event, shutdown_rx).await.is_none() {
                            return self.stopped(cursor);
                        }
                        cursor = event.seq;
                    }
                    Ok(event) => {
                        debug!(
                            subsystem = "bus",
                            component = "subscription",
                            topic = %self.topic,
                            consumer_group = %self.group,
                            seq = event.seq,
                            cursor = cursor,
                            "Sequence gap on live stream, re-reading log"
                        );
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(
                            subsystem = "bus",
                            component = "subscription",
                            topic = %self.topic,
                            consumer_group = %self.group,
                            missed = missed,
                            "Live stream lagged, re-reading log"
                        );
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!(
                            subsystem = "bus",
                            component = "subscription",
                            topic = %self.topic,
                            consumer_group = %self.group,
                            "Live stream closed, re-subscribing"
                        );
                        live = self.broker.subscribe(&self.topic);
                        break;
                    }
                }
            }
        }

        self.stopped(cursor);
    }

    fn stopped(&self, cursor: i64) {
        info!(
            subsystem = "bus",
            component = "subscription",
            topic = %self.topic,
            consumer_group = %self.group,
            seq = cursor,
            "Subscription worker stopped"
        );
    }

    /// Drain the log from `cursor` until it is exhausted.
    ///
    /// Returns the new cursor, or `None` if shutdown was requested mid-drain.
    async fn catch_up(
        &self,
        mut cursor: i64,
        shutdown_rx: &mut mpsc::Receiver<()>,
    ) -> Result<Option<i64>> {
        loop {
            let batch = self
                .store
                .load_after(&self.topic, cursor, self.config.catch_up_batch)
                .await?;
            if batch.is_empty() {
                return Ok(Some(cursor));
            }
            for event in &batch {
                if self.deliver(event, shutdown_rx).await.is_none() {
                    return Ok(None);
                }
                cursor = event.seq;
            }
        }
    }

    /// Deliver one event through the retry/terminal state machine and commit
    /// the cursor. Returns `None` if shutdown interrupted a retry wait.
    async fn deliver(&self, event: &StoredEvent, shutdown_rx: &mut mpsc::Receiver<()>) -> Option<()> {
        // Malformed envelopes (e.g. missing user attribution) are quarantined
        // up front; handlers only ever see valid ones.
        if let Err(e) = event.envelope.validate() {
            self.dead_letter(event, 0, &e.to_string()).await;
            self.commit(event.seq).await;
            return Some(());
        }

        let mut attempt = 1;
        loop {
            let outcome = self.handler.handle(event, attempt).await;
            match outcome {
                HandlerOutcome::Success => {
                    debug!(
                        subsystem = "bus",
                        component = "subscription",
                        topic = %self.topic,
                        consumer_group = %self.group,
                        event_id = %event.envelope.event_id,
                        seq = event.seq,
                        attempt = attempt,
                        "Event handled"
                    );
                    self.commit(event.seq).await;
                    return Some(());
                }
                HandlerOutcome::Retry(reason) if attempt < self.config.max_attempts => {
                    let delay = self.config.retry_base * 2u32.saturating_pow(attempt as u32 - 1);
                    warn!(
                        subsystem = "bus",
                        component = "subscription",
                        topic = %self.topic,
                        consumer_group = %self.group,
                        event_id = %event.envelope.event_id,
                        attempt = attempt,
                        error_msg = %reason,
                        "Handler failed, retrying"
                    );
                    tokio::select! {
                        _ = shutdown_rx.recv() => return None,
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
                HandlerOutcome::Retry(reason) => {
                    // Attempt budget exhausted.
                    self.dead_letter(event, attempt, &reason).await;
                    self.commit(event.seq).await;
                    return Some(());
                }
                HandlerOutcome::Terminal(reason) => {
                    self.dead_letter(event, attempt, &reason).await;
                    self.commit(event.seq).await;
                    return Some(());
                }
            }
        }
    }

    async fn dead_letter(&self, event: &StoredEvent, attempts: i32, reason: &str) {
        error!(
            subsystem = "bus",
            component = "subscription",
            topic = %self.topic,
            consumer_group = %self.group,
            event_id = %event.envelope.event_id,
            seq = event.seq,
            attempt = attempts,
            error_msg = reason,
            "Dead-lettering event"
        );
        let result = self
            .dead_letters
            .record(NewDeadLetter {
                topic: &self.topic,
                consumer_group: &self.group,
                envelope: &event.envelope,
                error_message: reason,
                attempt_count: attempts,
                first_failed_at: Utc::now(),
            })
            .await;
        if let Err(e) = result {
            error!(
                subsystem = "bus",
                component = "subscription",
                topic = %self.topic,
                consumer_group = %self.group,
                event_id = %event.envelope.event_id,
                error = %e,
                "Failed to record dead letter"
            );
        }
    }

    async fn commit(&self, seq: i64) {
        if let Err(e) = self.offsets.commit(&self.topic, &self.group, seq).await {
            // The event was processed; a lost commit means redelivery after
            // restart, which handlers tolerate.
            warn!(
                subsystem = "bus",
                component = "subscription",
                topic = %self.topic,
                consumer_group = %self.group,
                seq = seq,
                error = %e,
                "Failed to commit cursor"
            );
        }
    }
}
