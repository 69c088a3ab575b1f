//! In-process per-topic broadcast fan-out.
//!
//! The broker is the live half of the bus: once an envelope is durably in the
//! event log, the broker pushes the stored form to every in-process
//! subscription. Delivery here is best-effort; a subscriber that lags or
//! misses a send recovers by re-reading the log from its cursor.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::debug;

use tasksync_core::{defaults, StoredEvent};

/// Registry of per-topic broadcast channels, created on first use.
#[derive(Clone)]
pub struct Broker {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<StoredEvent>>>>,
    capacity: usize,
}

impl Broker {
    /// Create a broker with the given per-topic buffer capacity.
    ///
    /// Recommended: 256 for production, 32 for tests.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<StoredEvent> {
        if let Some(tx) = self
            .channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
        {
            return tx.clone();
        }
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Push a stored event to all live subscribers of its topic.
    ///
    /// If there are no active subscribers the event is silently dropped; it
    /// remains in the log and catch-up will find it.
    pub fn publish(&self, event: &StoredEvent) {
        let tx = self.sender(&event.topic);
        let subscriber_count = tx.receiver_count();
        debug!(
            subsystem = "bus",
            component = "broker",
            topic = %event.topic,
            seq = event.seq,
            event_id = %event.envelope.event_id,
            subscriber_count,
            "Broker publish"
        );
        let _ = tx.send(event.clone());
    }

    /// Subscribe to live events on a topic. Each subscriber gets its own
    /// independent stream.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<StoredEvent> {
        self.sender(topic).subscribe()
    }

    /// Number of active live subscribers on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(defaults::BROKER_CHANNEL_CAPACITY)
    }
}
