//! # tasksync-bus
//!
//! Durable at-least-once event bus.
//!
//! Publishing appends to the event log, then fans out to in-process
//! subscribers over broadcast channels. Consumer groups track a durable
//! cursor per topic and catch up from the log on startup, on lag, and on any
//! live-stream gap. Handlers classify failures as retryable or terminal;
//! terminal failures dead-letter the envelope and the group moves on.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tasksync_bus::{Bus, SubscriberConfig};
//! use tasksync_core::TOPIC_TASK_EVENTS;
//!
//! let bus = Bus::new(events, offsets, dead_letters);
//! let publisher = bus.publisher();
//! let handle = bus.subscribe(TOPIC_TASK_EVENTS, "audit", handler, SubscriberConfig::default());
//! ```

pub mod broker;
pub mod publisher;
pub mod subscriber;

pub use broker::Broker;
pub use publisher::{PublishAck, Publisher, PublisherHandle};
pub use subscriber::{
    EventHandler, HandlerOutcome, SubscriberConfig, Subscription, SubscriptionHandle,
};

use std::sync::Arc;

use tasksync_core::{DeadLetterRepository, EventStore, OffsetStore};

/// The assembled bus: durable stores plus the live broker.
///
/// One `Bus` per process; publishers and subscriptions are created from it
/// and share the broker so live fan-out stays in-process.
#[derive(Clone)]
pub struct Bus {
    store: Arc<dyn EventStore>,
    offsets: Arc<dyn OffsetStore>,
    dead_letters: Arc<dyn DeadLetterRepository>,
    broker: Broker,
}

impl Bus {
    pub fn new(
        store: Arc<dyn EventStore>,
        offsets: Arc<dyn OffsetStore>,
        dead_letters: Arc<dyn DeadLetterRepository>,
    ) -> Self {
        Self {
            store,
            offsets,
            dead_letters,
            broker: Broker::default(),
        }
    }

    /// Use a broker with custom capacity (tests).
    pub fn with_broker(mut self, broker: Broker) -> Self {
        self.broker = broker;
        self
    }

    /// Create a publisher bound to this bus.
    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.store.clone(), self.broker.clone())
    }

    /// Start a consumer-group subscription on a topic.
    pub fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn EventHandler>,
        config: SubscriberConfig,
    ) -> SubscriptionHandle {
        Subscription::new(
            topic,
            group,
            handler,
            self.store.clone(),
            self.offsets.clone(),
            self.dead_letters.clone(),
            self.broker.clone(),
            config,
        )
        .start()
    }

    /// The shared live broker.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// The underlying event store.
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }
}
