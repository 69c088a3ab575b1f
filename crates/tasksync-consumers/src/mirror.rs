//! Task-update mirror.
//!
//! Consumer group `mirror` on `task-events`. Republishes every task lifecycle
//! event onto `task-updates` as a `sync.task_changed` envelope, so the
//! fan-out hub consumes exactly one topic. The mirrored envelope carries the
//! originating wire name in `change` and the original payload in `detail`.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use tasksync_bus::{EventHandler, HandlerOutcome, Publisher};
use tasksync_core::{Envelope, EventType, StoredEvent, TOPIC_TASK_UPDATES};

/// Consumer group name.
pub const MIRROR_GROUP: &str = "mirror";

pub struct SyncMirror {
    publisher: Publisher,
}

impl SyncMirror {
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl EventHandler for SyncMirror {
    async fn handle(&self, event: &StoredEvent, _attempt: i32) -> HandlerOutcome {
        if !event.envelope.event_type.is_task_lifecycle() {
            return HandlerOutcome::Success;
        }

        let sync = Envelope::new(
            EventType::SyncTaskChanged,
            event.envelope.subject_id,
            event.envelope.user_id,
            json!({
                "change": event.envelope.event_type.as_str(),
                "detail": event.envelope.payload,
            }),
        )
        .with_correlation(
            event
                .envelope
                .correlation_id
                .or(Some(event.envelope.event_id)),
        );

        debug!(
            subsystem = "consumers",
            consumer_group = MIRROR_GROUP,
            event_id = %event.envelope.event_id,
            event_type = %event.envelope.event_type,
            subject_id = %event.envelope.subject_id,
            "Mirroring onto task-updates"
        );

        match self.publisher.publish(TOPIC_TASK_UPDATES, sync).await {
            Ok(_) => HandlerOutcome::Success,
            Err(e) => HandlerOutcome::Retry(format!("mirror publish failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tasksync_bus::Broker;
    use tasksync_core::test_support::MemoryEventStore;
    use tasksync_core::{EventStore, SyncPayload, TOPIC_TASK_EVENTS};
    use uuid::Uuid;

    fn mirror() -> (SyncMirror, Arc<MemoryEventStore>) {
        let store = Arc::new(MemoryEventStore::new());
        let publisher = Publisher::new(store.clone(), Broker::new(32));
        (SyncMirror::new(publisher), store)
    }

    fn stored(event_type: EventType) -> StoredEvent {
        StoredEvent {
            seq: 1,
            topic: TOPIC_TASK_EVENTS.to_string(),
            envelope: Envelope::new(
                event_type,
                Uuid::new_v4(),
                Uuid::new_v4(),
                json!({"title": "t"}),
            ),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_event_is_mirrored() {
        let (mirror, store) = mirror();
        let event = stored(EventType::TaskCompleted);

        assert_eq!(mirror.handle(&event, 1).await, HandlerOutcome::Success);

        let published = store.load_after(TOPIC_TASK_UPDATES, 0, 10).await.unwrap();
        assert_eq!(published.len(), 1);
        let env = &published[0].envelope;
        assert_eq!(env.event_type, EventType::SyncTaskChanged);
        assert_eq!(env.user_id, event.envelope.user_id);
        assert_eq!(env.subject_id, event.envelope.subject_id);
        assert_eq!(env.correlation_id, Some(event.envelope.event_id));

        let payload: SyncPayload = serde_json::from_value(env.payload.clone()).unwrap();
        assert_eq!(payload.change, "task.completed");
        assert_eq!(payload.detail, json!({"title": "t"}));
    }

    #[tokio::test]
    async fn test_non_lifecycle_events_are_ignored() {
        let (mirror, store) = mirror();
        let event = stored(EventType::SyncTaskChanged);

        assert_eq!(mirror.handle(&event, 1).await, HandlerOutcome::Success);
        assert!(store.is_empty().await);
    }
}
