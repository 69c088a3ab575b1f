//! Recurring-occurrence generator.
//!
//! Consumer group `recurrence` on `task-events`. When a task with a
//! recurrence pattern completes, this creates the next occurrence and
//! announces it with a fresh `task.created` event. Idempotency lives in the
//! store: `(origin_task_id, occurrence_index)` is insert-if-absent, so a
//! redelivered completion generates nothing the second time.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use tasksync_bus::{EventHandler, HandlerOutcome, Publisher};
use tasksync_core::{
    Envelope, EventType, OccurrenceRepository, Recurrence, StoredEvent, TOPIC_TASK_EVENTS,
};

/// Consumer group name.
pub const RECURRENCE_GROUP: &str = "recurrence";

pub struct RecurrenceGenerator {
    occurrences: Arc<dyn OccurrenceRepository>,
    publisher: Publisher,
}

impl RecurrenceGenerator {
    pub fn new(occurrences: Arc<dyn OccurrenceRepository>, publisher: Publisher) -> Self {
        Self {
            occurrences,
            publisher,
        }
    }
}

#[async_trait]
impl EventHandler for RecurrenceGenerator {
    async fn handle(&self, event: &StoredEvent, _attempt: i32) -> HandlerOutcome {
        if event.envelope.event_type != EventType::TaskCompleted {
            return HandlerOutcome::Success;
        }

        let payload = match event.envelope.task_payload() {
            Ok(p) => p,
            Err(e) => {
                return HandlerOutcome::Terminal(format!("undecodable task payload: {e}"));
            }
        };

        let Some(pattern) = payload.recurrence.as_deref() else {
            return HandlerOutcome::Success; // one-off task
        };

        let recurrence: Recurrence = match pattern.parse() {
            Ok(r) => r,
            Err(e) => {
                // A corrupted pattern never becomes parseable; park it.
                return HandlerOutcome::Terminal(format!("invalid recurrence pattern: {e}"));
            }
        };

        // The next occurrence advances from the task's own due date; a task
        // without one advances from when it was completed.
        let base = payload
            .due_date
            .or(payload.completed_at)
            .unwrap_or(event.envelope.occurred_at);
        let next_due = recurrence.advance(base);
        let origin = payload.origin_task_id.unwrap_or(event.envelope.subject_id);
        let next_index = payload.occurrence_index + 1;

        let created = match self
            .occurrences
            .create_if_absent(origin, next_index, next_due)
            .await
        {
            Ok(created) => created,
            Err(e) => return HandlerOutcome::Retry(format!("occurrence insert failed: {e}")),
        };

        let Some(task_id) = created else {
            debug!(
                subsystem = "consumers",
                consumer_group = RECURRENCE_GROUP,
                event_id = %event.envelope.event_id,
                origin_task_id = %origin,
                occurrence_index = next_index,
                "Occurrence already generated, skipping"
            );
            return HandlerOutcome::Success;
        };

        let next = Envelope::new(
            EventType::TaskCreated,
            task_id,
            event.envelope.user_id,
            json!({
                "title": payload.title,
                "due_date": next_due,
                "recurrence": pattern,
                "occurrence_index": next_index,
                "origin_task_id": origin,
            }),
        )
        .with_correlation(
            event
                .envelope
                .correlation_id
                .or(Some(event.envelope.event_id)),
        );

        info!(
            subsystem = "consumers",
            consumer_group = RECURRENCE_GROUP,
            event_id = %event.envelope.event_id,
            subject_id = %task_id,
            origin_task_id = %origin,
            occurrence_index = next_index,
            "Generated next occurrence"
        );

        match self.publisher.publish(TOPIC_TASK_EVENTS, next).await {
            Ok(_) => HandlerOutcome::Success,
            Err(e) => HandlerOutcome::Retry(format!("occurrence publish failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tasksync_bus::Broker;
    use tasksync_core::test_support::{MemoryEventStore, MemoryOccurrenceRepository};
    use tasksync_core::EventStore;
    use uuid::Uuid;

    fn generator() -> (
        RecurrenceGenerator,
        Arc<MemoryOccurrenceRepository>,
        Arc<MemoryEventStore>,
    ) {
        let occurrences = Arc::new(MemoryOccurrenceRepository::new());
        let store = Arc::new(MemoryEventStore::new());
        let publisher = Publisher::new(store.clone(), Broker::new(32));
        (
            RecurrenceGenerator::new(occurrences.clone(), publisher),
            occurrences,
            store,
        )
    }

    fn completion(recurrence: Option<&str>) -> StoredEvent {
        let due = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap();
        let mut payload = json!({
            "title": "Water plants",
            "due_date": due,
            "completed_at": Utc.with_ymd_and_hms(2026, 3, 10, 14, 30, 0).unwrap(),
            "occurrence_index": 1,
        });
        if let Some(r) = recurrence {
            payload["recurrence"] = json!(r);
        }
        StoredEvent {
            seq: 1,
            topic: TOPIC_TASK_EVENTS.to_string(),
            envelope: Envelope::new(
                EventType::TaskCompleted,
                Uuid::new_v4(),
                Uuid::new_v4(),
                payload,
            ),
        }
    }

    #[tokio::test]
    async fn test_completion_with_daily_recurrence_creates_next_day_occurrence() {
        let (gen, occurrences, store) = generator();
        let event = completion(Some("daily"));
        let origin = event.envelope.subject_id;

        assert_eq!(gen.handle(&event, 1).await, HandlerOutcome::Success);

        let occ = occurrences.get(origin, 2).await.unwrap().unwrap();
        assert_eq!(
            occ.due_date,
            Utc.with_ymd_and_hms(2026, 3, 11, 9, 0, 0).unwrap()
        );

        let published = store.load_after(TOPIC_TASK_EVENTS, 0, 10).await.unwrap();
        assert_eq!(published.len(), 1);
        let env = &published[0].envelope;
        assert_eq!(env.event_type, EventType::TaskCreated);
        assert_eq!(env.subject_id, occ.task_id);
        assert_eq!(env.user_id, event.envelope.user_id);
        let new_payload = env.task_payload().unwrap();
        assert_eq!(new_payload.occurrence_index, 2);
        assert_eq!(new_payload.origin_task_id, Some(origin));
        assert_eq!(new_payload.recurrence.as_deref(), Some("daily"));
    }

    #[tokio::test]
    async fn test_redelivered_completion_is_noop() {
        let (gen, occurrences, store) = generator();
        let event = completion(Some("weekly"));

        assert_eq!(gen.handle(&event, 1).await, HandlerOutcome::Success);
        assert_eq!(gen.handle(&event, 1).await, HandlerOutcome::Success);

        assert_eq!(occurrences.occurrence_count().await, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_non_recurring_completion_is_ignored() {
        let (gen, occurrences, store) = generator();
        let event = completion(None);

        assert_eq!(gen.handle(&event, 1).await, HandlerOutcome::Success);
        assert_eq!(occurrences.occurrence_count().await, 0);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_terminal() {
        let (gen, occurrences, _store) = generator();
        let event = completion(Some("fortnightly"));

        assert!(matches!(
            gen.handle(&event, 1).await,
            HandlerOutcome::Terminal(_)
        ));
        assert_eq!(occurrences.occurrence_count().await, 0);
    }

    #[tokio::test]
    async fn test_non_completion_events_pass_through() {
        let (gen, occurrences, _store) = generator();
        let mut event = completion(Some("daily"));
        event.envelope.event_type = EventType::TaskUpdated;

        assert_eq!(gen.handle(&event, 1).await, HandlerOutcome::Success);
        assert_eq!(occurrences.occurrence_count().await, 0);
    }
}
