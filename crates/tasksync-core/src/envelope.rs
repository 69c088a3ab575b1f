//! Event envelope schema and the closed event type enumeration.
//!
//! Every message on every topic is an [`Envelope`]: a self-describing wrapper
//! carrying routing metadata (`user_id`, `subject_id`), tracing metadata
//! (`event_id`, `correlation_id`, `occurred_at`) and a type-specific JSON
//! `payload`. Envelopes are immutable after publish; a correction is a new
//! envelope.
//!
//! ## Wire format
//!
//! ```json
//! {
//!   "event_id": "019508a0-1234-7def-8000-abcdef123456",
//!   "type": "task.completed",
//!   "subject_id": "...",
//!   "user_id": "...",
//!   "payload": { "recurrence": "daily", "due_date": "2026-01-10T09:00:00Z" },
//!   "occurred_at": "2026-01-10T09:00:02Z",
//!   "correlation_id": "..."
//! }
//! ```
//!
//! Consumers tolerate unknown additional fields (forward compatibility) and
//! match on [`EventType`] exhaustively rather than comparing strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::uuid_utils::new_v7;

/// Topic carrying task lifecycle events from the mutation publisher.
pub const TOPIC_TASK_EVENTS: &str = "task-events";

/// Topic carrying reminder events sourced from the scheduler.
pub const TOPIC_REMINDERS: &str = "reminders";

/// Topic consumed by the realtime fan-out hub.
pub const TOPIC_TASK_UPDATES: &str = "task-updates";

/// The closed set of event types the core propagates.
///
/// Serialized as the dot-namespaced wire names. Adding a variant is a
/// deliberate schema change; general-purpose routing beyond these classes is
/// a non-goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.updated")]
    TaskUpdated,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.deleted")]
    TaskDeleted,
    #[serde(rename = "reminder.scheduled")]
    ReminderScheduled,
    #[serde(rename = "reminder.due")]
    ReminderDue,
    #[serde(rename = "reminder.cancelled")]
    ReminderCancelled,
    #[serde(rename = "sync.task_changed")]
    SyncTaskChanged,
}

impl EventType {
    /// The dot-namespaced wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskCreated => "task.created",
            EventType::TaskUpdated => "task.updated",
            EventType::TaskCompleted => "task.completed",
            EventType::TaskDeleted => "task.deleted",
            EventType::ReminderScheduled => "reminder.scheduled",
            EventType::ReminderDue => "reminder.due",
            EventType::ReminderCancelled => "reminder.cancelled",
            EventType::SyncTaskChanged => "sync.task_changed",
        }
    }

    /// True for task lifecycle events (`task.*`).
    pub fn is_task_lifecycle(&self) -> bool {
        matches!(
            self,
            EventType::TaskCreated
                | EventType::TaskUpdated
                | EventType::TaskCompleted
                | EventType::TaskDeleted
        )
    }
}

impl std::str::FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "task.created" => Ok(EventType::TaskCreated),
            "task.updated" => Ok(EventType::TaskUpdated),
            "task.completed" => Ok(EventType::TaskCompleted),
            "task.deleted" => Ok(EventType::TaskDeleted),
            "reminder.scheduled" => Ok(EventType::ReminderScheduled),
            "reminder.due" => Ok(EventType::ReminderDue),
            "reminder.cancelled" => Ok(EventType::ReminderCancelled),
            "sync.task_changed" => Ok(EventType::SyncTaskChanged),
            other => Err(Error::InvalidInput(format!("unknown event type: {other}"))),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit exchanged on every topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique event identifier (UUIDv7), the consumer-side deduplication key.
    pub event_id: Uuid,
    /// Event class, wire field `type`.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Task or reminder identifier this event describes.
    pub subject_id: Uuid,
    /// Owning user. All routing and fan-out filtering keys off this; an
    /// envelope without it is quarantined, never broadcast.
    #[serde(default)]
    pub user_id: Uuid,
    /// Type-specific structured data.
    #[serde(default)]
    pub payload: JsonValue,
    /// Producer wall-clock time.
    pub occurred_at: DateTime<Utc>,
    /// Propagated end-to-end for tracing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl Envelope {
    /// Create a new envelope with a fresh UUIDv7 event ID and the current time.
    pub fn new(event_type: EventType, subject_id: Uuid, user_id: Uuid, payload: JsonValue) -> Self {
        Self {
            event_id: new_v7(),
            event_type,
            subject_id,
            user_id,
            payload,
            occurred_at: Utc::now(),
            correlation_id: None,
        }
    }

    /// Attach a correlation ID (propagated across derived envelopes).
    pub fn with_correlation(mut self, correlation_id: Option<Uuid>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Validate the routing invariants.
    ///
    /// Every envelope carries a non-empty `user_id`; consumers reject or
    /// quarantine envelopes missing it rather than risking cross-user
    /// delivery.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.is_nil() {
            return Err(Error::InvalidEnvelope(format!(
                "envelope {} ({}) has no user_id",
                self.event_id, self.event_type
            )));
        }
        Ok(())
    }

    /// Parse the payload as a task lifecycle payload.
    pub fn task_payload(&self) -> Result<TaskPayload> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::InvalidEnvelope(format!("bad task payload: {e}")))
    }

    /// Parse the payload as a reminder payload.
    pub fn reminder_payload(&self) -> Result<ReminderPayload> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::InvalidEnvelope(format!("bad reminder payload: {e}")))
    }
}

/// Payload carried by `task.*` envelopes.
///
/// Unknown fields are ignored; absent fields take their defaults, so older
/// producers stay compatible.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Raw recurrence pattern string ("daily" | "weekly" | "monthly" |
    /// "yearly"). Kept as text here: a corrupted value must dead-letter at
    /// the consumer, not fail envelope decode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<String>,
    /// 1-based index of this task in its recurrence chain.
    #[serde(default = "default_occurrence_index")]
    pub occurrence_index: i32,
    /// First task of the recurrence chain; defaults to `subject_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_task_id: Option<Uuid>,
}

fn default_occurrence_index() -> i32 {
    1
}

/// Payload carried by `reminder.*` envelopes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReminderPayload {
    /// Scheduler job ID (caller-supplied idempotency key).
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fire_at: Option<DateTime<Utc>>,
    /// Set by the scheduler when every fire attempt failed; the dispatcher
    /// skips such envelopes, the audit sink records them.
    #[serde(default)]
    pub fire_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload carried by `sync.task_changed` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPayload {
    /// Wire name of the originating event (e.g. "task.completed").
    pub change: String,
    /// Originating payload, passed through for client rendering.
    #[serde(default)]
    pub detail: JsonValue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_wire_names_exhaustive() {
        assert_eq!(EventType::TaskCreated.as_str(), "task.created");
        assert_eq!(EventType::TaskUpdated.as_str(), "task.updated");
        assert_eq!(EventType::TaskCompleted.as_str(), "task.completed");
        assert_eq!(EventType::TaskDeleted.as_str(), "task.deleted");
        assert_eq!(EventType::ReminderScheduled.as_str(), "reminder.scheduled");
        assert_eq!(EventType::ReminderDue.as_str(), "reminder.due");
        assert_eq!(EventType::ReminderCancelled.as_str(), "reminder.cancelled");
        assert_eq!(EventType::SyncTaskChanged.as_str(), "sync.task_changed");
    }

    #[test]
    fn test_event_type_round_trip() {
        let types = [
            EventType::TaskCreated,
            EventType::TaskUpdated,
            EventType::TaskCompleted,
            EventType::TaskDeleted,
            EventType::ReminderScheduled,
            EventType::ReminderDue,
            EventType::ReminderCancelled,
            EventType::SyncTaskChanged,
        ];
        for t in types {
            let parsed: EventType = t.as_str().parse().unwrap();
            assert_eq!(parsed, t);
        }
    }

    #[test]
    fn test_event_type_unknown_rejected() {
        assert!("task.renamed".parse::<EventType>().is_err());
        assert!("".parse::<EventType>().is_err());
    }

    #[test]
    fn test_envelope_json_uses_type_field() {
        let env = Envelope::new(
            EventType::TaskCompleted,
            Uuid::nil(),
            Uuid::new_v4(),
            json!({"recurrence": "daily"}),
        );
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "task.completed");
        assert!(json["event_id"].is_string());
        assert!(json["occurred_at"].is_string());
        // correlation_id absent when None
        assert!(json.get("correlation_id").is_none());
    }

    #[test]
    fn test_envelope_tolerates_unknown_fields() {
        let raw = json!({
            "event_id": Uuid::new_v4(),
            "type": "task.updated",
            "subject_id": Uuid::new_v4(),
            "user_id": Uuid::new_v4(),
            "payload": {"title": "buy milk", "some_future_field": 7},
            "occurred_at": "2026-01-10T09:00:00Z",
            "a_field_from_the_future": {"nested": true}
        });
        let env: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(env.event_type, EventType::TaskUpdated);
        let payload = env.task_payload().unwrap();
        assert_eq!(payload.title.as_deref(), Some("buy milk"));
    }

    #[test]
    fn test_envelope_missing_user_id_fails_validation() {
        let raw = json!({
            "event_id": Uuid::new_v4(),
            "type": "sync.task_changed",
            "subject_id": Uuid::new_v4(),
            "payload": {},
            "occurred_at": "2026-01-10T09:00:00Z"
        });
        // Deserializes (user_id defaults to nil) but fails validation.
        let env: Envelope = serde_json::from_value(raw).unwrap();
        assert!(env.user_id.is_nil());
        assert!(matches!(env.validate(), Err(Error::InvalidEnvelope(_))));
    }

    #[test]
    fn test_envelope_validate_ok() {
        let env = Envelope::new(
            EventType::TaskCreated,
            Uuid::new_v4(),
            Uuid::new_v4(),
            JsonValue::Null,
        );
        assert!(env.validate().is_ok());
        assert!(crate::uuid_utils::is_v7(&env.event_id));
    }

    #[test]
    fn test_task_payload_defaults() {
        let payload: TaskPayload = serde_json::from_value(json!({})).unwrap();
        assert_eq!(payload.occurrence_index, 1);
        assert!(payload.recurrence.is_none());
        assert!(payload.origin_task_id.is_none());
    }

    #[test]
    fn test_reminder_payload_fire_failed_default() {
        let payload: ReminderPayload =
            serde_json::from_value(json!({"job_id": "reminder:t2"})).unwrap();
        assert_eq!(payload.job_id, "reminder:t2");
        assert!(!payload.fire_failed);
    }

    #[test]
    fn test_correlation_propagation() {
        let corr = Some(new_v7());
        let env = Envelope::new(
            EventType::TaskCompleted,
            Uuid::new_v4(),
            Uuid::new_v4(),
            JsonValue::Null,
        )
        .with_correlation(corr);
        assert_eq!(env.correlation_id, corr);

        let json = serde_json::to_value(&env).unwrap();
        assert!(json["correlation_id"].is_string());
    }

    #[test]
    fn test_is_task_lifecycle() {
        assert!(EventType::TaskCreated.is_task_lifecycle());
        assert!(EventType::TaskDeleted.is_task_lifecycle());
        assert!(!EventType::ReminderDue.is_task_lifecycle());
        assert!(!EventType::SyncTaskChanged.is_task_lifecycle());
    }
}
