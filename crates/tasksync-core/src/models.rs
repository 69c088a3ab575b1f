//! Persisted data models shared across the tasksync crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::envelope::Envelope;

/// Lifecycle state of a [`ScheduledJob`].
///
/// `Firing` is the internal claim state: a replica CAS-transitions
/// `Pending → Firing` before invoking the callback so that no two replicas
/// fire the same job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Firing,
    Fired,
    Cancelled,
}

/// Outcome of the reminder dispatcher's notification side effect, recorded on
/// the scheduled job so duplicate `reminder.due` deliveries are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Sent,
    Failed,
}

/// Persisted record backing the scheduler.
///
/// `job_id` is the caller-supplied idempotency key: re-registering the same
/// `job_id` reschedules rather than duplicates. Rows are never deleted
/// (retained for audit/debug).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub job_id: String,
    pub fire_at: DateTime<Utc>,
    pub payload: JsonValue,
    pub status: JobStatus,
    /// Fire attempts so far (incremented on claim).
    pub attempt_count: i32,
    /// Set when every fire attempt failed and the job was closed out anyway.
    pub fire_failed: bool,
    pub last_error: Option<String>,
    /// Reminder-dispatch outcome, if this job backs a reminder.
    pub dispatch_status: Option<DispatchStatus>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub fired_at: Option<DateTime<Utc>>,
}

/// An envelope as persisted in the event log, with its per-topic sequence
/// number (the consumer cursor unit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub seq: i64,
    pub topic: String,
    pub envelope: Envelope,
}

/// A generated occurrence of a recurring task.
///
/// `(origin_task_id, occurrence_index)` is unique: redelivering the same
/// completion event cannot create a duplicate next-occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOccurrence {
    pub task_id: Uuid,
    pub origin_task_id: Uuid,
    pub occurrence_index: i32,
    pub due_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Immutable audit entry, one per envelope, keyed by `event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_id: Uuid,
    pub topic: String,
    pub event_type: String,
    pub subject_id: Uuid,
    pub user_id: Uuid,
    pub payload: JsonValue,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

/// A dead-lettered envelope awaiting operator inspection and manual replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub topic: String,
    pub consumer_group: String,
    /// The original envelope, verbatim.
    pub envelope: JsonValue,
    pub error_message: String,
    pub attempt_count: i32,
    pub first_failed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Borrowed form used when recording a dead letter.
#[derive(Debug, Clone)]
pub struct NewDeadLetter<'a> {
    pub topic: &'a str,
    pub consumer_group: &'a str,
    pub envelope: &'a Envelope,
    pub error_message: &'a str,
    pub attempt_count: i32,
    pub first_failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventType;
    use serde_json::json;

    #[test]
    fn test_job_status_serde_lowercase() {
        assert_eq!(serde_json::to_string(&JobStatus::Pending).unwrap(), "\"pending\"");
        assert_eq!(serde_json::to_string(&JobStatus::Firing).unwrap(), "\"firing\"");
        assert_eq!(serde_json::to_string(&JobStatus::Fired).unwrap(), "\"fired\"");
        assert_eq!(
            serde_json::to_string(&JobStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn test_dispatch_status_serde() {
        assert_eq!(serde_json::to_string(&DispatchStatus::Sent).unwrap(), "\"sent\"");
        let parsed: DispatchStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(parsed, DispatchStatus::Failed);
    }

    #[test]
    fn test_stored_event_round_trip() {
        let env = Envelope::new(
            EventType::TaskCreated,
            Uuid::new_v4(),
            Uuid::new_v4(),
            json!({"title": "write tests"}),
        );
        let stored = StoredEvent {
            seq: 7,
            topic: "task-events".to_string(),
            envelope: env.clone(),
        };
        let json = serde_json::to_string(&stored).unwrap();
        let back: StoredEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.seq, 7);
        assert_eq!(back.envelope.event_id, env.event_id);
        assert_eq!(back.envelope.event_type, EventType::TaskCreated);
    }
}
