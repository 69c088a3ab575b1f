//! Repository traits implemented by `tasksync-db` (PostgreSQL) and by the
//! in-memory stores in [`crate::test_support`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::Result;
use crate::models::{
    AuditRecord, DeadLetter, DispatchStatus, NewDeadLetter, ScheduledJob, StoredEvent,
    TaskOccurrence,
};

/// Durable, per-topic ordered event log backing the bus.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an envelope, insert-if-absent on `event_id`.
    ///
    /// Returns the stored event with its assigned sequence number, or `None`
    /// when the event was already present (publish retries are no-ops).
    async fn append(&self, topic: &str, envelope: &Envelope) -> Result<Option<StoredEvent>>;

    /// Load up to `limit` events on `topic` with `seq > after_seq`, ordered
    /// by sequence number.
    async fn load_after(&self, topic: &str, after_seq: i64, limit: i64) -> Result<Vec<StoredEvent>>;

    /// Look up a stored event by its envelope `event_id`.
    ///
    /// The publish path uses this to recover the assigned sequence number
    /// when an append timed out after the insert actually landed.
    async fn get_by_event_id(&self, event_id: Uuid) -> Result<Option<StoredEvent>>;
}

/// Durable per-`(topic, consumer_group)` cursor.
///
/// Advanced only after the consumer's side effect is applied; a crash between
/// side effect and advance causes redelivery, which consumers tolerate.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Last committed sequence number, 0 when the group has no cursor yet.
    async fn get(&self, topic: &str, group: &str) -> Result<i64>;

    /// Advance the cursor (upsert).
    async fn commit(&self, topic: &str, group: &str, seq: i64) -> Result<()>;
}

/// Persisted store for scheduler jobs.
#[async_trait]
pub trait ScheduledJobRepository: Send + Sync {
    /// Register or reschedule a job; `job_id` is the idempotency key.
    ///
    /// An existing row is atomically reset to `pending` with the new
    /// `fire_at`/`payload` (previous fire/dispatch state cleared).
    async fn upsert(
        &self,
        job_id: &str,
        fire_at: DateTime<Utc>,
        payload: JsonValue,
    ) -> Result<ScheduledJob>;

    /// CAS `pending → cancelled`. Returns `false` when the job was not
    /// pending (already firing, fired, cancelled, or absent) — cancelling
    /// concurrently with a fire yields "fired once" or "cancelled", never
    /// both.
    async fn cancel(&self, job_id: &str) -> Result<bool>;

    /// Atomically claim up to `limit` due jobs: CAS `pending → firing` on
    /// rows with `fire_at <= now`, plus reclaim of stale `firing` rows left
    /// behind by a crashed replica. Safe to run from multiple replicas.
    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledJob>>;

    /// CAS `firing → fired`. Returns `false` when the job was concurrently
    /// cancelled or is otherwise no longer firing.
    async fn mark_fired(&self, job_id: &str) -> Result<bool>;

    /// Close out a job whose fire attempts were exhausted: `fired` with the
    /// failure flag set and the last error recorded.
    async fn mark_fire_failed(&self, job_id: &str, error: &str) -> Result<()>;

    /// Record the reminder dispatcher's outcome.
    async fn record_dispatch(&self, job_id: &str, status: DispatchStatus) -> Result<()>;

    async fn get(&self, job_id: &str) -> Result<Option<ScheduledJob>>;
}

/// Store for generated recurring-task occurrences.
#[async_trait]
pub trait OccurrenceRepository: Send + Sync {
    /// Insert-if-absent on `(origin_task_id, occurrence_index)`.
    ///
    /// Returns the new occurrence's task ID when inserted, `None` when an
    /// occurrence with that key already exists (duplicate delivery).
    async fn create_if_absent(
        &self,
        origin_task_id: Uuid,
        occurrence_index: i32,
        due_date: DateTime<Utc>,
    ) -> Result<Option<Uuid>>;

    async fn get(
        &self,
        origin_task_id: Uuid,
        occurrence_index: i32,
    ) -> Result<Option<TaskOccurrence>>;
}

/// Append-only audit store keyed by `event_id`.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    /// Insert-if-absent. Returns `false` when the event was already recorded
    /// (duplicate delivery is a no-op). Never mutates prior records.
    async fn record(&self, topic: &str, envelope: &Envelope) -> Result<bool>;

    async fn list_for_subject(&self, subject_id: Uuid, limit: i64) -> Result<Vec<AuditRecord>>;
}

/// Store for envelopes a consumer could not process.
#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    async fn record(&self, dead_letter: NewDeadLetter<'_>) -> Result<Uuid>;

    /// Most recent dead letters, for the operator surface.
    async fn list_recent(&self, limit: i64) -> Result<Vec<DeadLetter>>;
}
