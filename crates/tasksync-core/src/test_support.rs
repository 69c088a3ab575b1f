//! In-memory repository implementations for tests.
//!
//! Behavior tests across the workspace (bus delivery, scheduler firing,
//! consumer idempotency) run against these instead of PostgreSQL. The
//! [`MemoryEventStore`] additionally supports failure injection to exercise
//! the publisher's retry path.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::models::{
    AuditRecord, DeadLetter, DispatchStatus, JobStatus, NewDeadLetter, ScheduledJob, StoredEvent,
    TaskOccurrence,
};
use crate::traits::{
    AuditRepository, DeadLetterRepository, EventStore, OccurrenceRepository, OffsetStore,
    ScheduledJobRepository,
};
use crate::uuid_utils::new_v7;

/// In-memory event log with optional injected append failures.
#[derive(Default)]
pub struct MemoryEventStore {
    topics: Mutex<HashMap<String, Vec<StoredEvent>>>,
    seen: Mutex<HashSet<Uuid>>,
    /// Number of upcoming `append` calls that fail with a simulated store
    /// outage. Decremented per failing call.
    fail_next: AtomicU32,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` append calls fail (simulated broker downtime).
    pub fn fail_next_appends(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Total number of stored events across all topics.
    pub async fn len(&self) -> usize {
        self.topics.lock().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, topic: &str, envelope: &Envelope) -> Result<Option<StoredEvent>> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Publish("simulated store outage".to_string()));
        }

        let mut seen = self.seen.lock().await;
        if !seen.insert(envelope.event_id) {
            return Ok(None);
        }
        drop(seen);

        let mut topics = self.topics.lock().await;
        let log = topics.entry(topic.to_string()).or_default();
        let stored = StoredEvent {
            seq: log.len() as i64 + 1,
            topic: topic.to_string(),
            envelope: envelope.clone(),
        };
        log.push(stored.clone());
        Ok(Some(stored))
    }

    async fn load_after(&self, topic: &str, after_seq: i64, limit: i64) -> Result<Vec<StoredEvent>> {
        let topics = self.topics.lock().await;
        Ok(topics
            .get(topic)
            .map(|log| {
                log.iter()
                    .filter(|e| e.seq > after_seq)
                    .take(limit.max(0) as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_by_event_id(&self, event_id: Uuid) -> Result<Option<StoredEvent>> {
        let topics = self.topics.lock().await;
        Ok(topics
            .values()
            .flatten()
            .find(|e| e.envelope.event_id == event_id)
            .cloned())
    }
}

/// In-memory `(topic, group) -> last_seq` map.
#[derive(Default)]
pub struct MemoryOffsetStore {
    offsets: Mutex<HashMap<(String, String), i64>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn get(&self, topic: &str, group: &str) -> Result<i64> {
        let offsets = self.offsets.lock().await;
        Ok(*offsets
            .get(&(topic.to_string(), group.to_string()))
            .unwrap_or(&0))
    }

    async fn commit(&self, topic: &str, group: &str, seq: i64) -> Result<()> {
        let mut offsets = self.offsets.lock().await;
        offsets.insert((topic.to_string(), group.to_string()), seq);
        Ok(())
    }
}

/// In-memory scheduled-job table with the same CAS semantics as the Postgres
/// implementation.
#[derive(Default)]
pub struct MemoryScheduledJobRepository {
    jobs: Mutex<HashMap<String, ScheduledJob>>,
}

impl MemoryScheduledJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

#[async_trait]
impl ScheduledJobRepository for MemoryScheduledJobRepository {
    async fn upsert(
        &self,
        job_id: &str,
        fire_at: DateTime<Utc>,
        payload: JsonValue,
    ) -> Result<ScheduledJob> {
        let mut jobs = self.jobs.lock().await;
        let job = ScheduledJob {
            job_id: job_id.to_string(),
            fire_at,
            payload,
            status: JobStatus::Pending,
            attempt_count: 0,
            fire_failed: false,
            last_error: None,
            dispatch_status: None,
            dispatched_at: None,
            created_at: jobs
                .get(job_id)
                .map(|existing| existing.created_at)
                .unwrap_or_else(Utc::now),
            claimed_at: None,
            fired_at: None,
        };
        jobs.insert(job_id.to_string(), job.clone());
        Ok(job)
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledJob>> {
        let stale_cutoff = now - chrono::Duration::seconds(crate::defaults::FIRING_RECLAIM_SECS);
        let mut jobs = self.jobs.lock().await;

        let mut due: Vec<String> = jobs
            .values()
            .filter(|j| {
                (j.status == JobStatus::Pending && j.fire_at <= now)
                    || (j.status == JobStatus::Firing
                        && j.claimed_at.map(|c| c < stale_cutoff).unwrap_or(true))
            })
            .map(|j| j.job_id.clone())
            .collect();
        due.sort_by_key(|id| jobs[id].fire_at);
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Firing;
                job.claimed_at = Some(now);
                job.attempt_count += 1;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_fired(&self, job_id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(job_id) {
            Some(job) if job.status == JobStatus::Firing => {
                job.status = JobStatus::Fired;
                job.fired_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_fire_failed(&self, job_id: &str, error: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(job_id) {
            job.status = JobStatus::Fired;
            job.fire_failed = true;
            job.last_error = Some(error.to_string());
            job.fired_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_dispatch(&self, job_id: &str, status: DispatchStatus) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(job_id) {
            Some(job) => {
                job.dispatch_status = Some(status);
                job.dispatched_at = Some(Utc::now());
                Ok(())
            }
            None => Err(Error::JobNotFound(job_id.to_string())),
        }
    }

    async fn get(&self, job_id: &str) -> Result<Option<ScheduledJob>> {
        Ok(self.jobs.lock().await.get(job_id).cloned())
    }
}

/// In-memory occurrence table with the `(origin, index)` uniqueness key.
#[derive(Default)]
pub struct MemoryOccurrenceRepository {
    occurrences: Mutex<HashMap<(Uuid, i32), TaskOccurrence>>,
}

impl MemoryOccurrenceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn occurrence_count(&self) -> usize {
        self.occurrences.lock().await.len()
    }
}

#[async_trait]
impl OccurrenceRepository for MemoryOccurrenceRepository {
    async fn create_if_absent(
        &self,
        origin_task_id: Uuid,
        occurrence_index: i32,
        due_date: DateTime<Utc>,
    ) -> Result<Option<Uuid>> {
        let mut occurrences = self.occurrences.lock().await;
        let key = (origin_task_id, occurrence_index);
        if occurrences.contains_key(&key) {
            return Ok(None);
        }
        let task_id = new_v7();
        occurrences.insert(
            key,
            TaskOccurrence {
                task_id,
                origin_task_id,
                occurrence_index,
                due_date,
                created_at: Utc::now(),
            },
        );
        Ok(Some(task_id))
    }

    async fn get(
        &self,
        origin_task_id: Uuid,
        occurrence_index: i32,
    ) -> Result<Option<TaskOccurrence>> {
        Ok(self
            .occurrences
            .lock()
            .await
            .get(&(origin_task_id, occurrence_index))
            .cloned())
    }
}

/// In-memory append-only audit log.
#[derive(Default)]
pub struct MemoryAuditRepository {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_count(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl AuditRepository for MemoryAuditRepository {
    async fn record(&self, topic: &str, envelope: &Envelope) -> Result<bool> {
        let mut records = self.records.lock().await;
        if records.iter().any(|r| r.event_id == envelope.event_id) {
            return Ok(false);
        }
        records.push(AuditRecord {
            event_id: envelope.event_id,
            topic: topic.to_string(),
            event_type: envelope.event_type.as_str().to_string(),
            subject_id: envelope.subject_id,
            user_id: envelope.user_id,
            payload: envelope.payload.clone(),
            occurred_at: envelope.occurred_at,
            recorded_at: Utc::now(),
        });
        Ok(true)
    }

    async fn list_for_subject(&self, subject_id: Uuid, limit: i64) -> Result<Vec<AuditRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|r| r.subject_id == subject_id)
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

/// In-memory dead-letter store.
#[derive(Default)]
pub struct MemoryDeadLetterRepository {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn letter_count(&self) -> usize {
        self.letters.lock().await.len()
    }

    pub async fn all(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.clone()
    }
}

#[async_trait]
impl DeadLetterRepository for MemoryDeadLetterRepository {
    async fn record(&self, dead_letter: NewDeadLetter<'_>) -> Result<Uuid> {
        let id = new_v7();
        let mut letters = self.letters.lock().await;
        letters.push(DeadLetter {
            id,
            topic: dead_letter.topic.to_string(),
            consumer_group: dead_letter.consumer_group.to_string(),
            envelope: serde_json::to_value(dead_letter.envelope)?,
            error_message: dead_letter.error_message.to_string(),
            attempt_count: dead_letter.attempt_count,
            first_failed_at: dead_letter.first_failed_at,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        let letters = self.letters.lock().await;
        Ok(letters
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
