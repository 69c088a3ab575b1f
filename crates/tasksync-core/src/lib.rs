//! # tasksync-core
//!
//! Core types, traits, and abstractions for the tasksync event core.
//!
//! This crate provides the foundational data structures and trait definitions
//! that the other tasksync crates depend on: the event envelope and its closed
//! type enumeration, recurrence arithmetic, the persisted models (scheduled
//! jobs, audit records, dead letters), and the repository traits implemented
//! by `tasksync-db`.

pub mod defaults;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod models;
pub mod recurrence;
pub mod test_support;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use envelope::{
    Envelope, EventType, ReminderPayload, SyncPayload, TaskPayload, TOPIC_REMINDERS,
    TOPIC_TASK_EVENTS, TOPIC_TASK_UPDATES,
};
pub use error::{Error, Result};
pub use models::{
    AuditRecord, DeadLetter, DispatchStatus, JobStatus, NewDeadLetter, ScheduledJob, StoredEvent,
    TaskOccurrence,
};
pub use recurrence::Recurrence;
pub use traits::{
    AuditRepository, DeadLetterRepository, EventStore, OccurrenceRepository, OffsetStore,
    ScheduledJobRepository,
};
pub use uuid_utils::{is_v7, new_v7};
