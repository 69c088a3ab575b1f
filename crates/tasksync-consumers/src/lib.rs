//! # tasksync-consumers
//!
//! The consumer-group handlers that react to bus traffic: occurrence
//! generation for recurring tasks, reminder notification dispatch, the audit
//! trail, and mirroring lifecycle events onto the hub's topic.
//!
//! Every handler here is idempotent. The bus redelivers on restart and retry;
//! each handler carries its own dedupe key (occurrence uniqueness, dispatch
//! status, audit primary key) instead of trusting delivery counts.

pub mod audit;
pub mod mirror;
pub mod recurrence;
pub mod reminder;

pub use audit::{AuditSink, AUDIT_GROUP};
pub use mirror::{SyncMirror, MIRROR_GROUP};
pub use recurrence::{RecurrenceGenerator, RECURRENCE_GROUP};
pub use reminder::{
    HttpNotifier, NotificationSender, ReminderDispatcher, REMINDER_DISPATCH_GROUP,
};
