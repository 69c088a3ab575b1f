//! Audit sink.
//!
//! Consumer group `audit`, subscribed to both `task-events` and `reminders`.
//! Every envelope lands in the audit log exactly once; `event_id` is the
//! primary key, so redelivery records nothing.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use tasksync_bus::{EventHandler, HandlerOutcome};
use tasksync_core::{AuditRepository, StoredEvent};

/// Consumer group name.
pub const AUDIT_GROUP: &str = "audit";

pub struct AuditSink {
    audit: Arc<dyn AuditRepository>,
}

impl AuditSink {
    pub fn new(audit: Arc<dyn AuditRepository>) -> Self {
        Self { audit }
    }
}

#[async_trait]
impl EventHandler for AuditSink {
    async fn handle(&self, event: &StoredEvent, _attempt: i32) -> HandlerOutcome {
        match self.audit.record(&event.topic, &event.envelope).await {
            Ok(recorded) => {
                if !recorded {
                    debug!(
                        subsystem = "consumers",
                        consumer_group = AUDIT_GROUP,
                        event_id = %event.envelope.event_id,
                        topic = %event.topic,
                        "Envelope already audited, skipping"
                    );
                }
                HandlerOutcome::Success
            }
            Err(e) => HandlerOutcome::Retry(format!("audit insert failed: {e}")),
        }
    }
}
