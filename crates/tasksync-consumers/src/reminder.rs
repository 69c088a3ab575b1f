//! Reminder dispatcher.
//!
//! Consumer group `reminder-dispatch` on `reminders`. Turns `reminder.due`
//! envelopes into one user-facing notification each. The scheduled job row is
//! the dedupe record: once `dispatch_status = Sent` is recorded, redelivered
//! envelopes are no-ops.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tasksync_bus::{EventHandler, HandlerOutcome, Publisher};
use tasksync_core::{
    defaults, DispatchStatus, Envelope, EventType, ReminderPayload, Result,
    ScheduledJobRepository, StoredEvent, TOPIC_TASK_UPDATES,
};

/// Consumer group name.
pub const REMINDER_DISPATCH_GROUP: &str = "reminder-dispatch";

/// Delivery seam for the notification side effect.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, user_id: Uuid, reminder: &ReminderPayload) -> Result<()>;
}

/// POSTs reminder notifications to a configured HTTP endpoint.
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(defaults::NOTIFIER_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Build from `NOTIFIER_URL`; `None` when unset (notifications logged only).
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var("NOTIFIER_URL") {
            Ok(url) if !url.is_empty() => Ok(Some(Self::new(url)?)),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl NotificationSender for HttpNotifier {
    async fn send(&self, user_id: Uuid, reminder: &ReminderPayload) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "user_id": user_id,
                "reminder": reminder,
            }))
            .send()
            .await?;
        response.error_for_status()?;
        Ok(())
    }
}

pub struct ReminderDispatcher {
    jobs: Arc<dyn ScheduledJobRepository>,
    notifier: Arc<dyn NotificationSender>,
    publisher: Publisher,
    /// Mirrors the subscription's attempt budget so the final attempt can
    /// record the user-visible `Failed` before going terminal.
    max_attempts: i32,
}

impl ReminderDispatcher {
    pub fn new(
        jobs: Arc<dyn ScheduledJobRepository>,
        notifier: Arc<dyn NotificationSender>,
        publisher: Publisher,
    ) -> Self {
        Self {
            jobs,
            notifier,
            publisher,
            max_attempts: defaults::CONSUMER_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max: i32) -> Self {
        self.max_attempts = max;
        self
    }

    async fn record(&self, job_id: &str, status: DispatchStatus) {
        if let Err(e) = self.jobs.record_dispatch(job_id, status).await {
            warn!(
                subsystem = "consumers",
                consumer_group = REMINDER_DISPATCH_GROUP,
                job_id = job_id,
                error = %e,
                "Failed to record dispatch outcome"
            );
        }
    }
}

#[async_trait]
impl EventHandler for ReminderDispatcher {
    async fn handle(&self, event: &StoredEvent, attempt: i32) -> HandlerOutcome {
        if event.envelope.event_type != EventType::ReminderDue {
            return HandlerOutcome::Success;
        }

        let reminder = match event.envelope.reminder_payload() {
            Ok(r) => r,
            Err(e) => {
                return HandlerOutcome::Terminal(format!("undecodable reminder payload: {e}"));
            }
        };

        if reminder.fire_failed {
            // Scheduler terminal-failure marker; the audit sink records it,
            // nobody gets notified.
            debug!(
                subsystem = "consumers",
                consumer_group = REMINDER_DISPATCH_GROUP,
                job_id = %reminder.job_id,
                "Skipping fire-failed reminder envelope"
            );
            return HandlerOutcome::Success;
        }

        match self.jobs.get(&reminder.job_id).await {
            Ok(Some(job)) if job.dispatch_status == Some(DispatchStatus::Sent) => {
                debug!(
                    subsystem = "consumers",
                    consumer_group = REMINDER_DISPATCH_GROUP,
                    job_id = %reminder.job_id,
                    "Reminder already dispatched, skipping"
                );
                return HandlerOutcome::Success;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(
                    subsystem = "consumers",
                    consumer_group = REMINDER_DISPATCH_GROUP,
                    job_id = %reminder.job_id,
                    "No scheduled job backs this reminder, dispatching without dedupe"
                );
            }
            Err(e) => return HandlerOutcome::Retry(format!("job lookup failed: {e}")),
        }

        match self.notifier.send(event.envelope.user_id, &reminder).await {
            Ok(()) => {
                self.record(&reminder.job_id, DispatchStatus::Sent).await;
                info!(
                    subsystem = "consumers",
                    consumer_group = REMINDER_DISPATCH_GROUP,
                    job_id = %reminder.job_id,
                    user_id = %event.envelope.user_id,
                    attempt = attempt,
                    "Reminder dispatched"
                );

                // Let connected clients see the delivered state.
                let sync = Envelope::new(
                    EventType::SyncTaskChanged,
                    reminder.task_id.unwrap_or(event.envelope.subject_id),
                    event.envelope.user_id,
                    json!({
                        "change": EventType::ReminderDue.as_str(),
                        "detail": event.envelope.payload,
                    }),
                )
                .with_correlation(
                    event
                        .envelope
                        .correlation_id
                        .or(Some(event.envelope.event_id)),
                );
                if let Err(e) = self.publisher.publish(TOPIC_TASK_UPDATES, sync).await {
                    error!(
                        subsystem = "consumers",
                        consumer_group = REMINDER_DISPATCH_GROUP,
                        job_id = %reminder.job_id,
                        error = %e,
                        "Failed to publish dispatch sync event"
                    );
                }
                HandlerOutcome::Success
            }
            Err(e) if attempt >= self.max_attempts => {
                self.record(&reminder.job_id, DispatchStatus::Failed).await;
                HandlerOutcome::Terminal(format!("notification failed: {e}"))
            }
            Err(e) => HandlerOutcome::Retry(format!("notification failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tasksync_bus::Broker;
    use tasksync_core::test_support::{MemoryEventStore, MemoryScheduledJobRepository};
    use tasksync_core::{Error, EventStore, TOPIC_REMINDERS};
    use tokio::sync::Mutex;

    struct MockNotifier {
        sent: Mutex<Vec<String>>,
        failures_remaining: AtomicU32,
    }

    impl MockNotifier {
        fn new() -> Arc<Self> {
            Self::failing(0)
        }

        fn failing(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                failures_remaining: AtomicU32::new(failures),
            })
        }
    }

    #[async_trait]
    impl NotificationSender for MockNotifier {
        async fn send(&self, _user_id: Uuid, reminder: &ReminderPayload) -> Result<()> {
            if self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Request("gateway timeout".to_string()));
            }
            self.sent.lock().await.push(reminder.job_id.clone());
            Ok(())
        }
    }

    struct Fixture {
        dispatcher: ReminderDispatcher,
        jobs: Arc<MemoryScheduledJobRepository>,
        notifier: Arc<MockNotifier>,
        store: Arc<MemoryEventStore>,
    }

    async fn fixture(notifier: Arc<MockNotifier>) -> Fixture {
        let jobs = Arc::new(MemoryScheduledJobRepository::new());
        jobs.upsert("reminder:42", Utc::now(), json!({})).await.unwrap();
        let store = Arc::new(MemoryEventStore::new());
        let publisher = Publisher::new(store.clone(), Broker::new(32));
        Fixture {
            dispatcher: ReminderDispatcher::new(jobs.clone(), notifier.clone(), publisher),
            jobs,
            notifier,
            store,
        }
    }

    fn due_event() -> StoredEvent {
        StoredEvent {
            seq: 1,
            topic: TOPIC_REMINDERS.to_string(),
            envelope: Envelope::new(
                EventType::ReminderDue,
                Uuid::new_v4(),
                Uuid::new_v4(),
                json!({
                    "job_id": "reminder:42",
                    "task_id": Uuid::new_v4(),
                    "message": "Water plants",
                    "fire_at": Utc::now(),
                }),
            ),
        }
    }

    #[tokio::test]
    async fn test_due_reminder_notifies_and_records_sent() {
        let f = fixture(MockNotifier::new()).await;
        let event = due_event();

        assert_eq!(f.dispatcher.handle(&event, 1).await, HandlerOutcome::Success);

        assert_eq!(*f.notifier.sent.lock().await, vec!["reminder:42".to_string()]);
        let job = f.jobs.get("reminder:42").await.unwrap().unwrap();
        assert_eq!(job.dispatch_status, Some(DispatchStatus::Sent));

        // Clients were told.
        let published = f.store.load_after(TOPIC_TASK_UPDATES, 0, 10).await.unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0].envelope.event_type,
            EventType::SyncTaskChanged
        );
    }

    #[tokio::test]
    async fn test_redelivered_reminder_is_noop_after_sent() {
        let f = fixture(MockNotifier::new()).await;
        let event = due_event();

        f.dispatcher.handle(&event, 1).await;
        f.dispatcher.handle(&event, 1).await;

        assert_eq!(f.notifier.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_notify_failure_retries() {
        let f = fixture(MockNotifier::failing(1)).await;
        let event = due_event();

        assert!(matches!(
            f.dispatcher.handle(&event, 1).await,
            HandlerOutcome::Retry(_)
        ));
        assert_eq!(f.dispatcher.handle(&event, 2).await, HandlerOutcome::Success);
        assert_eq!(f.notifier.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_final_attempt_failure_records_failed() {
        let f = fixture(MockNotifier::failing(u32::MAX)).await;
        let event = due_event();

        let outcome = f
            .dispatcher
            .handle(&event, defaults::CONSUMER_MAX_ATTEMPTS)
            .await;
        assert!(matches!(outcome, HandlerOutcome::Terminal(_)));

        let job = f.jobs.get("reminder:42").await.unwrap().unwrap();
        assert_eq!(job.dispatch_status, Some(DispatchStatus::Failed));
    }

    #[tokio::test]
    async fn test_fire_failed_marker_is_skipped() {
        let f = fixture(MockNotifier::new()).await;
        let mut event = due_event();
        event.envelope.payload["fire_failed"] = json!(true);

        assert_eq!(f.dispatcher.handle(&event, 1).await, HandlerOutcome::Success);
        assert!(f.notifier.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_non_due_reminder_events_pass_through() {
        let f = fixture(MockNotifier::new()).await;
        let mut event = due_event();
        event.envelope.event_type = EventType::ReminderScheduled;

        assert_eq!(f.dispatcher.handle(&event, 1).await, HandlerOutcome::Success);
        assert!(f.notifier.sent.lock().await.is_empty());
    }
}
