//! Fan-out consumer and staleness sweeper.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info};

use tasksync_bus::{EventHandler, HandlerOutcome};
use tasksync_core::{defaults, Error, EventType, Result, StoredEvent};

use crate::registry::ConnectionRegistry;

/// Consumer group name.
pub const FANOUT_GROUP: &str = "fanout";

/// Consumer group `fanout` on `task-updates`: pushes each `sync.task_changed`
/// envelope, as JSON, to every live connection of the target user.
///
/// Delivery to sockets is best-effort by design; the cursor still advances
/// when nobody is connected. Clients recover missed updates by re-fetching a
/// snapshot on reconnect, never by hub-side replay.
pub struct FanoutHub {
    registry: Arc<ConnectionRegistry>,
}

impl FanoutHub {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EventHandler for FanoutHub {
    async fn handle(&self, event: &StoredEvent, _attempt: i32) -> HandlerOutcome {
        if event.envelope.event_type != EventType::SyncTaskChanged {
            return HandlerOutcome::Success;
        }

        let payload = match serde_json::to_string(&event.envelope) {
            Ok(json) => json,
            Err(e) => {
                return HandlerOutcome::Terminal(format!("unserializable envelope: {e}"));
            }
        };

        let delivered = self
            .registry
            .broadcast_to_user(event.envelope.user_id, &payload)
            .await;
        debug!(
            subsystem = "hub",
            consumer_group = FANOUT_GROUP,
            event_id = %event.envelope.event_id,
            user_id = %event.envelope.user_id,
            delivered = delivered,
            "Fanned out sync event"
        );
        HandlerOutcome::Success
    }
}

/// Handle for controlling the staleness sweeper.
pub struct SweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SweeperHandle {
    /// Signal the sweeper to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }
}

/// Start the background sweep that drops connections whose last heartbeat is
/// older than `HEARTBEAT_TIMEOUT_SECS`.
pub fn start_sweeper(registry: Arc<ConnectionRegistry>) -> SweeperHandle {
    start_sweeper_with(
        registry,
        Duration::from_secs(defaults::SWEEP_INTERVAL_SECS),
        chrono::Duration::seconds(defaults::HEARTBEAT_TIMEOUT_SECS),
    )
}

/// Sweeper with custom timings (tests).
pub fn start_sweeper_with(
    registry: Arc<ConnectionRegistry>,
    sweep_interval: Duration,
    heartbeat_timeout: chrono::Duration,
) -> SweeperHandle {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

    tokio::spawn(async move {
        info!(
            subsystem = "hub",
            component = "sweeper",
            sweep_interval_secs = sweep_interval.as_secs(),
            "Staleness sweeper started"
        );
        let mut ticker = interval(sweep_interval);
        ticker.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    let removed = registry.sweep_stale(heartbeat_timeout).await;
                    if removed > 0 {
                        info!(
                            subsystem = "hub",
                            component = "sweeper",
                            removed = removed,
                            "Swept stale connections"
                        );
                    }
                }
            }
        }
        info!(subsystem = "hub", component = "sweeper", "Staleness sweeper stopped");
    });

    SweeperHandle { shutdown_tx }
}
