//! # tasksync-scheduler
//!
//! Persistent time-based firing for scheduled jobs (reminders).
//!
//! Jobs live in the database, not in memory: registration is an upsert on the
//! job table, so a restarted process picks up everything that came due while
//! it was down on its first poll. Claims go through a `pending -> firing` CAS
//! with `FOR UPDATE SKIP LOCKED`, so multiple replicas partition the due set
//! and no job fires twice for one claim.
//!
//! The scheduler knows nothing about topics or envelopes. It fires through
//! the [`FireHandler`] seam; the server wires that to the bus publisher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use tasksync_core::{defaults, Error, Result, ScheduledJob, ScheduledJobRepository};

/// Callback seam for firing claimed jobs.
#[async_trait]
pub trait FireHandler: Send + Sync {
    /// Fire one claimed job. An error leaves the job in `firing`; the stale
    /// reclaim window retries it until the attempt budget runs out.
    async fn fire(&self, job: &ScheduledJob) -> Result<()>;

    /// Called once when a job exhausts its attempt budget and is closed out.
    async fn fire_failed(&self, job: &ScheduledJob, error: &str);
}

/// Configuration for the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Jobs claimed per poll.
    pub claim_batch: i64,
    /// Fire attempts per job before it is closed out as failed.
    pub max_fire_attempts: i32,
    /// Whether to run the firing loop at all.
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::SCHEDULER_POLL_INTERVAL_MS,
            claim_batch: defaults::SCHEDULER_CLAIM_BATCH,
            max_fire_attempts: defaults::SCHEDULER_MAX_FIRE_ATTEMPTS,
            enabled: true,
        }
    }
}

impl SchedulerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `SCHEDULER_ENABLED` | `true` | Enable/disable the firing loop |
    /// | `SCHEDULER_POLL_INTERVAL_MS` | `5000` | Polling interval |
    /// | `SCHEDULER_CLAIM_BATCH` | `32` | Jobs claimed per poll |
    /// | `SCHEDULER_MAX_FIRE_ATTEMPTS` | `5` | Attempts before closing out |
    pub fn from_env() -> Self {
        let enabled = std::env::var("SCHEDULER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let poll_interval_ms = std::env::var("SCHEDULER_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::SCHEDULER_POLL_INTERVAL_MS);

        let claim_batch = std::env::var("SCHEDULER_CLAIM_BATCH")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(defaults::SCHEDULER_CLAIM_BATCH)
            .max(1);

        let max_fire_attempts = std::env::var("SCHEDULER_MAX_FIRE_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(defaults::SCHEDULER_MAX_FIRE_ATTEMPTS)
            .max(1);

        Self {
            poll_interval_ms,
            claim_batch,
            max_fire_attempts,
            enabled,
        }
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set jobs claimed per poll.
    pub fn with_claim_batch(mut self, batch: i64) -> Self {
        self.claim_batch = batch;
        self
    }

    /// Set the fire attempt budget.
    pub fn with_max_fire_attempts(mut self, max: i32) -> Self {
        self.max_fire_attempts = max;
        self
    }
}

/// Handle for controlling a running scheduler.
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SchedulerHandle {
    /// Signal the scheduler to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }
}

/// The firing loop.
pub struct Scheduler {
    jobs: Arc<dyn ScheduledJobRepository>,
    handler: Arc<dyn FireHandler>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        jobs: Arc<dyn ScheduledJobRepository>,
        handler: Arc<dyn FireHandler>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            jobs,
            handler,
            config,
        }
    }

    /// Start the scheduler and return a handle for control.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        SchedulerHandle { shutdown_tx }
    }

    /// Run the poll loop.
    ///
    /// The first iteration runs immediately, which is also the startup
    /// catch-up: everything that came due while the process was down claims
    /// and fires on that pass. Only sleeps when a claim comes back empty.
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!(
                subsystem = "scheduler",
                "Scheduler is disabled, not starting"
            );
            return;
        }

        info!(
            subsystem = "scheduler",
            poll_interval_ms = self.config.poll_interval_ms,
            claim_batch = self.config.claim_batch,
            max_fire_attempts = self.config.max_fire_attempts,
            "Scheduler started"
        );

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!(subsystem = "scheduler", "Scheduler received shutdown signal");
                break;
            }

            let claimed = match self.jobs.claim_due(Utc::now(), self.config.claim_batch).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(
                        subsystem = "scheduler",
                        error = %e,
                        "Failed to claim due jobs"
                    );
                    Vec::new()
                }
            };

            if claimed.is_empty() {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(subsystem = "scheduler", "Scheduler received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                }
                continue;
            }

            debug!(
                subsystem = "scheduler",
                claimed = claimed.len(),
                "Firing claimed batch"
            );

            let mut tasks = tokio::task::JoinSet::new();
            for job in claimed {
                let jobs = self.jobs.clone();
                let handler = self.handler.clone();
                let max_attempts = self.config.max_fire_attempts;
                tasks.spawn(async move {
                    fire_one(jobs, handler, job, max_attempts).await;
                });
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(subsystem = "scheduler", error = ?e, "Fire task panicked");
                }
            }
            // No sleep, immediately look for more due jobs.
        }

        info!(subsystem = "scheduler", "Scheduler stopped");
    }
}

/// Fire a single claimed job.
async fn fire_one(
    jobs: Arc<dyn ScheduledJobRepository>,
    handler: Arc<dyn FireHandler>,
    job: ScheduledJob,
    max_attempts: i32,
) {
    match handler.fire(&job).await {
        Ok(()) => {
            match jobs.mark_fired(&job.job_id).await {
                Ok(true) => {
                    info!(
                        subsystem = "scheduler",
                        job_id = %job.job_id,
                        attempt = job.attempt_count,
                        "Job fired"
                    );
                }
                Ok(false) => {
                    // Someone else closed the row first (reclaimed claim that
                    // raced us). The duplicate fire is absorbed downstream.
                    warn!(
                        subsystem = "scheduler",
                        job_id = %job.job_id,
                        "Fired job was no longer in firing state"
                    );
                }
                Err(e) => {
                    error!(
                        subsystem = "scheduler",
                        job_id = %job.job_id,
                        error = %e,
                        "Failed to mark job fired"
                    );
                }
            }
        }
        Err(e) if job.attempt_count >= max_attempts => {
            error!(
                subsystem = "scheduler",
                job_id = %job.job_id,
                attempt = job.attempt_count,
                error = %e,
                "Fire attempts exhausted, closing job out as failed"
            );
            if let Err(mark_err) = jobs.mark_fire_failed(&job.job_id, &e.to_string()).await {
                error!(
                    subsystem = "scheduler",
                    job_id = %job.job_id,
                    error = %mark_err,
                    "Failed to mark job fire-failed"
                );
            }
            handler.fire_failed(&job, &e.to_string()).await;
        }
        Err(e) => {
            // Stays in firing; the stale reclaim window puts it back in play.
            warn!(
                subsystem = "scheduler",
                job_id = %job.job_id,
                attempt = job.attempt_count,
                error = %e,
                "Fire attempt failed, will be reclaimed"
            );
        }
    }
}
