//! Scheduled job repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use sqlx::{postgres::PgRow, Pool, Postgres, Row};
use tracing::warn;

use tasksync_core::{
    defaults, DispatchStatus, Error, JobStatus, Result, ScheduledJob, ScheduledJobRepository,
};

/// PostgreSQL implementation of [`ScheduledJobRepository`].
#[derive(Clone)]
pub struct PgScheduledJobRepository {
    pool: Pool<Postgres>,
}

impl PgScheduledJobRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Convert JobStatus to string for database.
    #[allow(dead_code)]
    fn status_to_str(status: JobStatus) -> &'static str {
        match status {
            JobStatus::Pending => "pending",
            JobStatus::Firing => "firing",
            JobStatus::Fired => "fired",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Convert string from database to JobStatus.
    fn str_to_status(s: &str) -> JobStatus {
        match s {
            "pending" => JobStatus::Pending,
            "firing" => JobStatus::Firing,
            "fired" => JobStatus::Fired,
            "cancelled" => JobStatus::Cancelled,
            other => {
                warn!(
                    subsystem = "scheduler",
                    component = "jobs",
                    status = other,
                    "Unknown job status in database, treating as fired"
                );
                JobStatus::Fired
            }
        }
    }

    fn str_to_dispatch(s: &str) -> Option<DispatchStatus> {
        match s {
            "sent" => Some(DispatchStatus::Sent),
            "failed" => Some(DispatchStatus::Failed),
            _ => None,
        }
    }

    fn dispatch_to_str(status: DispatchStatus) -> &'static str {
        match status {
            DispatchStatus::Sent => "sent",
            DispatchStatus::Failed => "failed",
        }
    }

    fn parse_job_row(row: PgRow) -> ScheduledJob {
        let status: String = row.get("status");
        let dispatch_status: Option<String> = row.get("dispatch_status");
        ScheduledJob {
            job_id: row.get("job_id"),
            fire_at: row.get("fire_at"),
            payload: row.get("payload"),
            status: Self::str_to_status(&status),
            attempt_count: row.get("attempt_count"),
            fire_failed: row.get("fire_failed"),
            last_error: row.get("last_error"),
            dispatch_status: dispatch_status.as_deref().and_then(Self::str_to_dispatch),
            dispatched_at: row.get("dispatched_at"),
            created_at: row.get("created_at"),
            claimed_at: row.get("claimed_at"),
            fired_at: row.get("fired_at"),
        }
    }
}

const JOB_COLUMNS: &str = "job_id, fire_at, payload, status::text, attempt_count, fire_failed,
                           last_error, dispatch_status::text, dispatched_at, created_at,
                           claimed_at, fired_at";

#[async_trait]
impl ScheduledJobRepository for PgScheduledJobRepository {
    async fn upsert(
        &self,
        job_id: &str,
        fire_at: DateTime<Utc>,
        payload: JsonValue,
    ) -> Result<ScheduledJob> {
        // Re-registering an existing job_id is a reschedule: the row resets to
        // pending regardless of its previous state, and all fire/dispatch
        // bookkeeping clears.
        let row = sqlx::query(&format!(
            "INSERT INTO scheduled_jobs (job_id, fire_at, payload)
             VALUES ($1, $2, $3)
             ON CONFLICT (job_id) DO UPDATE
             SET fire_at = EXCLUDED.fire_at,
                 payload = EXCLUDED.payload,
                 status = 'pending'::scheduled_job_status,
                 attempt_count = 0,
                 fire_failed = FALSE,
                 last_error = NULL,
                 dispatch_status = NULL,
                 dispatched_at = NULL,
                 claimed_at = NULL,
                 fired_at = NULL
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(fire_at)
        .bind(&payload)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(Self::parse_job_row(row))
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        // Only pending jobs can be cancelled. Losing the race against a claim
        // means the fire is already in flight, so the caller gets false.
        let result = sqlx::query(
            "UPDATE scheduled_jobs
             SET status = 'cancelled'::scheduled_job_status
             WHERE job_id = $1 AND status = 'pending'::scheduled_job_status",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledJob>> {
        let stale_cutoff = now - Duration::seconds(defaults::FIRING_RECLAIM_SECS);

        // FOR UPDATE SKIP LOCKED so concurrent replicas partition the due set
        // instead of serializing on it. Jobs stuck in firing past the reclaim
        // window (crashed replica) are claimed again, hence at-least-once.
        let rows = sqlx::query(&format!(
            "UPDATE scheduled_jobs
             SET status = 'firing'::scheduled_job_status,
                 claimed_at = $1,
                 attempt_count = attempt_count + 1
             WHERE job_id IN (
                 SELECT job_id FROM scheduled_jobs
                 WHERE (status = 'pending'::scheduled_job_status AND fire_at <= $1)
                    OR (status = 'firing'::scheduled_job_status AND claimed_at < $2)
                 ORDER BY fire_at ASC
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(now)
        .bind(stale_cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_job_row).collect())
    }

    async fn mark_fired(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE scheduled_jobs
             SET status = 'fired'::scheduled_job_status, fired_at = now()
             WHERE job_id = $1 AND status = 'firing'::scheduled_job_status",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_fire_failed(&self, job_id: &str, error: &str) -> Result<()> {
        // Closes the job out after the attempt budget is spent so it stops
        // being reclaimed forever.
        sqlx::query(
            "UPDATE scheduled_jobs
             SET status = 'fired'::scheduled_job_status,
                 fire_failed = TRUE,
                 last_error = $2,
                 fired_at = now()
             WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn record_dispatch(&self, job_id: &str, status: DispatchStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE scheduled_jobs
             SET dispatch_status = $2::dispatch_status, dispatched_at = now()
             WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(Self::dispatch_to_str(status))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<ScheduledJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_job_row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Firing,
            JobStatus::Fired,
            JobStatus::Cancelled,
        ] {
            let s = PgScheduledJobRepository::status_to_str(status);
            assert_eq!(PgScheduledJobRepository::str_to_status(s), status);
        }
    }

    #[test]
    fn test_unknown_status_maps_to_fired() {
        assert_eq!(
            PgScheduledJobRepository::str_to_status("exploded"),
            JobStatus::Fired
        );
    }

    #[test]
    fn test_dispatch_round_trip() {
        for status in [DispatchStatus::Sent, DispatchStatus::Failed] {
            let s = PgScheduledJobRepository::dispatch_to_str(status);
            assert_eq!(PgScheduledJobRepository::str_to_dispatch(s), Some(status));
        }
        assert_eq!(PgScheduledJobRepository::str_to_dispatch("nope"), None);
    }
}
