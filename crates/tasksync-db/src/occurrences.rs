//! Generated task occurrence repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use tasksync_core::{new_v7, Error, OccurrenceRepository, Result, TaskOccurrence};

/// PostgreSQL implementation of [`OccurrenceRepository`].
///
/// The unique index on `(origin_task_id, occurrence_index)` is what makes the
/// recurrence consumer idempotent under redelivery.
#[derive(Clone)]
pub struct PgOccurrenceRepository {
    pool: Pool<Postgres>,
}

impl PgOccurrenceRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OccurrenceRepository for PgOccurrenceRepository {
    async fn create_if_absent(
        &self,
        origin_task_id: Uuid,
        occurrence_index: i32,
        due_date: DateTime<Utc>,
    ) -> Result<Option<Uuid>> {
        let task_id = new_v7();
        let row = sqlx::query(
            "INSERT INTO task_occurrences (task_id, origin_task_id, occurrence_index, due_date)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (origin_task_id, occurrence_index) DO NOTHING
             RETURNING task_id",
        )
        .bind(task_id)
        .bind(origin_task_id)
        .bind(occurrence_index)
        .bind(due_date)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|r| r.get("task_id")))
    }

    async fn get(
        &self,
        origin_task_id: Uuid,
        occurrence_index: i32,
    ) -> Result<Option<TaskOccurrence>> {
        let row = sqlx::query(
            "SELECT task_id, origin_task_id, occurrence_index, due_date, created_at
             FROM task_occurrences
             WHERE origin_task_id = $1 AND occurrence_index = $2",
        )
        .bind(origin_task_id)
        .bind(occurrence_index)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|r| TaskOccurrence {
            task_id: r.get("task_id"),
            origin_task_id: r.get("origin_task_id"),
            occurrence_index: r.get("occurrence_index"),
            due_date: r.get("due_date"),
            created_at: r.get("created_at"),
        }))
    }
}
