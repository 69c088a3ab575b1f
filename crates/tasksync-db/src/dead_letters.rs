//! Dead letter repository implementation.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use tasksync_core::{
    new_v7, DeadLetter, DeadLetterRepository, Error, NewDeadLetter, Result,
};

/// PostgreSQL implementation of [`DeadLetterRepository`].
///
/// Dead letters are terminal: a consumer parks the envelope here, advances its
/// cursor, and an operator decides what to do. Replay is manual.
#[derive(Clone)]
pub struct PgDeadLetterRepository {
    pool: Pool<Postgres>,
}

impl PgDeadLetterRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterRepository for PgDeadLetterRepository {
    async fn record(&self, dead_letter: NewDeadLetter<'_>) -> Result<Uuid> {
        let id = new_v7();
        sqlx::query(
            "INSERT INTO dead_letters
                 (id, topic, consumer_group, envelope, error_message,
                  attempt_count, first_failed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(id)
        .bind(dead_letter.topic)
        .bind(dead_letter.consumer_group)
        .bind(serde_json::to_value(dead_letter.envelope)?)
        .bind(dead_letter.error_message)
        .bind(dead_letter.attempt_count)
        .bind(dead_letter.first_failed_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(id)
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT id, topic, consumer_group, envelope, error_message,
                    attempt_count, first_failed_at, created_at
             FROM dead_letters
             ORDER BY created_at DESC
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|r| DeadLetter {
                id: r.get("id"),
                topic: r.get("topic"),
                consumer_group: r.get("consumer_group"),
                envelope: r.get("envelope"),
                error_message: r.get("error_message"),
                attempt_count: r.get("attempt_count"),
                first_failed_at: r.get("first_failed_at"),
                created_at: r.get("created_at"),
            })
            .collect())
    }
}
