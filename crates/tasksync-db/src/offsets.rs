//! Consumer cursor storage.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};

use tasksync_core::{Error, OffsetStore, Result};

/// PostgreSQL implementation of [`OffsetStore`].
///
/// One row per `(topic, consumer_group)`. A missing row reads as cursor 0,
/// which is "start from the beginning of the log".
#[derive(Clone)]
pub struct PgOffsetStore {
    pool: Pool<Postgres>,
}

impl PgOffsetStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OffsetStore for PgOffsetStore {
    async fn get(&self, topic: &str, group: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT last_seq FROM consumer_offsets
             WHERE topic = $1 AND consumer_group = $2",
        )
        .bind(topic)
        .bind(group)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|r| r.get("last_seq")).unwrap_or(0))
    }

    async fn commit(&self, topic: &str, group: &str, seq: i64) -> Result<()> {
        // GREATEST guards against a stale worker committing backwards after
        // another replica has already advanced the cursor.
        sqlx::query(
            "INSERT INTO consumer_offsets (topic, consumer_group, last_seq, updated_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (topic, consumer_group) DO UPDATE
             SET last_seq = GREATEST(consumer_offsets.last_seq, EXCLUDED.last_seq),
                 updated_at = now()",
        )
        .bind(topic)
        .bind(group)
        .bind(seq)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }
}
