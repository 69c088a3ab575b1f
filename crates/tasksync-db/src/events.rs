//! Durable event log implementation.
//!
//! Every published envelope lands in `event_log` before any in-process
//! delivery happens. The bigserial `seq` column is the consumer cursor unit:
//! consumer groups track the last `seq` they finished, so a restart replays
//! everything after it.

use async_trait::async_trait;
use sqlx::{postgres::PgRow, Pool, Postgres, Row};
use tracing::debug;

use tasksync_core::{Envelope, Error, EventStore, Result, StoredEvent};

/// PostgreSQL implementation of [`EventStore`].
#[derive(Clone)]
pub struct PgEventStore {
    pool: Pool<Postgres>,
}

impl PgEventStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_event_row(row: &PgRow) -> Result<StoredEvent> {
        let event_type: String = row.get("event_type");
        Ok(StoredEvent {
            seq: row.get("seq"),
            topic: row.get("topic"),
            envelope: Envelope {
                event_id: row.get("event_id"),
                event_type: event_type.parse()?,
                subject_id: row.get("subject_id"),
                user_id: row.get("user_id"),
                payload: row.get("payload"),
                occurred_at: row.get("occurred_at"),
                correlation_id: row.get("correlation_id"),
            },
        })
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(&self, topic: &str, envelope: &Envelope) -> Result<Option<StoredEvent>> {
        // event_id is the publish idempotency key: a retried append of the
        // same envelope is a no-op that returns no row.
        let row = sqlx::query(
            "INSERT INTO event_log
                 (event_id, topic, event_type, subject_id, user_id, payload,
                  occurred_at, correlation_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (event_id) DO NOTHING
             RETURNING seq",
        )
        .bind(envelope.event_id)
        .bind(topic)
        .bind(envelope.event_type.as_str())
        .bind(envelope.subject_id)
        .bind(envelope.user_id)
        .bind(&envelope.payload)
        .bind(envelope.occurred_at)
        .bind(envelope.correlation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        let Some(row) = row else {
            debug!(
                subsystem = "bus",
                component = "event_log",
                op = "append",
                event_id = %envelope.event_id,
                topic = topic,
                "Duplicate event_id, append skipped"
            );
            return Ok(None);
        };

        Ok(Some(StoredEvent {
            seq: row.get("seq"),
            topic: topic.to_string(),
            envelope: envelope.clone(),
        }))
    }

    async fn load_after(&self, topic: &str, after_seq: i64, limit: i64) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(
            "SELECT seq, topic, event_id, event_type, subject_id, user_id, payload,
                    occurred_at, correlation_id
             FROM event_log
             WHERE topic = $1 AND seq > $2
             ORDER BY seq ASC
             LIMIT $3",
        )
        .bind(topic)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_event_row).collect()
    }

    async fn get_by_event_id(&self, event_id: uuid::Uuid) -> Result<Option<StoredEvent>> {
        let row = sqlx::query(
            "SELECT seq, topic, event_id, event_type, subject_id, user_id, payload,
                    occurred_at, correlation_id
             FROM event_log
             WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_event_row).transpose()
    }
}
