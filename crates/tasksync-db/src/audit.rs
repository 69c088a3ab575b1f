//! Append-only audit log repository implementation.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use tasksync_core::{AuditRecord, AuditRepository, Envelope, Error, Result};

/// PostgreSQL implementation of [`AuditRepository`].
///
/// `event_id` is the primary key, so a redelivered envelope records nothing.
#[derive(Clone)]
pub struct PgAuditRepository {
    pool: Pool<Postgres>,
}

impl PgAuditRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditRepository for PgAuditRepository {
    async fn record(&self, topic: &str, envelope: &Envelope) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO audit_log
                 (event_id, topic, event_type, subject_id, user_id, payload, occurred_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(envelope.event_id)
        .bind(topic)
        .bind(envelope.event_type.as_str())
        .bind(envelope.subject_id)
        .bind(envelope.user_id)
        .bind(&envelope.payload)
        .bind(envelope.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_for_subject(&self, subject_id: Uuid, limit: i64) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query(
            "SELECT event_id, topic, event_type, subject_id, user_id, payload,
                    occurred_at, recorded_at
             FROM audit_log
             WHERE subject_id = $1
             ORDER BY recorded_at DESC
             LIMIT $2",
        )
        .bind(subject_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|r| AuditRecord {
                event_id: r.get("event_id"),
                topic: r.get("topic"),
                event_type: r.get("event_type"),
                subject_id: r.get("subject_id"),
                user_id: r.get("user_id"),
                payload: r.get("payload"),
                occurred_at: r.get("occurred_at"),
                recorded_at: r.get("recorded_at"),
            })
            .collect())
    }
}
