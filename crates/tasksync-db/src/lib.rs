//! # tasksync-db
//!
//! PostgreSQL persistence layer for tasksync.
//!
//! This crate provides:
//! - Connection pool management
//! - The durable event log backing the bus
//! - Consumer group cursors
//! - The scheduled job table (reminders)
//! - Recurrence occurrence bookkeeping, audit log, dead letters
//!
//! ## Example
//!
//! ```rust,ignore
//! use tasksync_db::Database;
//! use tasksync_core::{Envelope, EventStore, EventType, TOPIC_TASK_EVENTS};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/tasksync").await?;
//!
//!     let envelope = Envelope::new(
//!         EventType::TaskCreated,
//!         uuid::Uuid::new_v4(),
//!         uuid::Uuid::new_v4(),
//!         serde_json::json!({"title": "Buy milk"}),
//!     );
//!     let stored = db.events.append(TOPIC_TASK_EVENTS, &envelope).await?;
//!     println!("Appended at seq {:?}", stored.map(|s| s.seq));
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod dead_letters;
pub mod events;
pub mod occurrences;
pub mod offsets;
pub mod pool;
pub mod scheduled_jobs;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use tasksync_core::*;

// Re-export repository implementations
pub use audit::PgAuditRepository;
pub use dead_letters::PgDeadLetterRepository;
pub use events::PgEventStore;
pub use occurrences::PgOccurrenceRepository;
pub use offsets::PgOffsetStore;
pub use pool::{create_pool, create_pool_with_config, PoolConfig};
pub use scheduled_jobs::PgScheduledJobRepository;

/// Combined database context with all repositories.
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Durable event log.
    pub events: PgEventStore,
    /// Consumer group cursors.
    pub offsets: PgOffsetStore,
    /// Scheduled jobs (reminders).
    pub jobs: PgScheduledJobRepository,
    /// Generated recurrence occurrences.
    pub occurrences: PgOccurrenceRepository,
    /// Append-only audit log.
    pub audit: PgAuditRepository,
    /// Dead-lettered envelopes.
    pub dead_letters: PgDeadLetterRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            events: PgEventStore::new(pool.clone()),
            offsets: PgOffsetStore::new(pool.clone()),
            jobs: PgScheduledJobRepository::new(pool.clone()),
            occurrences: PgOccurrenceRepository::new(pool.clone()),
            audit: PgAuditRepository::new(pool.clone()),
            dead_letters: PgDeadLetterRepository::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
