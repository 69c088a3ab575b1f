//! Centralized default constants for the tasksync system.
//!
//! **This module is the single source of truth** for all shared default values.
//! All crates reference these constants instead of defining their own magic
//! numbers.
//!
//! Organized by subsystem. When adding new constants, place them in the
//! appropriate section and document the rationale for the chosen value.

// =============================================================================
// EVENT BUS
// =============================================================================

/// Capacity of each per-topic broadcast channel.
pub const BROKER_CHANNEL_CAPACITY: usize = 256;

/// Maximum envelopes held in the publisher's local retry queue.
///
/// On overflow the oldest `sync.task_changed` envelopes are dropped first
/// (clients recover via snapshot fetch); lifecycle events are kept longest.
pub const PUBLISH_QUEUE_CAPACITY: usize = 1024;

/// Budget for a synchronous publish before the envelope is queued for
/// background retry. The caller is never blocked longer than this.
pub const PUBLISH_TIMEOUT_MS: u64 = 200;

/// Base delay for exponential backoff (publish retry and redelivery).
pub const BACKOFF_BASE_MS: u64 = 500;

/// Ceiling for exponential backoff delays.
pub const BACKOFF_CAP_SECS: u64 = 30;

/// Delivery attempts per envelope before a retryable failure is converted
/// to a dead letter.
pub const CONSUMER_MAX_ATTEMPTS: i32 = 5;

/// Batch size for consumer catch-up reads from the event log.
pub const CATCH_UP_BATCH: i64 = 100;

// =============================================================================
// SCHEDULER
// =============================================================================

/// Fixed polling interval for the due-job claim loop in milliseconds.
///
/// 5s keeps the fire-time error well inside the 60s precision target while
/// bounding idle query load.
pub const SCHEDULER_POLL_INTERVAL_MS: u64 = 5_000;

/// Maximum due jobs claimed per poll cycle.
pub const SCHEDULER_CLAIM_BATCH: i64 = 32;

/// Fire attempts per job before it is marked fired-with-failure.
pub const SCHEDULER_MAX_FIRE_ATTEMPTS: i32 = 5;

/// Age after which a job stuck in `firing` (replica crashed mid-fire) is
/// eligible to be reclaimed by another replica.
pub const FIRING_RECLAIM_SECS: i64 = 600;

// =============================================================================
// FAN-OUT HUB
// =============================================================================

/// Bounded send-queue depth per client connection. A connection whose queue
/// is full is forcibly closed rather than allowed to block the broadcast.
pub const CONNECTION_QUEUE_CAPACITY: usize = 32;

/// A connection with no heartbeat for this long is considered lost.
pub const HEARTBEAT_TIMEOUT_SECS: i64 = 60;

/// Interval of the staleness sweep over the connection registry.
pub const SWEEP_INTERVAL_SECS: u64 = 15;

/// WebSocket server-side ping interval.
pub const WS_PING_INTERVAL_SECS: u64 = 30;

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3000;

/// Timeout for the reminder notification HTTP request.
pub const NOTIFIER_TIMEOUT_SECS: u64 = 10;

/// Default page size for the dead-letter operator listing.
pub const DEAD_LETTER_PAGE_LIMIT: i64 = 50;
