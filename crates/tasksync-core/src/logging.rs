//! Structured logging schema and field name constants for tasksync.
//!
//! All crates use these constants for consistent structured logging fields so
//! log aggregation tools can query by standardized field names across every
//! subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), operation completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration, high-volume data (deliveries, pushes) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Correlation ID propagated end-to-end across publish → consume → republish.
/// Format: UUIDv7 (time-ordered).
pub const CORRELATION_ID: &str = "correlation_id";

/// Subsystem originating the log event.
/// Values: "bus", "scheduler", "consumers", "hub", "db", "server"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "publisher", "subscriber", "registry", "pool"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "publish", "deliver", "claim_due", "broadcast"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Envelope UUID being published or delivered.
pub const EVENT_ID: &str = "event_id";

/// Dot-namespaced envelope type (e.g. "task.completed").
pub const EVENT_TYPE: &str = "event_type";

/// Topic the envelope travels on.
pub const TOPIC: &str = "topic";

/// Consumer group processing the envelope.
pub const CONSUMER_GROUP: &str = "group";

/// Scheduled job identifier (caller-supplied idempotency key).
pub const JOB_ID: &str = "job_id";

/// Owning user UUID (the fan-out routing key).
pub const USER_ID: &str = "user_id";

/// Realtime connection UUID.
pub const CONNECTION_ID: &str = "connection_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Event-log sequence number.
pub const SEQ: &str = "seq";

/// Delivery or fire attempt number (1-based).
pub const ATTEMPT: &str = "attempt";

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of connections reached by a broadcast.
pub const DELIVERED: &str = "delivered";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
