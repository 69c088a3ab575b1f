//! # tasksync-hub
//!
//! Real-time per-user fan-out.
//!
//! The [`ConnectionRegistry`] tracks live WebSocket connections per user;
//! the [`FanoutHub`] consumer pushes `sync.task_changed` envelopes to the
//! target user's connections only. Socket delivery is best-effort: slow,
//! closed, or silent consumers are dropped rather than allowed to block the
//! rest, and reconnecting clients re-fetch a snapshot instead of replaying
//! backlog through the hub.

pub mod hub;
pub mod registry;

pub use hub::{start_sweeper, start_sweeper_with, FanoutHub, SweeperHandle, FANOUT_GROUP};
pub use registry::ConnectionRegistry;
