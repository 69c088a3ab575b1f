//! Connection registry: who is connected, and how to reach them.
//!
//! Indexed by user so cross-user leakage is structurally impossible; a
//! broadcast can only ever see the target user's bucket. Each connection
//! owns a bounded outbound queue; a consumer that stops draining it gets
//! forcibly deregistered rather than blocking anyone else.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tasksync_core::{defaults, new_v7};

struct Connection {
    sender: mpsc::Sender<String>,
    last_seen: DateTime<Utc>,
}

/// Shared registry of live per-user connections.
///
/// Always injected, never a global: the WebSocket layer, the fan-out
/// consumer, and the staleness sweeper all hold clones of one `Arc`.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, HashMap<Uuid, Connection>>>,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_queue_capacity(defaults::CONNECTION_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            queue_capacity,
        }
    }

    /// Register a new connection for a user.
    ///
    /// Returns the connection id and the receive side of its outbound queue;
    /// the WebSocket writer task drains the receiver.
    pub async fn register(&self, user_id: Uuid) -> (Uuid, mpsc::Receiver<String>) {
        let connection_id = new_v7();
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let mut connections = self.connections.write().await;
        connections.entry(user_id).or_default().insert(
            connection_id,
            Connection {
                sender: tx,
                last_seen: Utc::now(),
            },
        );

        info!(
            subsystem = "hub",
            component = "registry",
            user_id = %user_id,
            connection_id = %connection_id,
            "Connection registered"
        );
        (connection_id, rx)
    }

    /// Remove a connection. Returns whether it was present.
    pub async fn deregister(&self, user_id: Uuid, connection_id: Uuid) -> bool {
        let mut connections = self.connections.write().await;
        let Some(user_conns) = connections.get_mut(&user_id) else {
            return false;
        };
        let removed = user_conns.remove(&connection_id).is_some();
        if user_conns.is_empty() {
            connections.remove(&user_id);
        }
        if removed {
            info!(
                subsystem = "hub",
                component = "registry",
                user_id = %user_id,
                connection_id = %connection_id,
                "Connection deregistered"
            );
        }
        removed
    }

    /// Refresh a connection's liveness (client heartbeat frame).
    pub async fn heartbeat(&self, user_id: Uuid, connection_id: Uuid) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections
            .get_mut(&user_id)
            .and_then(|c| c.get_mut(&connection_id))
        {
            conn.last_seen = Utc::now();
        }
    }

    /// Push a payload to every live connection of one user.
    ///
    /// Non-blocking: a full or closed queue forcibly deregisters that
    /// connection and the rest still get the payload. Returns how many
    /// connections accepted it.
    pub async fn broadcast_to_user(&self, user_id: Uuid, payload: &str) -> usize {
        let mut connections = self.connections.write().await;
        let Some(user_conns) = connections.get_mut(&user_id) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (connection_id, conn) in user_conns.iter() {
            match conn.sender.try_send(payload.to_string()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        subsystem = "hub",
                        component = "registry",
                        user_id = %user_id,
                        connection_id = %connection_id,
                        error = %e,
                        "Outbound queue rejected payload, dropping connection"
                    );
                    dead.push(*connection_id);
                }
            }
        }
        for connection_id in dead {
            user_conns.remove(&connection_id);
        }
        if user_conns.is_empty() {
            connections.remove(&user_id);
        }
        delivered
    }

    /// Drop connections whose last heartbeat is older than `timeout`.
    /// Returns how many were removed.
    pub async fn sweep_stale(&self, timeout: Duration) -> usize {
        let cutoff = Utc::now() - timeout;
        let mut connections = self.connections.write().await;
        let mut removed = 0;

        connections.retain(|user_id, user_conns| {
            user_conns.retain(|connection_id, conn| {
                let live = conn.last_seen >= cutoff;
                if !live {
                    debug!(
                        subsystem = "hub",
                        component = "registry",
                        user_id = %user_id,
                        connection_id = %connection_id,
                        "Sweeping stale connection"
                    );
                    removed += 1;
                }
                live
            });
            !user_conns.is_empty()
        });
        removed
    }

    /// Total live connections across all users.
    pub async fn connection_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .map(HashMap::len)
            .sum()
    }

    /// Users with at least one live connection.
    pub async fn user_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
