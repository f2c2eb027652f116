//! Per-process registry of live streaming connections.
//!
//! The hub owns every registered connection and fans payloads out to all of
//! them. One failing client never holds up or fails delivery to the others:
//! it is dropped from the registry at once and closed in the background.

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use ulid::Ulid;

/// Upper bound on a single write to one connection.
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);

pub type ConnectionId = Ulid;

/// A duplex client connection the hub can push payloads to.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    async fn send(&self, payload: Bytes) -> Result<()>;

    /// Shuts the connection down. Safe to call any number of times; the
    /// underlying resource is released on the first call only.
    async fn close(&self);
}

#[derive(Clone)]
pub struct ConnectionHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    connections: RwLock<HashMap<ConnectionId, Arc<dyn Connection>>>,
    write_wait: Duration,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::with_write_wait(DEFAULT_WRITE_WAIT)
    }

    pub fn with_write_wait(write_wait: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                connections: RwLock::new(HashMap::new()),
                write_wait,
            }),
        }
    }

    /// Registers a connection. Returns false if it was already registered.
    pub async fn add(&self, connection: Arc<dyn Connection>) -> bool {
        let id = connection.id();
        let mut connections = self.inner.connections.write().await;
        if connections.contains_key(&id) {
            return false;
        }
        connections.insert(id, connection);
        tracing::debug!("Registered connection {} ({} live)", id, connections.len());
        true
    }

    /// Unregisters and closes a connection. No-op for unknown ids.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let removed = {
            let mut connections = self.inner.connections.write().await;
            connections.remove(&id)
        };

        match removed {
            Some(connection) => {
                connection.close().await;
                tracing::debug!("Removed connection {}", id);
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Unregisters and closes every connection. Used on shutdown.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Arc<dyn Connection>> = {
            let mut connections = self.inner.connections.write().await;
            connections.drain().map(|(_, connection)| connection).collect()
        };

        let closed = drained.len();
        futures_util::future::join_all(drained.iter().map(|connection| connection.close())).await;
        tracing::info!("Closed {} connections", closed);
        closed
    }

    /// Sends `payload` to every registered connection and returns how many
    /// accepted it.
    ///
    /// The registry lock is held only long enough to snapshot it; writes run
    /// concurrently, each bounded by the hub's write deadline.
    pub async fn broadcast(&self, payload: Bytes) -> usize {
        let snapshot: Vec<Arc<dyn Connection>> = {
            let connections = self.inner.connections.read().await;
            connections.values().cloned().collect()
        };

        if snapshot.is_empty() {
            return 0;
        }

        let write_wait = self.inner.write_wait;
        let sends = snapshot.into_iter().map(|connection| {
            let payload = payload.clone();
            async move {
                let result = tokio::time::timeout(write_wait, connection.send(payload)).await;
                (connection, result)
            }
        });

        let mut delivered = 0usize;
        for (connection, result) in futures_util::future::join_all(sends).await {
            match result {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(error)) => {
                    tracing::warn!(
                        "Failed to send broadcast to connection {}: {}",
                        connection.id(),
                        error
                    );
                    self.evict(connection.id()).await;
                }
                Err(_) => {
                    tracing::warn!(
                        "Broadcast to connection {} exceeded write deadline of {:?}",
                        connection.id(),
                        write_wait
                    );
                    self.evict(connection.id()).await;
                }
            }
        }

        delivered
    }

    /// Drops a failed connection from the registry at once so later
    /// broadcasts skip it; the close runs in the background since it may
    /// itself wait on the broken peer.
    async fn evict(&self, id: ConnectionId) {
        let removed = self.inner.connections.write().await.remove(&id);
        if let Some(connection) = removed {
            tokio::spawn(async move {
                connection.close().await;
                tracing::debug!("Evicted connection {}", id);
            });
        }
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}
