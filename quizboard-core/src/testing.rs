//! Test doubles shared by the unit tests.

use crate::{Connection, ConnectionId, QuizError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ulid::Ulid;

pub(crate) struct MockConnection {
    id: ConnectionId,
    broken: bool,
    stuck: bool,
    close_delay: Option<Duration>,
    released: AtomicBool,
    releases: AtomicUsize,
    received: Mutex<Vec<Bytes>>,
}

impl MockConnection {
    fn build(broken: bool, stuck: bool, close_delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            id: Ulid::new(),
            broken,
            stuck,
            close_delay,
            released: AtomicBool::new(false),
            releases: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn new() -> Arc<Self> {
        Self::build(false, false, None)
    }

    /// A connection whose peer already went away.
    pub(crate) fn closed() -> Arc<Self> {
        Self::build(true, false, None)
    }

    /// A connection whose writes never complete.
    pub(crate) fn stuck() -> Arc<Self> {
        Self::build(false, true, None)
    }

    /// A broken connection whose close takes `delay` to complete.
    pub(crate) fn slow_closing(delay: Duration) -> Arc<Self> {
        Self::build(true, false, Some(delay))
    }

    pub(crate) fn received(&self) -> Vec<Bytes> {
        self.received.lock().unwrap().clone()
    }

    pub(crate) fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        if self.stuck {
            std::future::pending::<()>().await;
        }
        if self.broken || self.released.load(Ordering::SeqCst) {
            return Err(QuizError::Connection("broken pipe".to_string()));
        }
        self.received.lock().unwrap().push(payload);
        Ok(())
    }

    async fn close(&self) {
        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }
        if !self.released.swap(true, Ordering::SeqCst) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Waits for a background close to release `conn`.
pub(crate) async fn wait_for_release(conn: &MockConnection) {
    let released = tokio::time::timeout(Duration::from_secs(2), async {
        while conn.release_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "connection {} was never closed", conn.id);
    assert_eq!(conn.release_count(), 1);
}
