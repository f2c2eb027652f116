use crate::store::{KeyLayout, SharedStore, Subscription};
use crate::{ConnectionHub, EventKind, EventMessage, Result};
use bytes::Bytes;
use futures_util::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// First wait before resubscribing after the subscription stream ended.
pub const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_millis(200);

const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(10);

/// Bridges the fleet-wide events channel into this process's [`ConnectionHub`].
pub struct EventRelay {
    store: Arc<dyn SharedStore>,
    subscription: Subscription,
    channel: String,
    hub: ConnectionHub,
    resubscribe_delay: Duration,
}

impl EventRelay {
    /// Subscribes to the events channel. Messages published from here on are
    /// buffered until [`EventRelay::run_until`] drains them.
    pub async fn subscribe(
        store: Arc<dyn SharedStore>,
        layout: &KeyLayout,
        hub: ConnectionHub,
    ) -> Result<Self> {
        let channel = layout.events_channel();
        let subscription = store.subscribe(&channel).await?;
        tracing::info!("Subscribed to events channel {}", channel);

        Ok(Self {
            store,
            subscription,
            channel,
            hub,
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
        })
    }

    /// Initial backoff after the subscription drops. Doubles on every failed
    /// attempt, up to ten seconds.
    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Forwards events until `shutdown` resolves. Returns how many events
    /// were broadcast.
    ///
    /// Shutdown is checked before every message, so nothing is forwarded once
    /// it has fired. A broadcast that already started runs to completion.
    /// When the subscription stream ends (the store connection dropped) the
    /// relay resubscribes with backoff; events published in the gap are lost.
    pub async fn run_until<F>(self, shutdown: F) -> u64
    where
        F: Future<Output = ()> + Send,
    {
        let EventRelay {
            store,
            mut subscription,
            channel,
            hub,
            resubscribe_delay,
        } = self;
        tokio::pin!(shutdown);

        let mut forwarded = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                message = subscription.next() => {
                    let Some(payload) = message else {
                        tracing::warn!("Subscription to {} ended, resubscribing", channel);
                        let mut delay = resubscribe_delay;
                        loop {
                            let attempt = tokio::select! {
                                biased;
                                _ = &mut shutdown => {
                                    tracing::info!("Event relay on {} shutting down", channel);
                                    return forwarded;
                                }
                                attempt = async {
                                    tokio::time::sleep(delay).await;
                                    store.subscribe(&channel).await
                                } => attempt,
                            };
                            match attempt {
                                Ok(fresh) => {
                                    tracing::info!("Resubscribed to events channel {}", channel);
                                    subscription = fresh;
                                    break;
                                }
                                Err(error) => {
                                    delay = (delay * 2).min(MAX_RESUBSCRIBE_DELAY);
                                    tracing::warn!(
                                        "Resubscribing to {} failed, retrying in {:?}: {}",
                                        channel,
                                        delay,
                                        error
                                    );
                                }
                            }
                        }
                        continue;
                    };
                    if forward(&hub, &payload).await {
                        forwarded += 1;
                    }
                }
            }
        }

        tracing::info!("Event relay on {} shutting down", channel);
        drop(subscription);
        forwarded
    }
}

async fn forward(hub: &ConnectionHub, payload: &[u8]) -> bool {
    let message = match EventMessage::decode(payload) {
        Ok(message) => message,
        Err(error) => {
            tracing::warn!(
                "Skipping malformed event {:?}: {}",
                String::from_utf8_lossy(payload),
                error
            );
            return false;
        }
    };

    match message.event {
        EventKind::SubmitQuizEvent => {
            let delivered = hub
                .broadcast(Bytes::copy_from_slice(message.data_bytes()))
                .await;
            tracing::debug!("Broadcast submit_quiz_event to {} connections", delivered);
            true
        }
        EventKind::Unrecognized => {
            tracing::debug!("Ignoring unrecognized event");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::MockConnection;
    use crate::store::TxOp;
    use crate::{QuizError, ScoreEntry};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn wait_for_received(conn: &MockConnection, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while conn.received().len() < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("relay should deliver events");
    }

    fn submit_event(user: &str, score: f64) -> Vec<u8> {
        EventMessage::submit_quiz(&ScoreEntry::new(user, "quiz-1", score))
            .unwrap()
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn test_relay_survives_malformed_messages() {
        let store = Arc::new(MemoryStore::new());
        let layout = KeyLayout::new("test");
        let hub = ConnectionHub::new();
        let conn = MockConnection::new();
        hub.add(conn.clone()).await;

        let relay = EventRelay::subscribe(store.clone(), &layout, hub.clone())
            .await
            .unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(relay.run_until(async move {
            let _ = shutdown_rx.await;
        }));

        let channel = layout.events_channel();
        store.publish(&channel, b"{broken").await.unwrap();
        store.publish(&channel, &submit_event("user-1", 10.0)).await.unwrap();
        store
            .publish(&channel, br#"{"event":"quiz_started","data":{}}"#)
            .await
            .unwrap();
        store.publish(&channel, &submit_event("user-2", 20.0)).await.unwrap();

        wait_for_received(&conn, 2).await;
        let received = conn.received();
        assert_eq!(
            received[0].as_ref(),
            br#"{"user_id":"user-1","quiz_id":"quiz-1","score":10.0}"#
        );
        assert_eq!(
            received[1].as_ref(),
            br#"{"user_id":"user-2","quiz_id":"quiz-1","score":20.0}"#
        );

        let _ = shutdown_tx.send(());
        let forwarded = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("relay should stop promptly")
            .unwrap();
        assert_eq!(forwarded, 2);
    }

    #[tokio::test]
    async fn test_relay_forwards_nothing_after_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let layout = KeyLayout::new("test");
        let hub = ConnectionHub::new();
        let conn = MockConnection::new();
        hub.add(conn.clone()).await;

        let relay = EventRelay::subscribe(store.clone(), &layout, hub)
            .await
            .unwrap();
        store
            .publish(&layout.events_channel(), &submit_event("user-1", 1.0))
            .await
            .unwrap();

        let forwarded = relay.run_until(async {}).await;
        assert_eq!(forwarded, 0);
        assert!(conn.received().is_empty());
    }

    /// Memory store whose subscriptions end after `messages` deliveries, and
    /// whose resubscribe attempts fail while `refusals` is above zero.
    struct FlappingStore {
        inner: MemoryStore,
        messages: usize,
        refusals: AtomicUsize,
        subscriptions: AtomicUsize,
    }

    impl FlappingStore {
        fn new(messages: usize, refusals: usize) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new(),
                messages,
                refusals: AtomicUsize::new(refusals),
                subscriptions: AtomicUsize::new(0),
            })
        }

        fn subscriptions(&self) -> usize {
            self.subscriptions.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SharedStore for FlappingStore {
        fn backend(&self) -> &'static str {
            "flapping"
        }

        async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
            self.inner.set_with_expiry(key, value, ttl).await
        }

        async fn set_if_absent_with_expiry(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> Result<bool> {
            self.inner.set_if_absent_with_expiry(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn exec_atomic(&self, ops: Vec<TxOp>) -> Result<bool> {
            self.inner.exec_atomic(ops).await
        }

        async fn range_desc(
            &self,
            key: &str,
            offset: usize,
            count: usize,
        ) -> Result<Vec<(Vec<u8>, f64)>> {
            self.inner.range_desc(key, offset, count).await
        }

        async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> Result<Subscription> {
            if self.subscriptions() > 0
                && self
                    .refusals
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(QuizError::StoreUnavailable("connection refused".to_string()));
            }
            let subscription = self.inner.subscribe(channel).await?;
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            Ok(subscription.take(self.messages).boxed())
        }
    }

    async fn wait_for_subscriptions(store: &FlappingStore, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.subscriptions() < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("relay should resubscribe");
    }

    #[tokio::test]
    async fn test_relay_resubscribes_when_subscription_ends() {
        let store = FlappingStore::new(1, 2);
        let layout = KeyLayout::new("test");
        let channel = layout.events_channel();
        let hub = ConnectionHub::new();
        let conn = MockConnection::new();
        hub.add(conn.clone()).await;

        let relay = EventRelay::subscribe(store.clone(), &layout, hub)
            .await
            .unwrap()
            .with_resubscribe_delay(Duration::from_millis(5));
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(relay.run_until(async move {
            let _ = shutdown_rx.await;
        }));

        // Each subscription carries one event, then ends. The first
        // resubscribe is refused twice before it succeeds.
        for (round, user) in ["user-1", "user-2", "user-3"].into_iter().enumerate() {
            wait_for_subscriptions(&store, round + 1).await;
            store.publish(&channel, &submit_event(user, 1.0)).await.unwrap();
            wait_for_received(&conn, round + 1).await;
        }
        assert!(!task.is_finished());

        let _ = shutdown_tx.send(());
        let forwarded = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("relay should stop promptly")
            .unwrap();
        assert_eq!(forwarded, 3);
        assert!(store.subscriptions() >= 3);
    }

    #[tokio::test]
    async fn test_relay_shutdown_interrupts_resubscribe_backoff() {
        let store = FlappingStore::new(0, 0);
        let layout = KeyLayout::new("test");

        let relay = EventRelay::subscribe(store.clone(), &layout, ConnectionHub::new())
            .await
            .unwrap()
            .with_resubscribe_delay(Duration::from_secs(3600));
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(relay.run_until(async move {
            let _ = shutdown_rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        let _ = shutdown_tx.send(());
        let forwarded = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("shutdown should cut the backoff short")
            .unwrap();
        assert_eq!(forwarded, 0);
        assert_eq!(store.subscriptions(), 1);
    }
}
