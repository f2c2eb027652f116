use super::{SharedStore, Subscription, TxOp};
use crate::{QuizError, Result};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;

/// Capacity of each in-process channel. Slow subscribers that fall further
/// behind skip messages.
const CHANNEL_CAPACITY: usize = 1024;

/// In-process store with the same contract as the Redis backend.
///
/// All keyed state sits behind one mutex, which is what makes
/// [`SharedStore::exec_atomic`] atomic here. Pub/sub only reaches
/// subscribers in the same process.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

#[derive(Default)]
struct MemoryState {
    strings: HashMap<String, StringValue>,
    ranked: HashMap<String, RankedSet>,
}

struct StringValue {
    value: String,
    expires_at: Instant,
}

impl StringValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

impl MemoryState {
    fn live_string(&mut self, key: &str) -> Option<&StringValue> {
        let now = Instant::now();
        if self.strings.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.strings.remove(key);
        }
        self.strings.get(key)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            channels: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Score-ordered set kept in rank order, so a page costs `offset + count`
/// steps instead of a sort of the whole set.
#[derive(Default)]
struct RankedSet {
    scores: HashMap<Vec<u8>, f64>,
    order: BTreeSet<RankKey>,
}

impl RankedSet {
    fn insert(&mut self, member: Vec<u8>, score: f64) {
        if let Some(previous) = self.scores.insert(member.clone(), score) {
            self.order.remove(&RankKey {
                score: previous,
                member: member.clone(),
            });
        }
        self.order.insert(RankKey { score, member });
    }

    fn page(&self, offset: usize, count: usize) -> Vec<(Vec<u8>, f64)> {
        self.order
            .iter()
            .skip(offset)
            .take(count)
            .map(|key| (key.member.clone(), key.score))
            .collect()
    }
}

struct RankKey {
    score: f64,
    member: Vec<u8>,
}

/// Highest score first; equal scores by descending member bytes, matching
/// Redis `ZREVRANGE`.
impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| other.member.cmp(&self.member))
    }
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RankKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RankKey {}

#[async_trait]
impl SharedStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        state.strings.insert(
            key.to_string(),
            StringValue {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.live_string(key).is_some() {
            return Ok(false);
        }

        state.strings.insert(
            key.to_string(),
            StringValue {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        Ok(state.live_string(key).map(|entry| entry.value.clone()))
    }

    async fn exec_atomic(&self, ops: Vec<TxOp>) -> Result<bool> {
        // Validate everything before touching state so a bad op leaves no trace.
        for op in &ops {
            if let TxOp::RankedInsert { key, score, .. } = op {
                if !score.is_finite() {
                    return Err(QuizError::Transaction(format!(
                        "score for {} is not a finite number",
                        key
                    )));
                }
            }
        }

        let mut state = self.state.lock().await;
        for op in &ops {
            if let TxOp::Expect { key, value } = op {
                let current = state.live_string(key).map(|entry| entry.value.as_str());
                if current != Some(value.as_str()) {
                    return Ok(false);
                }
            }
        }

        for op in ops {
            match op {
                TxOp::Expect { .. } => {}
                TxOp::RankedInsert { key, member, score } => {
                    state.ranked.entry(key).or_default().insert(member, score);
                }
                TxOp::Delete { key } => {
                    state.strings.remove(&key);
                    state.ranked.remove(&key);
                }
            }
        }

        Ok(true)
    }

    async fn range_desc(
        &self,
        key: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<(Vec<u8>, f64)>> {
        let state = self.state.lock().await;
        Ok(state
            .ranked
            .get(key)
            .map(|set| set.page(offset, count))
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let channels = self.channels.lock().await;
        if let Some(sender) = channels.get(channel) {
            // No live receivers is not an error, same as PUBLISH returning 0.
            let _ = sender.send(payload.to_vec());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let receiver = {
            let mut channels = self.channels.lock().await;
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let channel = channel.to_string();
        let stream = futures_util::stream::unfold(receiver, move |mut receiver| {
            let channel = channel.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => return Some((payload, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                "Subscriber on {} lagged, skipped {} messages",
                                channel,
                                skipped
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
