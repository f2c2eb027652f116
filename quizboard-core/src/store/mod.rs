//! Shared state store contract and backends
//!
//! The store is the only state shared between server processes: quiz
//! membership (string keys with expiry), the ranked score set and the events
//! channel all live behind [`SharedStore`].

pub mod factory;
pub mod memory;
pub mod redis;

pub use factory::StoreBuilder;
pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;

/// Stream of raw message bodies received on one pub/sub channel.
///
/// Dropping the stream releases the subscription.
pub type Subscription = BoxStream<'static, Vec<u8>>;

/// One step of an atomic multi-key transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TxOp {
    /// Precondition: the batch applies only if the string at `key` currently
    /// holds `value`.
    Expect {
        key: String,
        value: String,
    },
    /// Insert (or re-score) `member` in the score-ordered set at `key`.
    RankedInsert {
        key: String,
        member: Vec<u8>,
        score: f64,
    },
    Delete {
        key: String,
    },
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Backend name, for logs.
    fn backend(&self) -> &'static str;

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Writes `value` only when `key` is absent. Returns whether this call won.
    async fn set_if_absent_with_expiry(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Applies every op or none of them. Returns false, with nothing applied,
    /// when an [`TxOp::Expect`] precondition does not hold.
    async fn exec_atomic(&self, ops: Vec<TxOp>) -> Result<bool>;

    /// Up to `count` members of the ranked set at `key`, highest score first,
    /// skipping the first `offset`. Equal scores are ordered by descending
    /// member bytes.
    async fn range_desc(&self, key: &str, offset: usize, count: usize)
    -> Result<Vec<(Vec<u8>, f64)>>;

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Logical key names under one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    namespace: String,
}

impl KeyLayout {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn membership_key(&self, user_id: &str) -> String {
        format!("{}:user:{}", self.namespace, user_id)
    }

    pub fn scores_key(&self) -> String {
        format!("{}:scores", self.namespace)
    }

    pub fn events_channel(&self) -> String {
        format!("{}:events", self.namespace)
    }
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new("quizboard")
    }
}
