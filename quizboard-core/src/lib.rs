//! Quizboard Core - live quiz leaderboard with fleet-wide score fan-out
//!
//! - A shared state store (Redis, or in-process memory) holding quiz
//!   membership, the ranked score set and the events channel
//! - A per-process connection hub that fans events out to live sockets
//! - An event relay bridging the shared channel into the local hub
//! - Join/submit operations enforcing one active quiz per user

pub mod error;
pub mod hub;
pub mod model;
pub mod operations;
pub mod relay;
pub mod repository;
pub mod store;

#[cfg(test)]
mod testing;

pub use error::{QuizError, Result};
pub use hub::{Connection, ConnectionHub, ConnectionId, DEFAULT_WRITE_WAIT};
pub use model::{EventKind, EventMessage, ScoreEntry};
pub use operations::{
    JoinQuizOperation, JoinQuizOperationOutcome, JoinQuizOperationRequest, ListScoresOperation,
    ListScoresOperationRequest, Rejection, SubmitQuizOperation, SubmitQuizOperationOutcome,
    SubmitQuizOperationRequest,
};
pub use relay::{DEFAULT_RESUBSCRIBE_DELAY, EventRelay};
pub use repository::{DEFAULT_MEMBERSHIP_TTL, DEFAULT_PAGE_SIZE, LeaderboardRepository};
pub use store::{
    KeyLayout, MemoryStore, RedisStore, SharedStore, StoreBuilder, Subscription, TxOp,
};
