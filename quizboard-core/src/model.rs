use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// A finalized submission: one user, one quiz, one score.
///
/// The JSON encoding of an entry doubles as its member in the ranked score
/// set, so field order and names are part of the storage format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub user_id: String,
    pub quiz_id: String,
    pub score: f64,
}

impl ScoreEntry {
    pub fn new(user_id: impl Into<String>, quiz_id: impl Into<String>, score: f64) -> Self {
        Self {
            user_id: user_id.into(),
            quiz_id: quiz_id.into(),
            score,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Kinds of events carried on the shared events channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SubmitQuizEvent,
    /// Any kind this process does not know how to handle.
    #[serde(other)]
    Unrecognized,
}

/// Envelope published on the events channel: `{"event": .., "data": ..}`.
///
/// `data` is kept as raw JSON so relays can forward it byte-for-byte.
#[derive(Debug, Serialize, Deserialize)]
pub struct EventMessage {
    pub event: EventKind,
    pub data: Box<RawValue>,
}

impl EventMessage {
    pub fn submit_quiz(entry: &ScoreEntry) -> Result<Self> {
        Ok(Self {
            event: EventKind::SubmitQuizEvent,
            data: serde_json::value::to_raw_value(entry)?,
        })
    }

    pub fn data_bytes(&self) -> &[u8] {
        self.data.get().as_bytes()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
