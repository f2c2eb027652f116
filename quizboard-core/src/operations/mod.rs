pub mod join_quiz;
pub mod list_scores;
pub mod submit_quiz;

pub use join_quiz::{JoinQuizOperation, JoinQuizOperationOutcome, JoinQuizOperationRequest};
pub use list_scores::{ListScoresOperation, ListScoresOperationRequest};
pub use submit_quiz::{SubmitQuizOperation, SubmitQuizOperationOutcome, SubmitQuizOperationRequest};

use crate::{QuizError, Result};
use std::fmt;

/// Why the session protocol turned a request down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The user is already playing this quiz.
    AlreadyJoined { quiz_id: String },
    /// The user is playing a different quiz.
    JoinedAnotherQuiz { quiz_id: String },
    /// The user is not playing the quiz they tried to submit.
    NotJoined { quiz_id: String },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::AlreadyJoined { .. } => write!(f, "user already joined quiz"),
            Rejection::JoinedAnotherQuiz { .. } => write!(f, "user already joined another quiz"),
            Rejection::NotJoined { .. } => write!(f, "user did not join quiz"),
        }
    }
}

fn require_id<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(QuizError::InvalidRequest(format!("{} is required", field)));
    }
    Ok(trimmed)
}
