use super::{Rejection, require_id};
use crate::{EventMessage, LeaderboardRepository, QuizError, Result, ScoreEntry};

#[derive(Clone)]
pub struct SubmitQuizOperation {
    repository: LeaderboardRepository,
}

#[derive(Debug, Clone)]
pub struct SubmitQuizOperationRequest {
    pub user_id: String,
    pub quiz_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitQuizOperationOutcome {
    /// The score is ranked and the membership cleared. `published` reports
    /// whether the live update reached the events channel.
    Submitted { entry: ScoreEntry, published: bool },
    Rejected(Rejection),
}

impl SubmitQuizOperation {
    pub fn new(repository: LeaderboardRepository) -> Self {
        Self { repository }
    }

    pub async fn run(
        &self,
        request: SubmitQuizOperationRequest,
    ) -> Result<SubmitQuizOperationOutcome> {
        let user_id = require_id("user id", &request.user_id)?;
        let quiz_id = require_id("quiz id", &request.quiz_id)?;
        if !request.score.is_finite() {
            return Err(QuizError::InvalidRequest(
                "score must be a finite number".to_string(),
            ));
        }

        let current = self.repository.get_quiz_by_user(user_id).await?;
        if current.as_deref() != Some(quiz_id) {
            return Ok(SubmitQuizOperationOutcome::Rejected(Rejection::NotJoined {
                quiz_id: quiz_id.to_string(),
            }));
        }

        let entry = ScoreEntry::new(user_id, quiz_id, request.score);
        if !self.repository.submit_quiz(&entry).await? {
            // Expired, or taken by a concurrent submit, after the read above.
            tracing::info!(
                "Membership of user {} in quiz {} changed before submit committed",
                user_id,
                quiz_id
            );
            return Ok(SubmitQuizOperationOutcome::Rejected(Rejection::NotJoined {
                quiz_id: quiz_id.to_string(),
            }));
        }
        tracing::info!(
            "User {} submitted quiz {} with score {}",
            user_id,
            quiz_id,
            entry.score
        );

        // The transaction above is authoritative; the live update is not.
        let published = match self.publish(&entry).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(
                    "Failed to publish submit event for user {}: {}",
                    user_id,
                    error
                );
                false
            }
        };

        Ok(SubmitQuizOperationOutcome::Submitted { entry, published })
    }

    async fn publish(&self, entry: &ScoreEntry) -> Result<()> {
        let payload = EventMessage::submit_quiz(entry)?.encode()?;
        let channel = self.repository.layout().events_channel();
        self.repository.store().publish(&channel, &payload).await
    }
}
