use super::{Rejection, require_id};
use crate::{LeaderboardRepository, QuizError, Result};

/// A conditional write can only lose to a concurrent join or to an expiry
/// landing between the read and the write; after this many rounds give up.
const MAX_JOIN_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct JoinQuizOperation {
    repository: LeaderboardRepository,
}

#[derive(Debug, Clone)]
pub struct JoinQuizOperationRequest {
    pub user_id: String,
    pub quiz_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinQuizOperationOutcome {
    Joined,
    Rejected(Rejection),
}

impl JoinQuizOperation {
    pub fn new(repository: LeaderboardRepository) -> Self {
        Self { repository }
    }

    /// Moves the user from no quiz to `quiz_id`.
    ///
    /// A user holds at most one membership: joining the same quiz twice or a
    /// second quiz before submitting the first is rejected. The write itself
    /// is first-wins in the store, so concurrent joins from several server
    /// processes cannot both succeed.
    pub async fn run(&self, request: JoinQuizOperationRequest) -> Result<JoinQuizOperationOutcome> {
        let user_id = require_id("user id", &request.user_id)?;
        let quiz_id = require_id("quiz id", &request.quiz_id)?;

        for _ in 0..MAX_JOIN_ATTEMPTS {
            if let Some(current) = self.repository.get_quiz_by_user(user_id).await? {
                return Ok(JoinQuizOperationOutcome::Rejected(classify(&current, quiz_id)));
            }

            if self.repository.join_quiz_if_absent(user_id, quiz_id).await? {
                tracing::info!("User {} joined quiz {}", user_id, quiz_id);
                return Ok(JoinQuizOperationOutcome::Joined);
            }

            tracing::debug!(
                "Concurrent membership change for user {}; re-reading",
                user_id
            );
        }

        Err(QuizError::Transaction(format!(
            "membership for user {} kept changing during join",
            user_id
        )))
    }
}

fn classify(current: &str, requested: &str) -> Rejection {
    if current == requested {
        Rejection::AlreadyJoined {
            quiz_id: requested.to_string(),
        }
    } else {
        Rejection::JoinedAnotherQuiz {
            quiz_id: current.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyLayout, MemoryStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn new_operation(ttl: Duration) -> (JoinQuizOperation, LeaderboardRepository) {
        let repo = LeaderboardRepository::new(Arc::new(MemoryStore::new()), KeyLayout::new("test"))
            .with_membership_ttl(ttl);
        (JoinQuizOperation::new(repo.clone()), repo)
    }

    fn request(user: &str, quiz: &str) -> JoinQuizOperationRequest {
        JoinQuizOperationRequest {
            user_id: user.to_string(),
            quiz_id: quiz.to_string(),
        }
    }

    #[tokio::test]
    async fn test_join_is_exclusive() {
        let (op, repo) = new_operation(Duration::from_secs(60));

        let outcome = op.run(request("user-1", "quiz-1")).await.unwrap();
        assert_eq!(outcome, JoinQuizOperationOutcome::Joined);
        assert_eq!(
            repo.get_quiz_by_user("user-1").await.unwrap().as_deref(),
            Some("quiz-1")
        );

        let again = op.run(request("user-1", "quiz-1")).await.unwrap();
        assert_eq!(
            again,
            JoinQuizOperationOutcome::Rejected(Rejection::AlreadyJoined {
                quiz_id: "quiz-1".to_string()
            })
        );

        let other = op.run(request("user-1", "quiz-2")).await.unwrap();
        assert_eq!(
            other,
            JoinQuizOperationOutcome::Rejected(Rejection::JoinedAnotherQuiz {
                quiz_id: "quiz-1".to_string()
            })
        );

        // Other users are unaffected.
        let outcome = op.run(request("user-2", "quiz-2")).await.unwrap();
        assert_eq!(outcome, JoinQuizOperationOutcome::Joined);
    }

    #[tokio::test]
    async fn test_join_allowed_after_membership_expires() {
        let (op, _repo) = new_operation(Duration::from_millis(20));

        assert_eq!(
            op.run(request("user-1", "quiz-1")).await.unwrap(),
            JoinQuizOperationOutcome::Joined
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            op.run(request("user-1", "quiz-2")).await.unwrap(),
            JoinQuizOperationOutcome::Joined
        );
    }

    #[tokio::test]
    async fn test_concurrent_joins_admit_one() {
        let (op, repo) = new_operation(Duration::from_secs(60));

        let mut tasks = Vec::new();
        for i in 0..16 {
            let op = op.clone();
            tasks.push(tokio::spawn(async move {
                op.run(request("user-1", &format!("quiz-{}", i))).await
            }));
        }

        let mut joined = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() == JoinQuizOperationOutcome::Joined {
                joined += 1;
            }
        }

        assert_eq!(joined, 1);
        assert!(repo.get_quiz_by_user("user-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_join_requires_ids() {
        let (op, _repo) = new_operation(Duration::from_secs(60));

        let result = op.run(request("user-1", "  ")).await;
        assert!(matches!(result, Err(QuizError::InvalidRequest(_))));

        let result = op.run(request("", "quiz-1")).await;
        assert!(matches!(result, Err(QuizError::InvalidRequest(_))));
    }
}
