use crate::store::{KeyLayout, SharedStore, TxOp};
use crate::{QuizError, Result, ScoreEntry};
use std::sync::Arc;
use std::time::Duration;

/// Abandoned quiz sessions clear themselves after this long.
pub const DEFAULT_MEMBERSHIP_TTL: Duration = Duration::from_secs(60 * 60);

/// Page size used when a caller asks for a non-positive limit.
pub const DEFAULT_PAGE_SIZE: i64 = 10;

/// Quiz membership and ranked scores on top of a [`SharedStore`].
#[derive(Clone)]
pub struct LeaderboardRepository {
    store: Arc<dyn SharedStore>,
    layout: KeyLayout,
    membership_ttl: Duration,
}

impl LeaderboardRepository {
    pub fn new(store: Arc<dyn SharedStore>, layout: KeyLayout) -> Self {
        Self {
            store,
            layout,
            membership_ttl: DEFAULT_MEMBERSHIP_TTL,
        }
    }

    pub fn with_membership_ttl(mut self, ttl: Duration) -> Self {
        self.membership_ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// Records `user_id` as playing `quiz_id`, replacing any current membership.
    ///
    /// Exclusivity is the session protocol's job; see
    /// [`crate::JoinQuizOperation`].
    pub async fn join_quiz(&self, user_id: &str, quiz_id: &str) -> Result<()> {
        self.store
            .set_with_expiry(
                &self.layout.membership_key(user_id),
                quiz_id,
                self.membership_ttl,
            )
            .await
    }

    /// Records the membership only if the user has none. Returns whether the
    /// write happened.
    pub async fn join_quiz_if_absent(&self, user_id: &str, quiz_id: &str) -> Result<bool> {
        self.store
            .set_if_absent_with_expiry(
                &self.layout.membership_key(user_id),
                quiz_id,
                self.membership_ttl,
            )
            .await
    }

    pub async fn get_quiz_by_user(&self, user_id: &str) -> Result<Option<String>> {
        self.store
            .get(&self.layout.membership_key(user_id))
            .await
    }

    /// Clears the user's membership and ranks the entry in one transaction.
    ///
    /// The transaction only applies while the user still holds a membership
    /// for `entry.quiz_id`; otherwise nothing changes and this returns false.
    pub async fn submit_quiz(&self, entry: &ScoreEntry) -> Result<bool> {
        if !entry.score.is_finite() {
            return Err(QuizError::InvalidRequest(
                "score must be a finite number".to_string(),
            ));
        }

        let member = entry.encode()?;
        let membership_key = self.layout.membership_key(&entry.user_id);
        self.store
            .exec_atomic(vec![
                TxOp::Expect {
                    key: membership_key.clone(),
                    value: entry.quiz_id.clone(),
                },
                TxOp::RankedInsert {
                    key: self.layout.scores_key(),
                    member,
                    score: entry.score,
                },
                TxOp::Delete {
                    key: membership_key,
                },
            ])
            .await
    }

    /// A page of the leaderboard, highest score first.
    ///
    /// `from` below zero reads from the top; a `limit` of zero or less uses
    /// [`DEFAULT_PAGE_SIZE`]. Entries that fail to decode are skipped and the
    /// ranked score wins over the score embedded in the entry.
    pub async fn list_scores(&self, from: i64, limit: i64) -> Result<Vec<ScoreEntry>> {
        let from = from.max(0);
        let limit = if limit <= 0 { DEFAULT_PAGE_SIZE } else { limit };

        let offset = usize::try_from(from).unwrap_or(usize::MAX);
        let count = usize::try_from(limit).unwrap_or(usize::MAX);

        let members = self
            .store
            .range_desc(&self.layout.scores_key(), offset, count)
            .await?;

        let mut entries = Vec::with_capacity(members.len());
        for (member, score) in members {
            match ScoreEntry::decode(&member) {
                Ok(mut entry) => {
                    entry.score = score;
                    entries.push(entry);
                }
                Err(error) => {
                    tracing::warn!(
                        "Skipping malformed leaderboard entry {:?}: {}",
                        String::from_utf8_lossy(&member),
                        error
                    );
                }
            }
        }

        Ok(entries)
    }
}
