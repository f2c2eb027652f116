use crate::{LeaderboardRepository, Result, ScoreEntry};

#[derive(Clone)]
pub struct ListScoresOperation {
    repository: LeaderboardRepository,
}

#[derive(Debug, Clone, Default)]
pub struct ListScoresOperationRequest {
    pub from: i64,
    pub limit: i64,
}

impl ListScoresOperation {
    pub fn new(repository: LeaderboardRepository) -> Self {
        Self { repository }
    }

    pub async fn run(&self, request: ListScoresOperationRequest) -> Result<Vec<ScoreEntry>> {
        self.repository
            .list_scores(request.from, request.limit)
            .await
    }
}
