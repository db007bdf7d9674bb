//! Testing utilities for the leaderboard index.
//!
//! [`TestBoard`] wires a [`Leaderboard`] over an [`InMemoryStore`] with
//! settings suited to tests: small buckets, fast retries. Faults are injected
//! through the store:
//!
//! ```rust,ignore
//! let tb = TestBoard::new(10)?;
//! tb.seed(0..25).await?;
//!
//! tb.store.fail_writes_after(Some(3));
//! tb.rank(&TestBoard::user(0)).await?;   // schedules a rebalance that fails
//! tb.settle().await;
//! assert_eq!(tb.board.scheduler().dead_letters().len(), 1);
//! ```


use crate::config::{LeaderboardConfig, MaintenanceConfig};
use crate::error::Result;
use crate::leaderboard::Leaderboard;
use crate::store::{InMemoryStore, ScoreStore};
use crate::types::{AddOutcome, BucketId, Rank, ScoreRow, ScoreSubmission};
use std::sync::Arc;
use std::time::Duration;

/// A leaderboard over an in-memory store, scoped to one board.
#[derive(Debug)]
pub struct TestBoard {
    pub store: Arc<InMemoryStore>,
    pub board: Leaderboard,
    pub slug: String,
}

impl TestBoard {
    /// Create a test board with the given bucket capacity.
    pub fn new(bucket_capacity: usize) -> Result<Self> {
        Self::with_config(Self::config(bucket_capacity))
    }

    /// Create a test board with a custom configuration.
    pub fn with_config(config: LeaderboardConfig) -> Result<Self> {
        let store = Arc::new(InMemoryStore::new());
        let board = Leaderboard::new(store.clone(), config)?;
        Ok(Self {
            store,
            board,
            slug: "test-board".to_string(),
        })
    }

    /// Configuration used by [`TestBoard::new`].
    pub fn config(bucket_capacity: usize) -> LeaderboardConfig {
        LeaderboardConfig::new()
            .with_bucket_capacity(bucket_capacity)
            .with_dedup_scan_limit(bucket_capacity.max(1000) * 2)
            .with_maintenance_config(
                MaintenanceConfig::default()
                    .with_move_concurrency(8)
                    .with_retry_backoff(Duration::from_millis(1)),
            )
    }

    /// User id whose lexical order matches the numeric order of `n`.
    pub fn user(n: i64) -> String {
        format!("user-{n:06}")
    }

    /// Add one user per score, named after the score.
    pub async fn seed(&self, scores: impl IntoIterator<Item = i64>) -> Result<()> {
        for score in scores {
            self.add(&Self::user(score), score).await?;
        }
        Ok(())
    }

    /// Add a plain score.
    pub async fn add(&self, user_id: &str, score: i64) -> Result<AddOutcome> {
        self.submit(ScoreSubmission::new(user_id, score, 100)).await
    }

    /// Add a submission.
    pub async fn submit(&self, submission: ScoreSubmission) -> Result<AddOutcome> {
        self.board.add_score(&self.slug, submission).await
    }

    pub async fn rank(&self, user_id: &str) -> Result<Rank> {
        self.board.get_rank(&self.slug, user_id).await
    }

    /// Scores of a page, highest first.
    pub async fn page_scores(&self, offset: u64, limit: usize) -> Result<Vec<i64>> {
        let rows = self.board.get_page(&self.slug, offset, limit).await?;
        Ok(rows.into_iter().map(|row| row.score).collect())
    }

    /// Scores of a window, ascending.
    pub async fn window_scores(&self, user_id: &str, before: usize, after: usize) -> Result<Vec<i64>> {
        let rows = self.board.get_window(&self.slug, user_id, before, after).await?;
        Ok(rows.into_iter().map(|row| row.score).collect())
    }

    /// All rows of a user, including stale ones.
    pub async fn rows_of(&self, user_id: &str) -> Result<Vec<ScoreRow>> {
        self.store.rows_for_user(&self.slug, user_id, 100).await
    }

    /// Write a row directly, bypassing the index.
    pub async fn insert_raw(&self, row: &ScoreRow) -> Result<()> {
        self.store
            .insert(row, self.board.config().write_durability, None)
            .await
    }

    /// Live row count of every bucket record of the board, by bucket id.
    pub async fn bucket_sizes(&self) -> Result<Vec<(BucketId, usize)>> {
        let buckets = self.board.index().buckets(&self.slug).await?;
        Ok(buckets
            .iter()
            .map(|b| (b.bucket_id, self.store.bucket_len(&self.slug, b.bucket_id)))
            .collect())
    }

    /// Wait for background maintenance to drain.
    pub async fn settle(&self) {
        self.board.wait_for_maintenance().await;
    }
}
