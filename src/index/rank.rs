//! Rank, window and page reads.
//!
//! A user's rank is computed inside their own bucket only:
//!
//! ```text
//! rank = bucket_id * capacity + offset + 1
//! ```
//!
//! where `offset` is the position of the user's score among the rows of the
//! bucket scored at least as high. Ties share the worst tied position.
//!
//! Reads never repair what they find. Duplicates, overflowing buckets and
//! rows sitting one bucket too low are handed to the maintenance scheduler
//! and the read answers from the state it saw.

use super::bucket::BucketIndex;
use super::dedup::{dedup_latest, reconcile, Reconciled};
use super::rebalance::{is_underfilled, should_promote};
use crate::config::LeaderboardConfig;
use crate::error::Result;
use crate::maintenance::{MaintenanceScheduler, MaintenanceTask};
use crate::store::ScoreStore;
use crate::types::{BucketId, Rank, ScanQuery, ScoreFilter, ScoreRow};
use std::collections::HashSet;
use std::sync::Arc;

/// Answers rank, window and page queries.
#[derive(Clone)]
pub struct RankEngine {
    store: Arc<dyn ScoreStore>,
    index: BucketIndex,
    scheduler: MaintenanceScheduler,
    config: Arc<LeaderboardConfig>,
}

impl RankEngine {
    pub fn new(
        store: Arc<dyn ScoreStore>,
        index: BucketIndex,
        scheduler: MaintenanceScheduler,
        config: Arc<LeaderboardConfig>,
    ) -> Self {
        Self {
            store,
            index,
            scheduler,
            config,
        }
    }

    /// Global rank of a user.
    #[tracing::instrument(skip(self))]
    pub async fn get_rank(&self, slug: &str, user_id: &str) -> Result<Rank> {
        let Some(canonical) = self.canonical_row(slug, user_id).await? else {
            return Ok(Rank::NotRanked);
        };
        let bucket_id = canonical.bucket_id;

        let above = self
            .store
            .scan(
                slug,
                bucket_id,
                ScanQuery::descending().with_filter(ScoreFilter::AtLeast(canonical.score)),
            )
            .await?;
        let offset = above
            .iter()
            .rposition(|row| row.score == canonical.score)
            .unwrap_or(above.len());

        let distinct: HashSet<&str> = above.iter().map(|row| row.user_id.as_str()).collect();
        if distinct.len() < above.len() {
            self.scheduler
                .schedule(slug, MaintenanceTask::CleanBucket { bucket_id });
        }

        let capacity = self.config.bucket_capacity;
        if offset > capacity {
            tracing::debug!(slug, bucket_id, offset, "Bucket over capacity");
            self.scheduler
                .schedule(slug, MaintenanceTask::Rebalance { bucket_id });
        }

        let top_score = above.first().map(|row| row.score);
        if bucket_id > 0 && top_score == Some(canonical.score) {
            let upper_id = bucket_id - 1;
            let upper = self.index.bucket(slug, upper_id).await?;
            let underfilled = is_underfilled(self.store.as_ref(), slug, upper_id, capacity).await?;
            if should_promote(&canonical, top_score, upper.as_ref(), underfilled) {
                self.scheduler.schedule(
                    slug,
                    MaintenanceTask::Promote {
                        user_id: user_id.to_string(),
                    },
                );
            }
        }

        let rank = bucket_id * capacity as u64 + offset as u64 + 1;
        tracing::debug!(slug, user_id, bucket_id, offset, rank, "Computed rank");
        Ok(Rank::Ranked(rank))
    }

    /// The user's row with up to `before` higher and `after` lower rows of the
    /// same bucket, ascending by score. Empty when the user has no row.
    #[tracing::instrument(skip(self))]
    pub async fn get_window(
        &self,
        slug: &str,
        user_id: &str,
        before: usize,
        after: usize,
    ) -> Result<Vec<ScoreRow>> {
        let Some(canonical) = self.canonical_row(slug, user_id).await? else {
            return Ok(Vec::new());
        };
        let bucket_id = canonical.bucket_id;

        let below = self
            .store
            .scan(
                slug,
                bucket_id,
                ScanQuery::descending()
                    .with_filter(ScoreFilter::Below(canonical.score))
                    .with_limit(after),
            )
            .await?;
        let above = self
            .store
            .scan(
                slug,
                bucket_id,
                ScanQuery::ascending()
                    .with_filter(ScoreFilter::AtLeast(canonical.score))
                    .with_limit(before.saturating_add(1)),
            )
            .await?;

        let mut window: Vec<ScoreRow> = below
            .into_iter()
            .chain(above)
            .filter(|row| row.user_id != user_id)
            .collect();
        window.push(canonical);
        window.sort_by(|a, b| a.score.cmp(&b.score).then_with(|| a.user_id.cmp(&b.user_id)));
        Ok(window)
    }

    /// `limit` rows starting at global position `offset`, highest first.
    #[tracing::instrument(skip(self))]
    pub async fn get_page(&self, slug: &str, offset: u64, limit: usize) -> Result<Vec<ScoreRow>> {
        let capacity = self.config.bucket_capacity as u64;
        let bucket_id: BucketId = offset / capacity;
        let within = (offset % capacity) as usize;

        let rows = self
            .store
            .scan(slug, bucket_id, ScanQuery::descending().with_limit(limit.saturating_add(within)))
            .await?;
        let (rows, dropped) = dedup_latest(rows);
        if dropped > 0 {
            self.scheduler
                .schedule(slug, MaintenanceTask::CleanBucket { bucket_id });
        }

        let page: Vec<ScoreRow> = rows.into_iter().skip(within).take(limit).collect();
        if page.len() < limit && bucket_id > 0 {
            // A short page means the bucket above overflowed into ours.
            self.scheduler.schedule(
                slug,
                MaintenanceTask::Rebalance {
                    bucket_id: bucket_id - 1,
                },
            );
        }
        Ok(page)
    }

    /// Most recent row of a user, scheduling cleanup of older ones.
    async fn canonical_row(&self, slug: &str, user_id: &str) -> Result<Option<ScoreRow>> {
        let rows = self
            .store
            .rows_for_user(slug, user_id, self.config.user_lookup_limit)
            .await?;
        let Some(Reconciled { canonical, stale }) = reconcile(rows) else {
            return Ok(None);
        };

        if !stale.is_empty() {
            tracing::debug!(slug, user_id, stale = stale.len(), "Found stale rows for user");
            self.scheduler.schedule(
                slug,
                MaintenanceTask::CleanUser {
                    user_id: user_id.to_string(),
                },
            );
        }
        Ok(Some(canonical))
    }
}

impl std::fmt::Debug for RankEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankEngine")
            .field("bucket_capacity", &self.config.bucket_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::TestBoard;
    use crate::types::{Rank, ScoreRow};

    #[tokio::test]
    async fn test_ties_share_the_worst_position() {
        let tb = TestBoard::new(10).unwrap();
        for (user, score) in [("a", 100), ("b", 90), ("c", 90), ("d", 80)] {
            tb.add(user, score).await.unwrap();
        }

        assert_eq!(tb.rank("a").await.unwrap(), Rank::Ranked(1));
        assert_eq!(tb.rank("b").await.unwrap(), Rank::Ranked(3));
        assert_eq!(tb.rank("c").await.unwrap(), Rank::Ranked(3));
        assert_eq!(tb.rank("d").await.unwrap(), Rank::Ranked(4));
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let tb = TestBoard::new(10).unwrap();
        assert_eq!(tb.rank("nobody").await.unwrap(), Rank::NotRanked);
        assert!(tb.window_scores("nobody", 3, 3).await.unwrap().is_empty());
        assert!(tb.page_scores(0, 10).await.unwrap().is_empty());
        assert_eq!(Rank::NotRanked.to_sentinel(), -1);
    }

    #[tokio::test]
    async fn test_window_around_user() {
        let tb = TestBoard::new(1000).unwrap();
        tb.seed(0..20).await.unwrap();

        let window = tb.window_scores(&TestBoard::user(10), 2, 3).await.unwrap();
        assert_eq!(window, vec![7, 8, 9, 10, 11, 12]);

        // Clipped at the edges of the board.
        let top = tb.window_scores(&TestBoard::user(19), 5, 1).await.unwrap();
        assert_eq!(top, vec![18, 19]);
    }

    #[tokio::test]
    async fn test_pages_across_buckets() {
        let tb = TestBoard::new(10).unwrap();
        tb.seed(0..20).await.unwrap();
        tb.rank(&TestBoard::user(0)).await.unwrap();
        tb.settle().await;

        assert_eq!(tb.page_scores(5, 10).await.unwrap(), vec![14, 13, 12, 11, 10]);
        assert_eq!(tb.page_scores(12, 3).await.unwrap(), vec![7, 6, 5]);

        // A short page below the first bucket asks for a rebalance above it.
        let scheduled = tb.board.metrics().maintenance_scheduled.get();
        assert_eq!(tb.page_scores(10, 20).await.unwrap().len(), 10);
        assert_eq!(tb.board.metrics().maintenance_scheduled.get(), scheduled + 1);
        tb.settle().await;
    }

    #[tokio::test]
    async fn test_overflow_schedules_rebalance() {
        let tb = TestBoard::new(10).unwrap();
        tb.seed(0..11).await.unwrap();

        // Offset 10 is still within capacity.
        tb.rank(&TestBoard::user(0)).await.unwrap();
        assert_eq!(tb.board.metrics().maintenance_scheduled.get(), 0);

        tb.seed(11..12).await.unwrap();
        assert_eq!(tb.rank(&TestBoard::user(0)).await.unwrap(), Rank::Ranked(12));
        assert_eq!(tb.board.metrics().maintenance_scheduled.get(), 1);
        tb.settle().await;
        assert_eq!(tb.bucket_sizes().await.unwrap(), vec![(0, 10), (1, 2)]);
    }

    #[tokio::test]
    async fn test_window_skips_stale_self_rows_and_orders_ties() {
        let tb = TestBoard::new(1000).unwrap();
        tb.seed(0..5).await.unwrap();
        tb.add("zed", 2).await.unwrap();
        tb.add("abc", 2).await.unwrap();

        let user = TestBoard::user(2);
        let mut stale = ScoreRow::new(tb.slug.clone(), 0, user.clone(), 3, 100);
        stale.timestamp_micros = 1;
        tb.insert_raw(&stale).await.unwrap();

        let window = tb.board.get_window(&tb.slug, &user, 5, 2).await.unwrap();
        let entries: Vec<(&str, i64)> = window.iter().map(|r| (r.user_id.as_str(), r.score)).collect();
        assert_eq!(
            entries,
            vec![
                ("user-000000", 0),
                ("user-000001", 1),
                ("abc", 2),
                ("user-000002", 2),
                ("zed", 2),
                ("user-000003", 3),
                ("user-000004", 4),
            ]
        );
        tb.settle().await;
    }

    #[tokio::test]
    async fn test_huge_counts_do_not_overflow() {
        let tb = TestBoard::new(10).unwrap();
        tb.seed(0..5).await.unwrap();

        assert_eq!(tb.page_scores(3, usize::MAX).await.unwrap(), vec![1, 0]);
        let window = tb.window_scores(&TestBoard::user(2), usize::MAX, 1).await.unwrap();
        assert_eq!(window, vec![1, 2, 3, 4]);
        let window = tb.window_scores(&TestBoard::user(2), 0, usize::MAX).await.unwrap();
        assert_eq!(window, vec![0, 1, 2]);
    }
}
