//! Score writes.

use super::bucket::BucketIndex;
use super::dedup::{reconcile, Reconciled};
use super::rebalance::Rebalancer;
use crate::config::LeaderboardConfig;
use crate::error::Result;
use crate::maintenance::{MaintenanceScheduler, MaintenanceTask};
use crate::store::ScoreStore;
use crate::types::{AddOptions, AddOutcome, BucketId, ScanQuery, ScoreRow};
use std::sync::Arc;

/// Decides what a submitted score does to the board and writes it.
///
/// A user is meant to own exactly one row per board. Replacing a score is an
/// insert followed by a delete of the old row, so readers may briefly see both;
/// the most recent row always wins.
#[derive(Clone)]
pub struct ScoreRegistry {
    store: Arc<dyn ScoreStore>,
    index: BucketIndex,
    rebalancer: Rebalancer,
    scheduler: MaintenanceScheduler,
    config: Arc<LeaderboardConfig>,
}

impl ScoreRegistry {
    pub fn new(
        store: Arc<dyn ScoreStore>,
        index: BucketIndex,
        rebalancer: Rebalancer,
        scheduler: MaintenanceScheduler,
        config: Arc<LeaderboardConfig>,
    ) -> Self {
        Self {
            store,
            index,
            rebalancer,
            scheduler,
            config,
        }
    }

    /// Record a score for a user.
    #[tracing::instrument(skip(self, options))]
    pub async fn add_score(
        &self,
        slug: &str,
        user_id: &str,
        score: i64,
        confidence: u8,
        options: AddOptions,
    ) -> Result<AddOutcome> {
        let rows = self
            .store
            .rows_for_user(slug, user_id, self.config.user_lookup_limit)
            .await?;

        let Some(Reconciled { canonical: current, stale }) = reconcile(rows) else {
            let bucket = self.index.resolve_bucket(slug, score).await?;
            let row = ScoreRow::new(slug, bucket.bucket_id, user_id, score, confidence);
            self.store
                .insert(&row, self.config.write_durability, options.ttl)
                .await?;

            tracing::debug!(slug, user_id, score, bucket_id = bucket.bucket_id, "Inserted first score");
            return Ok(AddOutcome::Inserted {
                bucket_id: bucket.bucket_id,
            });
        };

        if !stale.is_empty() {
            self.scheduler.schedule(
                slug,
                MaintenanceTask::CleanUser {
                    user_id: user_id.to_string(),
                },
            );
        }

        if current.score == score && current.confidence == confidence {
            return Ok(AddOutcome::Unchanged);
        }

        if options.high_score_only && score < current.score {
            tracing::debug!(slug, user_id, score, current = current.score, "Rejected lower score");
            return Ok(AddOutcome::Rejected);
        }

        // New row first, old row second: a failure in between leaves a
        // duplicate, never a user without a score.
        let row = ScoreRow::new(slug, current.bucket_id, user_id, score, confidence);
        self.store
            .insert(&row, self.config.write_durability, options.ttl)
            .await?;
        if row.key() != current.key() {
            self.store
                .delete(&current.key(), self.config.write_durability)
                .await?;
        }

        let moved_to = self.cross_boundary(&row, current.score).await?;

        tracing::debug!(
            slug,
            user_id,
            score,
            previous = current.score,
            bucket_id = current.bucket_id,
            moved_to = ?moved_to,
            "Updated score"
        );
        Ok(AddOutcome::Updated {
            bucket_id: current.bucket_id,
            moved_to,
        })
    }

    /// Move an updated row into the neighbouring bucket when its new score
    /// passed that bucket's nearest row. At most one bucket per update.
    async fn cross_boundary(&self, row: &ScoreRow, previous: i64) -> Result<Option<BucketId>> {
        let slug = row.slug.as_str();
        let bucket_id = row.bucket_id;

        let target = if row.score < previous {
            let below = bucket_id + 1;
            let top = self
                .store
                .scan(slug, below, ScanQuery::descending().with_limit(1))
                .await?;
            top.first()
                .filter(|neighbour| row.score <= neighbour.score)
                .map(|_| below)
        } else if row.score > previous && bucket_id > 0 {
            let above = bucket_id - 1;
            let bottom = self
                .store
                .scan(slug, above, ScanQuery::ascending().with_limit(1))
                .await?;
            bottom
                .first()
                .filter(|neighbour| row.score >= neighbour.score)
                .map(|_| above)
        } else {
            None
        };

        let Some(target) = target else {
            return Ok(None);
        };

        self.rebalancer.move_row(row, target).await?;
        if target < bucket_id {
            // The bucket above grew by one row.
            self.scheduler
                .schedule(slug, MaintenanceTask::Rebalance { bucket_id: target });
        }
        Ok(Some(target))
    }
}

impl std::fmt::Debug for ScoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoreRegistry")
            .field("write_durability", &self.config.write_durability)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::TestBoard;
    use crate::types::{AddOutcome, Durability, Rank, ScoreSubmission};

    #[tokio::test]
    async fn test_first_score_creates_bucket() {
        let tb = TestBoard::new(10).unwrap();
        assert_eq!(tb.add("alice", 42).await.unwrap(), AddOutcome::Inserted { bucket_id: 0 });

        let buckets = tb.board.index().buckets(&tb.slug).await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(tb.rank("alice").await.unwrap(), Rank::Ranked(1));
    }

    #[tokio::test]
    async fn test_update_replaces_row() {
        let tb = TestBoard::new(10).unwrap();
        tb.seed(0..10).await.unwrap();

        let user = TestBoard::user(0);
        let outcome = tb.add(&user, 100).await.unwrap();
        assert_eq!(outcome, AddOutcome::Updated { bucket_id: 0, moved_to: None });

        let rows = tb.rows_of(&user).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].score, 100);
        assert_eq!(tb.rank(&user).await.unwrap(), Rank::Ranked(1));
    }

    #[tokio::test]
    async fn test_same_score_is_idempotent() {
        let tb = TestBoard::new(10).unwrap();
        tb.add("alice", 50).await.unwrap();
        let before = tb.rows_of("alice").await.unwrap();
        let writes = tb.store.write_count(Durability::Quorum);

        assert_eq!(tb.add("alice", 50).await.unwrap(), AddOutcome::Unchanged);
        assert_eq!(tb.rows_of("alice").await.unwrap(), before);
        assert_eq!(tb.store.write_count(Durability::Quorum), writes);
    }

    #[tokio::test]
    async fn test_confidence_change_overwrites_in_place() {
        let tb = TestBoard::new(10).unwrap();
        tb.add("alice", 50).await.unwrap();

        let outcome = tb.submit(ScoreSubmission::new("alice", 50, 7)).await.unwrap();
        assert_eq!(outcome, AddOutcome::Updated { bucket_id: 0, moved_to: None });

        let rows = tb.rows_of("alice").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].confidence, 7);
    }

    #[tokio::test]
    async fn test_high_score_only() {
        let tb = TestBoard::new(10).unwrap();
        tb.add("alice", 50).await.unwrap();

        let lower = ScoreSubmission::new("alice", 40, 100).high_score_only();
        assert_eq!(tb.submit(lower).await.unwrap(), AddOutcome::Rejected);
        assert_eq!(tb.rows_of("alice").await.unwrap()[0].score, 50);

        let higher = ScoreSubmission::new("alice", 60, 100).high_score_only();
        assert!(matches!(tb.submit(higher).await.unwrap(), AddOutcome::Updated { .. }));
        assert_eq!(tb.rows_of("alice").await.unwrap()[0].score, 60);
        assert_eq!(tb.board.metrics().scores_rejected.get(), 1);
    }
}
