//! Moving rows between buckets.
//!
//! ```text
//! bucket b   [ top `capacity` rows | overflow ... ]
//!                                   │ move_row (bounded pool)
//!                                   ▼
//! bucket b+1 [ overflow ... | previous rows ]
//!
//! after every move completed: floor(b) = highest moved score + 1
//! ```
//!
//! A move inserts the row into the destination before deleting the source, so
//! an interrupted rebalance leaves duplicates behind, never a lost row.

use super::bucket::BucketIndex;
use super::dedup::{reconcile, Reconciled};
use crate::config::LeaderboardConfig;
use crate::error::{Error, Result};
use crate::store::ScoreStore;
use crate::types::{Bucket, BucketId, ScanQuery, ScoreRow};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result of one rebalance pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceReport {
    pub slug: String,
    pub bucket_id: BucketId,
    /// Live rows found in the bucket.
    pub rows_seen: usize,
    /// Rows moved to the next bucket.
    pub moved: usize,
    /// Floor written for the bucket, if it changed.
    pub new_floor: Option<i64>,
}

impl RebalanceReport {
    fn noop(slug: &str, bucket_id: BucketId, rows_seen: usize) -> Self {
        Self {
            slug: slug.to_string(),
            bucket_id,
            rows_seen,
            moved: 0,
            new_floor: None,
        }
    }

    /// Whether the bucket was already within capacity.
    pub fn is_noop(&self) -> bool {
        self.moved == 0
    }
}

/// Moves rows between buckets and adjusts bucket floors.
#[derive(Clone)]
pub struct Rebalancer {
    store: Arc<dyn ScoreStore>,
    index: BucketIndex,
    config: Arc<LeaderboardConfig>,
}

impl Rebalancer {
    pub fn new(store: Arc<dyn ScoreStore>, index: BucketIndex, config: Arc<LeaderboardConfig>) -> Self {
        Self { store, index, config }
    }

    /// Move every row beyond the bucket's capacity into the next bucket, then
    /// raise the bucket's floor above the moved rows.
    ///
    /// The floor is only written once every move succeeded. A failed move or
    /// a cancellation leaves the boundary untouched and returns the error;
    /// running the rebalance again completes the remaining moves.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn rebalance(
        &self,
        slug: &str,
        bucket_id: BucketId,
        cancel: &CancellationToken,
    ) -> Result<RebalanceReport> {
        let rows = self.store.scan(slug, bucket_id, ScanQuery::descending()).await?;
        let capacity = self.config.bucket_capacity;
        if rows.len() <= capacity {
            tracing::debug!(slug, bucket_id, rows = rows.len(), "Bucket within capacity");
            return Ok(RebalanceReport::noop(slug, bucket_id, rows.len()));
        }

        let target = bucket_id + 1;
        self.index.ensure_bucket(slug, target).await?;

        let overflow = &rows[capacity..];
        let highest_moved = overflow[0].score;

        let mut moves = stream::iter(overflow.iter().cloned())
            .map(|row| async move {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                self.move_row(&row, target).await
            })
            .buffer_unordered(self.config.maintenance.move_concurrency);

        let mut moved = 0;
        let mut failed = 0;
        let mut first_error = None;
        while let Some(result) = moves.next().await {
            match result {
                Ok(_) => moved += 1,
                Err(e) => {
                    failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            tracing::warn!(
                slug,
                bucket_id,
                moved,
                failed,
                error = %e,
                "Rebalance incomplete, boundary left unchanged"
            );
            return Err(e);
        }

        // Rows left in the target by an earlier interrupted pass count as moved.
        let lowest_kept = rows[capacity.saturating_sub(1)].score;
        let target_top = self
            .store
            .scan(slug, target, ScanQuery::descending().with_limit(1))
            .await?
            .first()
            .map(|r| r.score)
            .filter(|&score| score <= lowest_kept);
        let highest_moved = target_top.map_or(highest_moved, |top| top.max(highest_moved));

        // A cut inside a run of tied scores leaves the kept tied rows below
        // the new floor. They stay put; only new scores are routed by it.
        let new_floor = highest_moved.saturating_add(1);
        self.index.set_boundary(slug, bucket_id, new_floor).await?;

        tracing::info!(slug, bucket_id, moved, new_floor, "Rebalanced bucket");

        Ok(RebalanceReport {
            slug: slug.to_string(),
            bucket_id,
            rows_seen: rows.len(),
            moved,
            new_floor: Some(new_floor),
        })
    }

    /// Copy a row into another bucket, then delete the original.
    ///
    /// Score, user, confidence, timestamp and absolute expiry are kept.
    /// Both steps are idempotent, so a failed move can simply be repeated.
    pub async fn move_row(&self, row: &ScoreRow, to_bucket_id: BucketId) -> Result<ScoreRow> {
        if row.bucket_id == to_bucket_id {
            return Ok(row.clone());
        }

        let moved = row.with_bucket(to_bucket_id);
        let durability = self.config.move_durability;
        self.store.insert(&moved, durability, None).await?;
        self.store.delete(&row.key(), durability).await?;

        tracing::debug!(
            slug = %row.slug,
            user_id = %row.user_id,
            score = row.score,
            from = row.bucket_id,
            to = to_bucket_id,
            "Moved row"
        );
        Ok(moved)
    }

    /// Move a user one bucket up if their row still qualifies for promotion.
    /// Returns the moved row.
    ///
    /// A row promoted below the upper bucket's floor lowers that floor to its
    /// score, so new scores between the two land above it.
    #[tracing::instrument(skip(self))]
    pub async fn promote(&self, slug: &str, user_id: &str) -> Result<Option<ScoreRow>> {
        let rows = self
            .store
            .rows_for_user(slug, user_id, self.config.user_lookup_limit)
            .await?;
        let Some(Reconciled { canonical, .. }) = reconcile(rows) else {
            return Ok(None);
        };
        if canonical.bucket_id == 0 {
            return Ok(None);
        }

        let top = self
            .store
            .scan(slug, canonical.bucket_id, ScanQuery::descending().with_limit(1))
            .await?;
        let upper_id = canonical.bucket_id - 1;
        let Some(upper) = self.index.bucket(slug, upper_id).await? else {
            return Ok(None);
        };
        let underfilled =
            is_underfilled(self.store.as_ref(), slug, upper_id, self.config.bucket_capacity).await?;
        if !should_promote(&canonical, top.first().map(|r| r.score), Some(&upper), underfilled) {
            return Ok(None);
        }

        let promoted = self.move_row(&canonical, upper_id).await?;
        if promoted.score < upper.minimum_score {
            self.index.set_boundary(slug, upper_id, promoted.score).await?;
        }
        tracing::info!(slug, user_id, to = promoted.bucket_id, "Promoted row");
        Ok(Some(promoted))
    }
}

impl std::fmt::Debug for Rebalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rebalancer")
            .field("bucket_capacity", &self.config.bucket_capacity)
            .field("move_concurrency", &self.config.maintenance.move_concurrency)
            .finish()
    }
}

/// A row belongs one bucket up when it tops its own bucket and either its
/// score has reached the floor of the bucket above or that bucket has room,
/// e.g. after its rows expired.
pub(crate) fn should_promote(
    canonical: &ScoreRow,
    top_score: Option<i64>,
    upper: Option<&Bucket>,
    upper_underfilled: bool,
) -> bool {
    canonical.bucket_id > 0
        && top_score == Some(canonical.score)
        && upper.map_or(false, |bucket| upper_underfilled || canonical.score >= bucket.minimum_score)
}

/// Whether a bucket holds fewer than `capacity` live rows.
pub(crate) async fn is_underfilled(
    store: &dyn ScoreStore,
    slug: &str,
    bucket_id: BucketId,
    capacity: usize,
) -> Result<bool> {
    let rows = store
        .scan(slug, bucket_id, ScanQuery::descending().with_limit(capacity))
        .await?;
    Ok(rows.len() < capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::Durability;

    struct Fixture {
        store: Arc<InMemoryStore>,
        index: BucketIndex,
        rebalancer: Rebalancer,
    }

    fn fixture(capacity: usize) -> Fixture {
        let store = Arc::new(InMemoryStore::with_schema());
        let config = Arc::new(LeaderboardConfig::new().with_bucket_capacity(capacity));
        let index = BucketIndex::new(store.clone(), &config);
        let rebalancer = Rebalancer::new(store.clone(), index.clone(), config);
        Fixture { store, index, rebalancer }
    }

    async fn seed(fx: &Fixture, bucket: BucketId, scores: impl IntoIterator<Item = i64>) {
        fx.index.resolve_bucket("board", 0).await.unwrap();
        for score in scores {
            let row = ScoreRow::new("board", bucket, format!("u{score}"), score, 1);
            fx.store.insert(&row, Durability::Quorum, None).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_rebalance_moves_overflow() {
        let fx = fixture(10);
        seed(&fx, 0, 0..15).await;

        let report = fx
            .rebalancer
            .rebalance("board", 0, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.rows_seen, 15);
        assert_eq!(report.moved, 5);
        assert_eq!(report.new_floor, Some(5));

        assert_eq!(fx.store.bucket_len("board", 0), 10);
        assert_eq!(fx.store.bucket_len("board", 1), 5);
        assert_eq!(fx.index.bucket("board", 0).await.unwrap().unwrap().minimum_score, 5);
        assert_eq!(fx.index.resolve_bucket("board", 4).await.unwrap().bucket_id, 1);
        // Moves use the strongest durability.
        assert_eq!(fx.store.write_count(Durability::All), 10);
    }

    #[tokio::test]
    async fn test_cut_inside_tied_scores() {
        let fx = fixture(10);
        seed(&fx, 0, 20..29).await;
        for user in ["tie-a", "tie-b", "tie-c"] {
            let row = ScoreRow::new("board", 0, user, 5, 1);
            fx.store.insert(&row, Durability::Quorum, None).await.unwrap();
        }

        let report = fx
            .rebalancer
            .rebalance("board", 0, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.moved, 2);
        assert_eq!(report.new_floor, Some(6));

        // One tied row stays in bucket 0 under its floor.
        let kept = fx
            .store
            .scan("board", 0, ScanQuery::ascending().with_limit(1))
            .await
            .unwrap();
        assert_eq!(kept[0].score, 5);
        assert_eq!(fx.store.bucket_len("board", 1), 2);
    }

    #[tokio::test]
    async fn test_rebalance_within_capacity_is_noop() {
        let fx = fixture(10);
        seed(&fx, 0, 0..10).await;

        let report = fx
            .rebalancer
            .rebalance("board", 0, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_noop());
        assert!(fx.index.bucket("board", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_move_keeps_boundary() {
        let fx = fixture(10);
        seed(&fx, 0, 0..15).await;
        // Room for ensure_bucket and two moves.
        fx.store.fail_writes_after(Some(5));

        let result = fx
            .rebalancer
            .rebalance("board", 0, &CancellationToken::new())
            .await;
        assert!(result.is_err());
        fx.store.fail_writes_after(None);

        // Boundary untouched, every user still has a row.
        let floor = fx.index.bucket("board", 0).await.unwrap().unwrap().minimum_score;
        assert_eq!(floor, i64::MIN);
        for score in 0..15 {
            let rows = fx.store.rows_for_user("board", &format!("u{score}"), 10).await.unwrap();
            assert!(!rows.is_empty());
        }

        // A second run finishes the job.
        let report = fx
            .rebalancer
            .rebalance("board", 0, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.new_floor, Some(5));
        assert_eq!(fx.store.bucket_len("board", 0), 10);
    }

    #[tokio::test]
    async fn test_cancelled_rebalance_moves_nothing() {
        let fx = fixture(10);
        seed(&fx, 0, 0..15).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fx.rebalancer.rebalance("board", 0, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(fx.store.bucket_len("board", 0), 15);
    }

    #[tokio::test]
    async fn test_move_row_round_trip() {
        let fx = fixture(10);
        let mut row = ScoreRow::new("board", 0, "a", 77, 3);
        row.expires_at_ms = Some(crate::types::now_ms() + 60_000);
        fx.store.insert(&row, Durability::Quorum, None).await.unwrap();

        let moved = fx.rebalancer.move_row(&row, 1).await.unwrap();
        let back = fx.rebalancer.move_row(&moved, 0).await.unwrap();
        assert_eq!(back, row);
        assert_eq!(fx.store.rows_for_user("board", "a", 10).await.unwrap(), vec![row.clone()]);

        // Same bucket is a no-op.
        let writes = fx.store.write_count(Durability::All);
        fx.rebalancer.move_row(&row, 0).await.unwrap();
        assert_eq!(fx.store.write_count(Durability::All), writes);
    }

    #[test]
    fn test_should_promote() {
        let row = ScoreRow::new("board", 1, "a", 50, 1);
        let upper = Bucket::new("board", 0, 40);
        let high_floor = Bucket::new("board", 0, 51);
        assert!(should_promote(&row, Some(50), Some(&upper), false));
        assert!(!should_promote(&row, Some(60), Some(&upper), false));
        assert!(!should_promote(&row, Some(50), Some(&high_floor), false));
        assert!(!should_promote(&row, Some(50), None, true));
        assert!(!should_promote(&row.with_bucket(0), Some(50), Some(&upper), true));
        // Room in the bucket above outweighs its floor.
        assert!(should_promote(&row, Some(50), Some(&high_floor), true));
        assert!(!should_promote(&row, Some(60), Some(&high_floor), true));
    }

    #[tokio::test]
    async fn test_promote_into_underfilled_bucket_lowers_floor() {
        let fx = fixture(10);
        seed(&fx, 0, 100..105).await;
        fx.index.ensure_bucket("board", 1).await.unwrap();
        fx.index.set_boundary("board", 0, 100).await.unwrap();
        let top = ScoreRow::new("board", 1, "top", 60, 1);
        fx.store.insert(&top, Durability::Quorum, None).await.unwrap();

        let promoted = fx.rebalancer.promote("board", "top").await.unwrap().unwrap();
        assert_eq!(promoted.bucket_id, 0);
        assert_eq!(fx.index.bucket("board", 0).await.unwrap().unwrap().minimum_score, 60);
        assert_eq!(fx.index.resolve_bucket("board", 70).await.unwrap().bucket_id, 0);
    }

    #[tokio::test]
    async fn test_promote_rechecks_conditions() {
        let fx = fixture(10);
        seed(&fx, 0, 100..110).await;
        fx.index.ensure_bucket("board", 1).await.unwrap();
        fx.index.set_boundary("board", 0, 100).await.unwrap();

        let low = ScoreRow::new("board", 1, "low", 10, 1);
        let high = ScoreRow::new("board", 1, "high", 105, 1);
        fx.store.insert(&low, Durability::Quorum, None).await.unwrap();
        fx.store.insert(&high, Durability::Quorum, None).await.unwrap();

        assert!(fx.rebalancer.promote("board", "low").await.unwrap().is_none());
        let promoted = fx.rebalancer.promote("board", "high").await.unwrap().unwrap();
        assert_eq!(promoted.bucket_id, 0);
        assert!(fx.rebalancer.promote("board", "nobody").await.unwrap().is_none());
    }
}
