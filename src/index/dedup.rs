//! Reconciliation of duplicate rows.
//!
//! Updates and moves are insert-then-delete, so a user can briefly own more
//! than one row. The row with the greatest timestamp is canonical; every other
//! row of the same user is stale and may be deleted at any time.

use crate::config::LeaderboardConfig;
use crate::error::Result;
use crate::store::ScoreStore;
use crate::types::{BucketId, ScanQuery, ScoreRow};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Rows of one user split into the canonical row and stale leftovers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub canonical: ScoreRow,
    pub stale: Vec<ScoreRow>,
}

/// Split the rows of one user into canonical and stale. `None` for no rows.
pub fn reconcile(mut rows: Vec<ScoreRow>) -> Option<Reconciled> {
    rows.sort_by(|a, b| b.timestamp_micros.cmp(&a.timestamp_micros));
    let mut rows = rows.into_iter();
    let canonical = rows.next()?;
    Some(Reconciled {
        canonical,
        stale: rows.collect(),
    })
}

/// Keep the most recent row per user, preserving the order of the kept rows.
/// Returns the kept rows and how many were dropped.
pub fn dedup_latest(rows: Vec<ScoreRow>) -> (Vec<ScoreRow>, usize) {
    let keep: Vec<bool> = {
        let mut latest: HashMap<&str, u64> = HashMap::with_capacity(rows.len());
        for row in &rows {
            let ts = latest.entry(row.user_id.as_str()).or_insert(row.timestamp_micros);
            *ts = (*ts).max(row.timestamp_micros);
        }

        let mut emitted = HashSet::with_capacity(latest.len());
        rows.iter()
            .map(|row| {
                latest.get(row.user_id.as_str()) == Some(&row.timestamp_micros)
                    && emitted.insert(row.user_id.as_str())
            })
            .collect()
    };

    let total = rows.len();
    let kept: Vec<ScoreRow> = rows
        .into_iter()
        .zip(keep)
        .filter_map(|(row, keep)| keep.then_some(row))
        .collect();
    let dropped = total - kept.len();
    (kept, dropped)
}

/// Deletes stale duplicate rows.
#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<dyn ScoreStore>,
    config: Arc<LeaderboardConfig>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn ScoreStore>, config: Arc<LeaderboardConfig>) -> Self {
        Self { store, config }
    }

    /// Remove duplicate rows of the same user inside one bucket.
    /// Returns the number of rows deleted.
    #[tracing::instrument(skip(self))]
    pub async fn clean_bucket(&self, slug: &str, bucket_id: BucketId) -> Result<usize> {
        let rows = self
            .store
            .scan(
                slug,
                bucket_id,
                ScanQuery::descending().with_limit(self.config.dedup_scan_limit),
            )
            .await?;

        let mut by_user: HashMap<String, Vec<ScoreRow>> = HashMap::new();
        for row in rows {
            by_user.entry(row.user_id.clone()).or_default().push(row);
        }

        let mut removed = 0;
        for rows in by_user.into_values().filter(|rows| rows.len() > 1) {
            removed += self.delete_stale(rows).await?;
        }

        if removed > 0 {
            tracing::info!(slug, bucket_id, removed, "Removed duplicate rows from bucket");
        }
        Ok(removed)
    }

    /// Remove every row of a user except the most recent one.
    #[tracing::instrument(skip(self))]
    pub async fn clean_user(&self, slug: &str, user_id: &str) -> Result<usize> {
        let rows = self
            .store
            .rows_for_user(slug, user_id, self.config.user_lookup_limit)
            .await?;
        let removed = self.delete_stale(rows).await?;

        if removed > 0 {
            tracing::info!(slug, user_id, removed, "Removed stale rows of user");
        }
        Ok(removed)
    }

    async fn delete_stale(&self, rows: Vec<ScoreRow>) -> Result<usize> {
        let Some(Reconciled { canonical, stale }) = reconcile(rows) else {
            return Ok(0);
        };

        let mut removed = 0;
        for row in stale {
            // Same key means the canonical row overwrote it in place.
            if row.key() == canonical.key() {
                continue;
            }
            self.store
                .delete(&row.key(), self.config.write_durability)
                .await?;
            tracing::debug!(
                user_id = %row.user_id,
                bucket_id = row.bucket_id,
                score = row.score,
                "Deleted stale row"
            );
            removed += 1;
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("scan_limit", &self.config.dedup_scan_limit)
            .finish()
    }
}
