//! Bucket boundary records and score-to-bucket resolution.

use crate::config::LeaderboardConfig;
use crate::error::{Error, Result};
use crate::store::ScoreStore;
use crate::types::{Bucket, BucketId};
use moka::future::Cache;
use std::cmp::Reverse;
use std::sync::Arc;

/// Owns the bucket boundary records of every board.
///
/// Boundary lists are read through a short-lived cache. Every mutation made
/// through this index invalidates the board's entry; changes made by other
/// processes become visible once the entry expires.
#[derive(Clone)]
pub struct BucketIndex {
    store: Arc<dyn ScoreStore>,
    cache: Cache<String, Arc<Vec<Bucket>>>,
}

impl BucketIndex {
    /// Create an index over the given store.
    pub fn new(store: Arc<dyn ScoreStore>, config: &LeaderboardConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.boundary_cache_capacity)
            .time_to_live(config.boundary_cache_ttl)
            .build();

        Self { store, cache }
    }

    /// Buckets of a board ordered by id.
    pub async fn buckets(&self, slug: &str) -> Result<Arc<Vec<Bucket>>> {
        if let Some(buckets) = self.cache.get(slug).await {
            return Ok(buckets);
        }

        let mut buckets = self.store.buckets_for(slug).await?;
        buckets.sort_by_key(|b| b.bucket_id);
        let buckets = Arc::new(buckets);
        if !buckets.is_empty() {
            self.cache.insert(slug.to_string(), buckets.clone()).await;
        }
        Ok(buckets)
    }

    /// Boundary record of one bucket, if it exists.
    pub async fn bucket(&self, slug: &str, bucket_id: BucketId) -> Result<Option<Bucket>> {
        let buckets = self.buckets(slug).await?;
        Ok(buckets.iter().find(|b| b.bucket_id == bucket_id).cloned())
    }

    /// Bucket whose range contains `score`.
    ///
    /// The first write to a board creates bucket 0 with an unbounded floor.
    /// Concurrent first writers race on an insert-if-absent, so exactly one
    /// record is created and every writer resolves to it.
    pub async fn resolve_bucket(&self, slug: &str, score: i64) -> Result<Bucket> {
        let buckets = self.buckets(slug).await?;
        if let Some(bucket) = select_bucket(&buckets, score) {
            return Ok(bucket.clone());
        }

        let created = self
            .store
            .insert_bucket_if_absent(&Bucket::unbounded(slug, 0))
            .await?;
        self.invalidate(slug).await;
        if created {
            tracing::info!(slug, "Created first bucket for board");
        }

        let buckets = self.buckets(slug).await?;
        select_bucket(&buckets, score)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("board {slug} has no buckets after bootstrap")))
    }

    /// Upsert the floor of a bucket.
    pub async fn set_boundary(&self, slug: &str, bucket_id: BucketId, minimum_score: i64) -> Result<()> {
        self.store
            .upsert_bucket(&Bucket::new(slug, bucket_id, minimum_score))
            .await?;
        self.invalidate(slug).await;

        tracing::debug!(slug, bucket_id, minimum_score, "Updated bucket boundary");
        Ok(())
    }

    /// Create a bucket with an unbounded floor unless it exists.
    /// Returns whether it was created.
    pub async fn ensure_bucket(&self, slug: &str, bucket_id: BucketId) -> Result<bool> {
        let created = self
            .store
            .insert_bucket_if_absent(&Bucket::unbounded(slug, bucket_id))
            .await?;
        if created {
            self.invalidate(slug).await;
            tracing::debug!(slug, bucket_id, "Created bucket");
        }
        Ok(created)
    }

    /// Drop the cached boundary list of a board.
    pub async fn invalidate(&self, slug: &str) {
        self.cache.invalidate(slug).await;
    }
}

impl std::fmt::Debug for BucketIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketIndex")
            .field("cached_boards", &self.cache.entry_count())
            .finish()
    }
}

/// Pick the bucket with the greatest floor not above `score`, the smallest id
/// among equal floors. A score below every floor lands in the deepest bucket.
fn select_bucket(buckets: &[Bucket], score: i64) -> Option<&Bucket> {
    buckets
        .iter()
        .filter(|b| b.minimum_score <= score)
        .max_by_key(|b| (b.minimum_score, Reverse(b.bucket_id)))
        .or_else(|| buckets.iter().max_by_key(|b| b.bucket_id))
}
