//! Backing store contract.
//!
//! The index never talks to a database directly. Everything it needs is
//! expressed by [`ScoreStore`], which models an ordered, partitioned key-value
//! store:
//!
//! ```text
//! scores   partition (slug, bucket_id)   clustering (score DESC, user_id ASC)
//!          secondary index on (slug, user_id)
//! buckets  partition (slug)              clustering (bucket_id)
//! ```
//!
//! The store offers no multi-row transactions. Every call is a single-row or
//! single-partition operation, and writes take a [`Durability`] level.
//!
//! [`InMemoryStore`] is the reference implementation used by tests and by
//! embedders that do not need persistence.

mod memory;

pub use memory::InMemoryStore;

use crate::error::Result;
use crate::types::{Bucket, BucketId, Durability, PagingState, RowKey, RowPage, ScanQuery, ScoreRow};
use async_trait::async_trait;
use std::time::Duration;

/// Trait for the ordered score store backing the index.
#[async_trait]
pub trait ScoreStore: Send + Sync + std::fmt::Debug {
    /// Create tables and indexes if they do not exist yet.
    async fn ensure_schema(&self) -> Result<()>;

    /// Rows of a user found through the secondary index, most recent first.
    /// More than one row means transient duplicates.
    async fn rows_for_user(&self, slug: &str, user_id: &str, limit: usize) -> Result<Vec<ScoreRow>>;

    /// Ranged scan over one (slug, bucket) partition.
    async fn scan(&self, slug: &str, bucket_id: BucketId, query: ScanQuery) -> Result<Vec<ScoreRow>>;

    /// Insert or overwrite a row. With `ttl` the row expires after that
    /// duration; without it the row keeps its own `expires_at_ms`.
    async fn insert(&self, row: &ScoreRow, durability: Durability, ttl: Option<Duration>) -> Result<()>;

    /// Delete a row. Deleting a missing row is not an error.
    async fn delete(&self, key: &RowKey, durability: Durability) -> Result<()>;

    /// Insert or overwrite a bucket record.
    async fn upsert_bucket(&self, bucket: &Bucket) -> Result<()>;

    /// Insert a bucket record unless one exists for (slug, bucket_id).
    /// Returns whether this call created it.
    async fn insert_bucket_if_absent(&self, bucket: &Bucket) -> Result<bool>;

    /// All bucket records of a board, ordered by bucket id.
    async fn buckets_for(&self, slug: &str) -> Result<Vec<Bucket>>;

    /// All bucket records of every board.
    async fn all_buckets(&self) -> Result<Vec<Bucket>>;

    /// One page of a full scan over every live row, resuming after
    /// `paging_state`.
    async fn page_rows(&self, paging_state: Option<&PagingState>, page_size: usize) -> Result<RowPage>;
}
