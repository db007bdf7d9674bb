//! In-memory score store.

use super::ScoreStore;
use crate::error::{Result, StoreError};
use crate::types::{
    now_ms, Bucket, BucketId, Durability, PagingState, RowKey, RowPage, ScanOrder, ScanQuery,
    ScoreRow,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Clustering key inside a partition: score descending, then user id.
type ClusterKey = (Reverse<i64>, String);

/// Partition key of the score table.
type PartitionKey = (String, BucketId);

const FAULTS_DISABLED: i64 = -1;

#[derive(Debug, Default)]
struct Tables {
    scores: BTreeMap<PartitionKey, BTreeMap<ClusterKey, ScoreRow>>,
    /// Secondary index (slug, user) -> (bucket, score) of every stored row.
    by_user: HashMap<(String, String), BTreeSet<(BucketId, i64)>>,
    buckets: BTreeMap<String, BTreeMap<BucketId, Bucket>>,
}

impl Tables {
    fn remove(&mut self, key: &RowKey) -> Option<ScoreRow> {
        let partition_key = (key.slug.clone(), key.bucket_id);
        let partition = self.scores.get_mut(&partition_key)?;
        let removed = partition.remove(&(Reverse(key.score), key.user_id.clone()));
        if partition.is_empty() {
            self.scores.remove(&partition_key);
        }

        let index_key = (key.slug.clone(), key.user_id.clone());
        if let Some(entries) = self.by_user.get_mut(&index_key) {
            entries.remove(&(key.bucket_id, key.score));
            if entries.is_empty() {
                self.by_user.remove(&index_key);
            }
        }

        removed
    }

    fn put(&mut self, row: ScoreRow) {
        self.by_user
            .entry((row.slug.clone(), row.user_id.clone()))
            .or_default()
            .insert((row.bucket_id, row.score));
        self.scores
            .entry((row.slug.clone(), row.bucket_id))
            .or_default()
            .insert((Reverse(row.score), row.user_id.clone()), row);
    }
}

/// Score store kept entirely in memory.
///
/// Behaves like the partitioned store the index is designed for: rows are
/// clustered by (score desc, user id), users are found through a secondary
/// index, expired rows are invisible and purged lazily. Durability levels are
/// accepted and counted but have no effect.
///
/// Faults can be injected to exercise error paths:
/// [`set_unavailable`](Self::set_unavailable) fails every call and
/// [`fail_writes_after`](Self::fail_writes_after) fails writes once a budget
/// is used up.
#[derive(Debug)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    schema_ready: AtomicBool,
    schema_creations: AtomicU64,
    unavailable: AtomicBool,
    /// Remaining successful writes before failures start; -1 disables.
    write_budget: AtomicI64,
    write_counts: [AtomicU64; 3],
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create an empty store without schema.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            schema_ready: AtomicBool::new(false),
            schema_creations: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            write_budget: AtomicI64::new(FAULTS_DISABLED),
            write_counts: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    /// Create an empty store whose schema already exists.
    pub fn with_schema() -> Self {
        let store = Self::new();
        store.schema_ready.store(true, Ordering::SeqCst);
        store
    }

    /// Make every call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Let `writes` more writes succeed, then fail every write.
    /// `None` turns write failures off.
    pub fn fail_writes_after(&self, writes: Option<usize>) {
        let budget = writes.map_or(FAULTS_DISABLED, |w| w as i64);
        self.write_budget.store(budget, Ordering::SeqCst);
    }

    /// How many times the schema was actually created.
    pub fn schema_creations(&self) -> u64 {
        self.schema_creations.load(Ordering::SeqCst)
    }

    /// Writes (inserts and deletes) performed at the given durability.
    pub fn write_count(&self, durability: Durability) -> u64 {
        self.write_counts[durability_slot(durability)].load(Ordering::Relaxed)
    }

    /// Number of live rows stored in one bucket.
    pub fn bucket_len(&self, slug: &str, bucket_id: BucketId) -> usize {
        let now = now_ms();
        self.tables
            .read()
            .scores
            .get(&(slug.to_string(), bucket_id))
            .map(|partition| partition.values().filter(|r| !r.is_expired_at(now)).count())
            .unwrap_or(0)
    }

    /// Number of live rows stored for a board.
    pub fn board_len(&self, slug: &str) -> usize {
        let now = now_ms();
        self.tables
            .read()
            .scores
            .iter()
            .filter(|((s, _), _)| s == slug)
            .map(|(_, partition)| partition.values().filter(|r| !r.is_expired_at(now)).count())
            .sum()
    }

    /// Drop every expired row. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = now_ms();
        let mut tables = self.tables.write();
        let expired: Vec<RowKey> = tables
            .scores
            .values()
            .flat_map(|partition| partition.values())
            .filter(|row| row.is_expired_at(now))
            .map(ScoreRow::key)
            .collect();
        for key in &expired {
            tables.remove(key);
        }
        expired.len()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected fault".into()).into());
        }
        if !self.schema_ready.load(Ordering::SeqCst) {
            return Err(StoreError::SchemaMissing.into());
        }
        Ok(())
    }

    fn check_write(&self, durability: Durability) -> Result<()> {
        self.check()?;
        let budget = self
            .write_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| (b > 0).then(|| b - 1));
        if let Err(0) = budget {
            return Err(StoreError::Unavailable("write budget exhausted".into()).into());
        }
        self.write_counts[durability_slot(durability)].fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn durability_slot(durability: Durability) -> usize {
    match durability {
        Durability::One => 0,
        Durability::Quorum => 1,
        Durability::All => 2,
    }
}

#[async_trait]
impl ScoreStore for InMemoryStore {
    async fn ensure_schema(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected fault".into()).into());
        }
        if !self.schema_ready.swap(true, Ordering::SeqCst) {
            self.schema_creations.fetch_add(1, Ordering::SeqCst);
            tracing::info!("Created score and bucket tables");
        }
        Ok(())
    }

    async fn rows_for_user(&self, slug: &str, user_id: &str, limit: usize) -> Result<Vec<ScoreRow>> {
        self.check()?;
        let now = now_ms();
        let tables = self.tables.read();
        let Some(entries) = tables.by_user.get(&(slug.to_string(), user_id.to_string())) else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<&ScoreRow> = entries
            .iter()
            .filter_map(|(bucket_id, score)| {
                tables
                    .scores
                    .get(&(slug.to_string(), *bucket_id))
                    .and_then(|p| p.get(&(Reverse(*score), user_id.to_string())))
            })
            .filter(|row| !row.is_expired_at(now))
            .collect();
        // Most recent first, so the limit never cuts off the canonical row.
        rows.sort_by(|a, b| b.timestamp_micros.cmp(&a.timestamp_micros));
        Ok(rows.into_iter().take(limit).cloned().collect())
    }

    async fn scan(&self, slug: &str, bucket_id: BucketId, query: ScanQuery) -> Result<Vec<ScoreRow>> {
        self.check()?;
        let now = now_ms();
        let tables = self.tables.read();
        let Some(partition) = tables.scores.get(&(slug.to_string(), bucket_id)) else {
            return Ok(Vec::new());
        };

        let live = |row: &&ScoreRow| !row.is_expired_at(now) && query.filter.matches(row.score);
        let limit = query.limit.unwrap_or(usize::MAX);
        let rows = match query.order {
            ScanOrder::Descending => partition
                .values()
                .filter(live)
                .skip(query.skip)
                .take(limit)
                .cloned()
                .collect(),
            ScanOrder::Ascending => partition
                .values()
                .rev()
                .filter(live)
                .skip(query.skip)
                .take(limit)
                .cloned()
                .collect(),
        };
        Ok(rows)
    }

    async fn insert(&self, row: &ScoreRow, durability: Durability, ttl: Option<Duration>) -> Result<()> {
        self.check_write(durability)?;
        let mut row = row.clone();
        if let Some(ttl) = ttl {
            row.expires_at_ms = Some(now_ms() + ttl.as_millis() as u64);
        }
        self.tables.write().put(row);
        Ok(())
    }

    async fn delete(&self, key: &RowKey, durability: Durability) -> Result<()> {
        self.check_write(durability)?;
        self.tables.write().remove(key);
        Ok(())
    }

    async fn upsert_bucket(&self, bucket: &Bucket) -> Result<()> {
        self.check_write(Durability::Quorum)?;
        self.tables
            .write()
            .buckets
            .entry(bucket.slug.clone())
            .or_default()
            .insert(bucket.bucket_id, bucket.clone());
        Ok(())
    }

    async fn insert_bucket_if_absent(&self, bucket: &Bucket) -> Result<bool> {
        self.check_write(Durability::Quorum)?;
        let mut tables = self.tables.write();
        let board = tables.buckets.entry(bucket.slug.clone()).or_default();
        if board.contains_key(&bucket.bucket_id) {
            return Ok(false);
        }
        board.insert(bucket.bucket_id, bucket.clone());
        Ok(true)
    }

    async fn buckets_for(&self, slug: &str) -> Result<Vec<Bucket>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .buckets
            .get(slug)
            .map(|board| board.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn all_buckets(&self) -> Result<Vec<Bucket>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .buckets
            .values()
            .flat_map(|board| board.values().cloned())
            .collect())
    }

    async fn page_rows(&self, paging_state: Option<&PagingState>, page_size: usize) -> Result<RowPage> {
        self.check()?;
        let after: Option<RowKey> = paging_state
            .map(|state| bincode::deserialize(state.as_bytes()))
            .transpose()?;

        let now = now_ms();
        let tables = self.tables.read();
        let start = match &after {
            Some(key) => Bound::Included((key.slug.clone(), key.bucket_id)),
            None => Bound::Unbounded,
        };

        let mut rows = Vec::with_capacity(page_size);
        'partitions: for (partition_key, partition) in tables.scores.range((start, Bound::Unbounded)) {
            let resume = after
                .as_ref()
                .filter(|key| key.slug == partition_key.0 && key.bucket_id == partition_key.1)
                .map(|key| (Reverse(key.score), key.user_id.clone()));
            let lower = match resume {
                Some(cluster) => Bound::Excluded(cluster),
                None => Bound::Unbounded,
            };
            for row in partition.range((lower, Bound::Unbounded)).map(|(_, row)| row) {
                if rows.len() == page_size {
                    break 'partitions;
                }
                if !row.is_expired_at(now) {
                    rows.push(row.clone());
                }
            }
        }

        let paging_state = if rows.len() == page_size {
            match rows.last() {
                Some(last) => Some(PagingState(Bytes::from(bincode::serialize(&last.key())?))),
                None => None,
            }
        } else {
            None
        };

        Ok(RowPage { rows, paging_state })
    }
}
