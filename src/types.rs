//! Core types used throughout the leaderboard index.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Bucket identifier within a board. Bucket 0 holds the top scores.
pub type BucketId = u64;

/// Floor of a freshly created bucket; covers every representable score.
pub const UNBOUNDED_FLOOR: i64 = i64::MIN;

/// Boundary record of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Board slug.
    pub slug: String,
    /// Position of the bucket in rank order.
    pub bucket_id: BucketId,
    /// Lowest score the bucket is meant to hold.
    pub minimum_score: i64,
}

impl Bucket {
    /// Create a bucket record.
    pub fn new(slug: impl Into<String>, bucket_id: BucketId, minimum_score: i64) -> Self {
        Self {
            slug: slug.into(),
            bucket_id,
            minimum_score,
        }
    }

    /// Create an unbounded bucket (floor at the minimum representable score).
    pub fn unbounded(slug: impl Into<String>, bucket_id: BucketId) -> Self {
        Self::new(slug, bucket_id, UNBOUNDED_FLOOR)
    }
}

/// One recorded score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreRow {
    pub slug: String,
    pub bucket_id: BucketId,
    pub score: i64,
    pub user_id: String,
    /// How certain the submitter was that the score is legitimate.
    pub confidence: u8,
    /// Write time in microseconds since the Unix epoch. Greatest wins.
    pub timestamp_micros: u64,
    /// Absolute expiration time in milliseconds since the Unix epoch.
    pub expires_at_ms: Option<u64>,
}

impl ScoreRow {
    /// Create a row stamped with the next write timestamp.
    pub fn new(
        slug: impl Into<String>,
        bucket_id: BucketId,
        user_id: impl Into<String>,
        score: i64,
        confidence: u8,
    ) -> Self {
        Self {
            slug: slug.into(),
            bucket_id,
            score,
            user_id: user_id.into(),
            confidence,
            timestamp_micros: next_timestamp_micros(),
            expires_at_ms: None,
        }
    }

    /// Storage key of this row.
    pub fn key(&self) -> RowKey {
        RowKey {
            slug: self.slug.clone(),
            bucket_id: self.bucket_id,
            score: self.score,
            user_id: self.user_id.clone(),
        }
    }

    /// Copy of this row placed in another bucket.
    pub fn with_bucket(&self, bucket_id: BucketId) -> Self {
        Self {
            bucket_id,
            ..self.clone()
        }
    }

    /// Check if the row has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }

    /// Check expiry against a given wall-clock time.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map_or(false, |expires| expires <= now_ms)
    }

    /// Remaining time to live, if the row expires.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        let now = now_ms();
        self.expires_at_ms
            .and_then(|expires| expires.checked_sub(now))
            .map(Duration::from_millis)
    }
}

/// Primary key of a score row: partition (slug, bucket) plus clustering
/// (score, user).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowKey {
    pub slug: String,
    pub bucket_id: BucketId,
    pub score: i64,
    pub user_id: String,
}

/// Durability level requested for a write, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Durability {
    /// Acknowledged by a single replica.
    One,
    /// Acknowledged by a majority of replicas.
    Quorum,
    /// Acknowledged by every replica.
    All,
}

impl Durability {
    /// The strongest level a store offers.
    pub const fn strongest() -> Self {
        Durability::All
    }
}

impl Default for Durability {
    fn default() -> Self {
        Durability::Quorum
    }
}

/// Score predicate applied by a ranged scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreFilter {
    /// Every row of the partition.
    Any,
    /// Rows with `score >= value`.
    AtLeast(i64),
    /// Rows with `score < value`.
    Below(i64),
}

impl ScoreFilter {
    /// Check whether a score passes the filter.
    pub fn matches(&self, score: i64) -> bool {
        match *self {
            ScoreFilter::Any => true,
            ScoreFilter::AtLeast(min) => score >= min,
            ScoreFilter::Below(max) => score < max,
        }
    }
}

/// Direction of a ranged scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    /// Highest score first (natural clustering order).
    Descending,
    /// Lowest score first.
    Ascending,
}

/// Parameters of a ranged scan over one (slug, bucket) partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanQuery {
    pub filter: ScoreFilter,
    pub order: ScanOrder,
    pub limit: Option<usize>,
    pub skip: usize,
}

impl ScanQuery {
    /// Full descending scan.
    pub fn descending() -> Self {
        Self {
            filter: ScoreFilter::Any,
            order: ScanOrder::Descending,
            limit: None,
            skip: 0,
        }
    }

    /// Full ascending scan.
    pub fn ascending() -> Self {
        Self {
            order: ScanOrder::Ascending,
            ..Self::descending()
        }
    }

    /// Restrict to a score predicate.
    pub fn with_filter(mut self, filter: ScoreFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Return at most `limit` rows.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first `skip` matching rows.
    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }
}

/// Global rank of a user within a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rank {
    /// 1-based position, descending by score.
    Ranked(u64),
    /// The user has no live row on the board.
    NotRanked,
}

impl Rank {
    /// The rank as an option.
    pub fn position(&self) -> Option<u64> {
        match self {
            Rank::Ranked(rank) => Some(*rank),
            Rank::NotRanked => None,
        }
    }

    /// Wire representation used by the public API: `-1` when not ranked.
    pub fn to_sentinel(&self) -> i64 {
        match self {
            Rank::Ranked(rank) => i64::try_from(*rank).unwrap_or(i64::MAX),
            Rank::NotRanked => -1,
        }
    }
}

/// A score submitted to a board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreSubmission {
    pub user_id: String,
    pub score: i64,
    pub confidence: u8,
    /// Only replace the current score when the new one is not lower.
    pub high_score_only: bool,
    /// How long the score is kept before it ages out.
    pub ttl: Option<Duration>,
}

impl ScoreSubmission {
    /// Create a plain submission.
    pub fn new(user_id: impl Into<String>, score: i64, confidence: u8) -> Self {
        Self {
            user_id: user_id.into(),
            score,
            confidence,
            high_score_only: false,
            ttl: None,
        }
    }

    /// Keep the best score instead of the latest one.
    pub fn high_score_only(mut self) -> Self {
        self.high_score_only = true;
        self
    }

    /// Expire the score after `ttl`.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Retention given in whole days, as the public API accepts it.
    pub fn with_days_to_keep(self, days: u32) -> Self {
        if days == 0 {
            return self;
        }
        self.with_ttl(Duration::from_secs(u64::from(days) * 24 * 60 * 60))
    }

    /// Options part of the submission.
    pub fn options(&self) -> AddOptions {
        AddOptions {
            high_score_only: self.high_score_only,
            ttl: self.ttl,
        }
    }
}

/// Write policy for a single `add_score` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddOptions {
    pub high_score_only: bool,
    pub ttl: Option<Duration>,
}

/// What an `add_score` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// First score for the user.
    Inserted { bucket_id: BucketId },
    /// Same score and confidence as the current row.
    Unchanged,
    /// Lower than the current score under the high-score-only policy.
    Rejected,
    /// Replaced the current row; `moved_to` is set when the new row crossed
    /// into a neighbouring bucket.
    Updated {
        bucket_id: BucketId,
        moved_to: Option<BucketId>,
    },
}

impl AddOutcome {
    /// Whether the board changed.
    pub fn changed(&self) -> bool {
        matches!(self, AddOutcome::Inserted { .. } | AddOutcome::Updated { .. })
    }
}

/// Opaque position in a full-table scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagingState(pub Bytes);

impl PagingState {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// One page of a full-table scan.
#[derive(Debug, Clone, Default)]
pub struct RowPage {
    pub rows: Vec<ScoreRow>,
    /// Where the next page starts; `None` once the table is exhausted.
    pub paging_state: Option<PagingState>,
}

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Strictly increasing write timestamp in microseconds.
///
/// Two writes from this process never share a timestamp, so "most recent row"
/// is always well defined for them.
pub fn next_timestamp_micros() -> u64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = wall.max(last + 1);
        match LAST_TIMESTAMP.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}
