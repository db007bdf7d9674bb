//! Segmented rank index.
//!
//! A board's scores are split into fixed-capacity buckets ordered by score:
//!
//! ```text
//!   bucket 0          bucket 1          bucket 2
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │ floor 9_120  │  │ floor 4_310  │  │ floor MIN    │
//! │ ranks 1-1000 │  │ 1001-2000    │  │ 2001-...     │
//! └──────────────┘  └──────────────┘  └──────────────┘
//! ```
//!
//! Bucket 0 is unbounded above and the deepest bucket always has an unbounded
//! floor. A rank query scans a single bucket, so it costs O(capacity) no
//! matter how large the board grows.
//!
//! - [`BucketIndex`]: boundary records and score-to-bucket resolution
//! - [`ScoreRegistry`]: score writes
//! - [`RankEngine`]: rank, window and page reads
//! - [`Rebalancer`]: row moves and overflow handling
//! - [`Deduplicator`]: removal of superseded rows

pub mod bucket;
pub mod dedup;
pub mod rank;
pub mod rebalance;
pub mod registry;

pub use bucket::BucketIndex;
pub use dedup::{dedup_latest, reconcile, Deduplicator, Reconciled};
pub use rank::RankEngine;
pub use rebalance::{RebalanceReport, Rebalancer};
pub use registry::ScoreRegistry;
