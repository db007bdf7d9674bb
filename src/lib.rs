//! Segmented rank index for large, continuously updated leaderboards.
//!
//! This crate answers "what is this user's global rank" and "give me the
//! top-K or a window around a user" without ever sorting a whole board:
//! - **Buckets** split every board into fixed-capacity score ranges, so a
//!   rank query scans a single bucket
//! - **Rebalancing** moves overflow rows into the next bucket in the
//!   background
//! - **Deduplication** removes rows left behind by non-atomic updates
//!
//! # Example
//!
//! ```rust,no_run
//! use scoreboard::{InMemoryStore, Leaderboard, LeaderboardConfig, Rank, ScoreSubmission};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LeaderboardConfig::new()
//!         .with_bucket_capacity(1000)
//!         .with_boundary_cache_ttl(Duration::from_secs(5));
//!     let board = Leaderboard::new(Arc::new(InMemoryStore::new()), config)?;
//!
//!     // Keep only personal bests, for thirty days
//!     let submission = ScoreSubmission::new("alice", 4200, 100)
//!         .high_score_only()
//!         .with_days_to_keep(30);
//!     board.add_score("season-1", submission).await?;
//!
//!     if let Rank::Ranked(rank) = board.get_rank("season-1", "alice").await? {
//!         println!("alice is #{rank}");
//!     }
//!
//!     // Top ten
//!     let top = board.get_page("season-1", 0, 10).await?;
//!     println!("{} entries", top.len());
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                Leaderboard                  │
//! │  • add_score    • get_rank                  │
//! │  • get_window   • get_page                  │
//! └─────────────────────────────────────────────┘
//!        │ writes               │ reads
//!        ▼                      ▼
//! ┌───────────────┐      ┌──────────────┐  schedule  ┌──────────────────────┐
//! │ ScoreRegistry │      │  RankEngine  │ ─────────▶ │ MaintenanceScheduler │
//! └───────────────┘      └──────────────┘            │ Rebalancer           │
//!        │                      │                    │ Deduplicator         │
//!        ▼                      ▼                    └──────────────────────┘
//! ┌─────────────────────────────────────────────┐               │
//! │    BucketIndex  (cached boundary records)   │ ◀─────────────┘
//! └─────────────────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌─────────────────────────────────────────────┐
//! │                 ScoreStore                  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - The store offers no multi-row transactions; every update inserts the new
//!   row before deleting the old one
//! - Readers may briefly see a user twice; the most recent row wins
//! - Bucket boundaries may drift between rebalances; ranks stay exact within
//!   a bucket

pub mod config;
pub mod error;
pub mod index;
pub mod leaderboard;
pub mod maintenance;
pub mod metrics;
pub mod migration;
pub mod store;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{LeaderboardConfig, MaintenanceConfig, MigrationConfig};
pub use error::{Error, Result, StoreError};
pub use leaderboard::Leaderboard;
pub use store::{InMemoryStore, ScoreStore};
pub use types::{
    AddOptions, AddOutcome, Bucket, BucketId, Durability, PagingState, Rank, RowKey, RowPage,
    ScanOrder, ScanQuery, ScoreFilter, ScoreRow, ScoreSubmission,
};

// Re-export index types
pub use index::{
    BucketIndex, Deduplicator, RankEngine, RebalanceReport, Rebalancer, Reconciled, ScoreRegistry,
};

// Re-export maintenance types
pub use maintenance::{DeadLetter, IndexMaintenance, MaintenanceRunner, MaintenanceScheduler, MaintenanceTask};

// Re-export metrics types
pub use metrics::{
    Counter, Gauge, Histogram, HistogramSnapshot, HistogramTimer, LabeledCounter,
    LeaderboardMetrics, MetricsSnapshot,
};

// Re-export migration types
pub use migration::{
    CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, MigrationCheckpoint,
    MigrationJob, MigrationMetrics, MigrationReport,
};

// Re-export testing types
pub use testing::TestBoard;
