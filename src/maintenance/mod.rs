//! Background maintenance of the rank index.
//!
//! Reads and writes discover work (overflowing buckets, duplicate rows, rows
//! sitting one bucket too low) but never do it themselves. They hand a
//! [`MaintenanceTask`] to the [`MaintenanceScheduler`], which runs it later:
//!
//! ```text
//!  get_rank / get_page / add_score
//!             │ schedule(slug, task)        identical pending task: coalesced
//!             ▼
//!  ┌─────────────────────┐
//!  │ pending (slug,task) │
//!  └─────────────────────┘
//!             │ per-board lock, one task per board at a time
//!             ▼
//!  ┌─────────────────────┐   failure   ┌──────────────────────────┐
//!  │  MaintenanceRunner  │ ──────────▶ │ retry with backoff       │
//!  └─────────────────────┘             │ then dead-letter log     │
//!                                      └──────────────────────────┘
//! ```
//!
//! Failures never reach the caller that discovered the work.

mod runner;
mod scheduler;

pub use runner::IndexMaintenance;
pub use scheduler::{DeadLetter, MaintenanceScheduler};

use crate::error::Result;
use crate::types::BucketId;
use async_trait::async_trait;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// A unit of background work on one board.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MaintenanceTask {
    /// Move overflow rows of a bucket into the next one.
    Rebalance { bucket_id: BucketId },
    /// Delete duplicate rows inside a bucket.
    CleanBucket { bucket_id: BucketId },
    /// Delete every row of a user except the most recent.
    CleanUser { user_id: String },
    /// Move a user's row one bucket up if it still qualifies.
    Promote { user_id: String },
}

impl MaintenanceTask {
    /// Short name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            MaintenanceTask::Rebalance { .. } => "rebalance",
            MaintenanceTask::CleanBucket { .. } => "clean_bucket",
            MaintenanceTask::CleanUser { .. } => "clean_user",
            MaintenanceTask::Promote { .. } => "promote",
        }
    }
}

impl fmt::Display for MaintenanceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaintenanceTask::Rebalance { bucket_id } | MaintenanceTask::CleanBucket { bucket_id } => {
                write!(f, "{}(bucket={})", self.name(), bucket_id)
            }
            MaintenanceTask::CleanUser { user_id } | MaintenanceTask::Promote { user_id } => {
                write!(f, "{}(user={})", self.name(), user_id)
            }
        }
    }
}

/// Executes maintenance tasks for the scheduler.
#[async_trait]
pub trait MaintenanceRunner: Send + Sync + fmt::Debug {
    /// Run one task. Long tasks check `cancel` between steps and return
    /// [`crate::Error::Cancelled`] once it fires.
    async fn run(&self, slug: &str, task: &MaintenanceTask, cancel: &CancellationToken) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_display() {
        assert_eq!(MaintenanceTask::Rebalance { bucket_id: 3 }.to_string(), "rebalance(bucket=3)");
        assert_eq!(
            MaintenanceTask::CleanUser { user_id: "u1".into() }.to_string(),
            "clean_user(user=u1)"
        );
        assert_eq!(MaintenanceTask::Promote { user_id: "u".into() }.name(), "promote");
    }
}
