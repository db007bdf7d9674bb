//! Maintenance runner backed by the rank index.

use super::{MaintenanceRunner, MaintenanceTask};
use crate::error::{Error, Result};
use crate::index::{Deduplicator, Rebalancer};
use crate::metrics::LeaderboardMetrics;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Executes maintenance tasks with the index's rebalancer and deduplicator.
#[derive(Debug, Clone)]
pub struct IndexMaintenance {
    rebalancer: Rebalancer,
    deduplicator: Deduplicator,
    metrics: Arc<LeaderboardMetrics>,
}

impl IndexMaintenance {
    pub fn new(rebalancer: Rebalancer, deduplicator: Deduplicator, metrics: Arc<LeaderboardMetrics>) -> Self {
        Self {
            rebalancer,
            deduplicator,
            metrics,
        }
    }

    /// Rebalance a bucket and keep going down while rows spill over.
    async fn rebalance_from(&self, slug: &str, bucket_id: u64, cancel: &CancellationToken) -> Result<()> {
        let mut bucket_id = bucket_id;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let report = self.rebalancer.rebalance(slug, bucket_id, cancel).await?;
            if report.is_noop() {
                return Ok(());
            }
            self.metrics.record_rebalance(report.moved);
            bucket_id += 1;
        }
    }
}

#[async_trait]
impl MaintenanceRunner for IndexMaintenance {
    async fn run(&self, slug: &str, task: &MaintenanceTask, cancel: &CancellationToken) -> Result<()> {
        match task {
            MaintenanceTask::Rebalance { bucket_id } => {
                self.rebalance_from(slug, *bucket_id, cancel).await?;
            }
            MaintenanceTask::CleanBucket { bucket_id } => {
                let removed = self.deduplicator.clean_bucket(slug, *bucket_id).await?;
                self.metrics.duplicates_removed.inc_by(removed as u64);
            }
            MaintenanceTask::CleanUser { user_id } => {
                let removed = self.deduplicator.clean_user(slug, user_id).await?;
                self.metrics.duplicates_removed.inc_by(removed as u64);
            }
            MaintenanceTask::Promote { user_id } => {
                if self.rebalancer.promote(slug, user_id).await?.is_some() {
                    self.metrics.promotions.inc();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeaderboardConfig;
    use crate::index::BucketIndex;
    use crate::store::{InMemoryStore, ScoreStore};
    use crate::types::{Durability, ScoreRow};

    #[tokio::test]
    async fn test_rebalance_cascades_on_spawned_task() {
        let store = Arc::new(InMemoryStore::with_schema());
        let config = Arc::new(LeaderboardConfig::new().with_bucket_capacity(10));
        let index = BucketIndex::new(store.clone(), &config);
        index.resolve_bucket("board", 0).await.unwrap();
        for score in 0..25 {
            let row = ScoreRow::new("board", 0, format!("u{score}"), score, 1);
            store.insert(&row, Durability::Quorum, None).await.unwrap();
        }

        let metrics = Arc::new(LeaderboardMetrics::new());
        let runner = IndexMaintenance::new(
            Rebalancer::new(store.clone(), index.clone(), config.clone()),
            Deduplicator::new(store.clone(), config),
            metrics.clone(),
        );

        // The scheduler spawns tasks, so the future must be Send.
        tokio::spawn(async move {
            runner
                .run("board", &MaintenanceTask::Rebalance { bucket_id: 0 }, &CancellationToken::new())
                .await
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(store.bucket_len("board", 0), 10);
        assert_eq!(store.bucket_len("board", 1), 10);
        assert_eq!(store.bucket_len("board", 2), 5);
        assert_eq!(metrics.rebalances.get(), 2);
        assert_eq!(metrics.rows_moved.get(), 20);
    }
}
