//! Leaderboard facade.
//!
//! Wires the index components together over one store and exposes the four
//! operations an API layer needs.

use crate::config::LeaderboardConfig;
use crate::error::{Error, Result};
use crate::index::{BucketIndex, Deduplicator, RankEngine, Rebalancer, ScoreRegistry};
use crate::maintenance::{IndexMaintenance, MaintenanceScheduler};
use crate::metrics::LeaderboardMetrics;
use crate::store::ScoreStore;
use crate::types::{AddOutcome, Rank, ScoreRow, ScoreSubmission};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;

/// Ranked score boards over a [`ScoreStore`].
///
/// # Example
///
/// ```rust,no_run
/// use scoreboard::{InMemoryStore, Leaderboard, LeaderboardConfig, ScoreSubmission};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> scoreboard::Result<()> {
///     let store = Arc::new(InMemoryStore::new());
///     let board = Leaderboard::new(store, LeaderboardConfig::default())?;
///
///     board.add_score("weekly", ScoreSubmission::new("alice", 1200, 100)).await?;
///     board.add_score("weekly", ScoreSubmission::new("bob", 900, 100)).await?;
///
///     let rank = board.get_rank("weekly", "bob").await?;
///     println!("bob is ranked {}", rank.to_sentinel());
///     Ok(())
/// }
/// ```
pub struct Leaderboard {
    store: Arc<dyn ScoreStore>,
    config: Arc<LeaderboardConfig>,
    index: BucketIndex,
    registry: ScoreRegistry,
    ranks: RankEngine,
    rebalancer: Rebalancer,
    deduplicator: Deduplicator,
    scheduler: MaintenanceScheduler,
    metrics: Arc<LeaderboardMetrics>,
    schema: OnceCell<()>,
}

impl Leaderboard {
    /// Create a leaderboard over `store`. Must be called within a tokio
    /// runtime once scores are written or read.
    pub fn new(store: Arc<dyn ScoreStore>, config: LeaderboardConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let metrics = Arc::new(LeaderboardMetrics::new());

        let index = BucketIndex::new(store.clone(), &config);
        let rebalancer = Rebalancer::new(store.clone(), index.clone(), config.clone());
        let deduplicator = Deduplicator::new(store.clone(), config.clone());

        let runner = IndexMaintenance::new(rebalancer.clone(), deduplicator.clone(), metrics.clone());
        let scheduler = MaintenanceScheduler::new(
            Arc::new(runner),
            config.maintenance.clone(),
            metrics.clone(),
        );

        let registry = ScoreRegistry::new(
            store.clone(),
            index.clone(),
            rebalancer.clone(),
            scheduler.clone(),
            config.clone(),
        );
        let ranks = RankEngine::new(store.clone(), index.clone(), scheduler.clone(), config.clone());

        tracing::info!(
            bucket_capacity = config.bucket_capacity,
            write_durability = ?config.write_durability,
            move_durability = ?config.move_durability,
            "Created leaderboard"
        );

        Ok(Self {
            store,
            config,
            index,
            registry,
            ranks,
            rebalancer,
            deduplicator,
            scheduler,
            metrics,
            schema: OnceCell::new(),
        })
    }

    /// Record a score.
    pub async fn add_score(&self, slug: &str, submission: ScoreSubmission) -> Result<AddOutcome> {
        let start = Instant::now();
        let result = async {
            self.bootstrap().await?;
            self.registry
                .add_score(
                    slug,
                    &submission.user_id,
                    submission.score,
                    submission.confidence,
                    submission.options(),
                )
                .await
        }
        .await;

        match &result {
            Ok(outcome) => self.metrics.record_add(outcome, start.elapsed()),
            Err(e) => self.metrics.record_error(e.kind()),
        }
        result
    }

    /// Global rank of a user.
    pub async fn get_rank(&self, slug: &str, user_id: &str) -> Result<Rank> {
        let start = Instant::now();
        let result = async {
            self.bootstrap().await?;
            self.ranks.get_rank(slug, user_id).await
        }
        .await;

        match &result {
            Ok(rank) => self.metrics.record_rank(rank, start.elapsed()),
            Err(e) => self.metrics.record_error(e.kind()),
        }
        result
    }

    /// Rows around a user, ascending by score.
    pub async fn get_window(
        &self,
        slug: &str,
        user_id: &str,
        before: usize,
        after: usize,
    ) -> Result<Vec<ScoreRow>> {
        self.metrics.window_queries.inc();
        let result = async {
            self.bootstrap().await?;
            self.ranks.get_window(slug, user_id, before, after).await
        }
        .await;

        if let Err(e) = &result {
            self.metrics.record_error(e.kind());
        }
        result
    }

    /// Rows starting at a global position, highest first.
    pub async fn get_page(&self, slug: &str, offset: u64, limit: usize) -> Result<Vec<ScoreRow>> {
        self.metrics.page_queries.inc();
        let result = async {
            self.bootstrap().await?;
            self.ranks.get_page(slug, offset, limit).await
        }
        .await;

        if let Err(e) = &result {
            self.metrics.record_error(e.kind());
        }
        result
    }

    /// Wait until background maintenance has drained.
    pub async fn wait_for_maintenance(&self) {
        self.scheduler.idle().await;
    }

    /// Stop background maintenance.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    pub fn config(&self) -> &LeaderboardConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<LeaderboardMetrics> {
        &self.metrics
    }

    pub fn scheduler(&self) -> &MaintenanceScheduler {
        &self.scheduler
    }

    pub fn index(&self) -> &BucketIndex {
        &self.index
    }

    pub fn rebalancer(&self) -> &Rebalancer {
        &self.rebalancer
    }

    pub fn deduplicator(&self) -> &Deduplicator {
        &self.deduplicator
    }

    /// Create tables once per process. A failed attempt is retried by the
    /// next call.
    async fn bootstrap(&self) -> Result<()> {
        self.schema
            .get_or_try_init(|| async {
                self.store.ensure_schema().await?;
                tracing::info!("Leaderboard schema ready");
                Ok::<_, Error>(())
            })
            .await
            .map(|_| ())
    }
}

impl std::fmt::Debug for Leaderboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leaderboard")
            .field("store", &self.store)
            .field("bucket_capacity", &self.config.bucket_capacity)
            .field("schema_ready", &self.schema.initialized())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
