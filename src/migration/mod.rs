//! Resumable bulk copy of every board from one store into another.
//!
//! The job is independent of the live index: it reads the source with full
//! table paging and writes the destination row by row, preserving bucket
//! assignment, timestamps and expiry. Progress is checkpointed after pages so
//! an interrupted run resumes where the last checkpoint left off.
//!
//! ```text
//! source.all_buckets ──▶ destination.upsert_bucket        (once per job)
//!
//! loop:
//!   source.page_rows(paging_state, page_size)
//!        │ buffer_unordered(concurrency)
//!        ▼
//!   destination.insert(row, durability)
//!        │ every `checkpoint_interval` pages
//!        ▼
//!   checkpoints.save({last_offset, paging_state, ...})
//! ```
//!
//! Re-copying a row is harmless, so a page that failed halfway is simply
//! copied again by the next run.

mod checkpoint;
mod metrics;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, MigrationCheckpoint};
pub use metrics::{MigrationMetrics, MigrationMetricsSnapshot};

use crate::config::MigrationConfig;
use crate::error::{Error, Result};
use crate::store::ScoreStore;
use crate::types::now_ms;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outcome of one run of a migration job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Identifier of this run.
    pub run_id: Uuid,
    pub job_id: String,
    /// Rows already copied by earlier runs when this one started.
    pub resumed_from: u64,
    /// Rows copied by this run.
    pub rows_copied: u64,
    /// Pages copied by this run.
    pub pages_copied: u64,
    /// Bucket records copied by this run.
    pub buckets_copied: usize,
    /// The checkpoint said the job was done before this run started.
    pub already_complete: bool,
    pub elapsed: Duration,
}

/// Copies bucket records and score rows between two stores.
pub struct MigrationJob {
    source: Arc<dyn ScoreStore>,
    destination: Arc<dyn ScoreStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: MigrationConfig,
    metrics: Arc<MigrationMetrics>,
    cancel: CancellationToken,
}

impl MigrationJob {
    /// Create a job.
    pub fn new(
        source: Arc<dyn ScoreStore>,
        destination: Arc<dyn ScoreStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: MigrationConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            destination,
            checkpoints,
            config,
            metrics: Arc::new(MigrationMetrics::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Stop the job between pages when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn metrics(&self) -> &Arc<MigrationMetrics> {
        &self.metrics
    }

    /// Run the job until the source is exhausted, resuming from the last
    /// checkpoint.
    ///
    /// On cancellation the current progress is checkpointed and
    /// [`Error::Cancelled`] is returned.
    #[tracing::instrument(skip(self), fields(job_id = %self.config.job_id))]
    pub async fn run(&self) -> Result<MigrationReport> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let job_id = self.config.job_id.clone();

        let mut checkpoint = self
            .checkpoints
            .load(&job_id)
            .await?
            .unwrap_or_else(|| MigrationCheckpoint::new(job_id.clone()));

        let mut report = MigrationReport {
            run_id,
            job_id: job_id.clone(),
            resumed_from: checkpoint.last_offset,
            rows_copied: 0,
            pages_copied: 0,
            buckets_copied: 0,
            already_complete: checkpoint.completed,
            elapsed: Duration::ZERO,
        };

        if checkpoint.completed {
            tracing::info!(%run_id, rows = checkpoint.last_offset, "Migration already complete");
            report.elapsed = started.elapsed();
            return Ok(report);
        }

        tracing::info!(
            %run_id,
            resumed_from = checkpoint.last_offset,
            page_size = self.config.page_size,
            concurrency = self.config.concurrency,
            "Starting migration"
        );

        self.destination.ensure_schema().await?;

        if !checkpoint.buckets_copied {
            let buckets = self.source.all_buckets().await?;
            for bucket in &buckets {
                self.destination.upsert_bucket(bucket).await?;
            }
            self.metrics.buckets_copied.inc_by(buckets.len() as u64);
            report.buckets_copied = buckets.len();

            checkpoint.buckets_copied = true;
            self.save(&mut checkpoint).await?;
            tracing::info!(%run_id, buckets = buckets.len(), "Copied bucket records");
        }

        let mut pages_since_checkpoint = 0;
        loop {
            if self.cancel.is_cancelled() {
                self.save(&mut checkpoint).await?;
                tracing::warn!(%run_id, last_offset = checkpoint.last_offset, "Migration cancelled");
                return Err(Error::Cancelled);
            }

            let timer = self.metrics.page_duration.start_timer();
            let page = self
                .source
                .page_rows(checkpoint.paging_state.as_ref(), self.config.page_size)
                .await?;
            let rows = page.rows.len();

            let failures = stream::iter(page.rows.iter().cloned())
                .map(|row| async move { self.destination.insert(&row, self.config.durability, None).await })
                .buffer_unordered(self.config.concurrency)
                .filter_map(|result| async move { result.err() })
                .collect::<Vec<_>>()
                .await;
            if let Some(e) = failures.into_iter().next() {
                self.metrics.write_failures.inc();
                tracing::error!(
                    %run_id,
                    last_offset = checkpoint.last_offset,
                    error = %e,
                    "Failed to copy page"
                );
                return Err(e);
            }
            timer.observe();

            checkpoint.last_offset += rows as u64;
            checkpoint.paging_state = page.paging_state;
            report.rows_copied += rows as u64;
            report.pages_copied += 1;
            self.metrics.rows_copied.inc_by(rows as u64);
            self.metrics.pages_copied.inc();
            pages_since_checkpoint += 1;

            tracing::debug!(%run_id, rows, last_offset = checkpoint.last_offset, "Copied page");

            if checkpoint.paging_state.is_none() {
                checkpoint.completed = true;
                self.save(&mut checkpoint).await?;
                break;
            }
            if pages_since_checkpoint >= self.config.checkpoint_interval {
                self.save(&mut checkpoint).await?;
                pages_since_checkpoint = 0;
            }
        }

        self.metrics.runs_completed.inc();
        report.elapsed = started.elapsed();
        tracing::info!(
            %run_id,
            rows = report.rows_copied,
            total = checkpoint.last_offset,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Migration complete"
        );
        Ok(report)
    }

    async fn save(&self, checkpoint: &mut MigrationCheckpoint) -> Result<()> {
        checkpoint.updated_at_ms = now_ms();
        self.checkpoints.save(checkpoint).await?;
        self.metrics.checkpoints_saved.inc();
        Ok(())
    }
}

impl std::fmt::Debug for MigrationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationJob")
            .field("job_id", &self.config.job_id)
            .field("page_size", &self.config.page_size)
            .field("concurrency", &self.config.concurrency)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::{Bucket, Durability, ScoreRow};

    async fn source_with(rows: usize) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::with_schema());
        store.upsert_bucket(&Bucket::new("alpha", 0, 100)).await.unwrap();
        store.upsert_bucket(&Bucket::unbounded("alpha", 1)).await.unwrap();
        for i in 0..rows {
            let slug = if i % 3 == 0 { "beta" } else { "alpha" };
            let mut row = ScoreRow::new(slug, (i % 2) as u64, format!("user-{i}"), i as i64, 7);
            if i % 5 == 0 {
                row.expires_at_ms = Some(now_ms() + 3_600_000);
            }
            store.insert(&row, Durability::Quorum, None).await.unwrap();
        }
        store
    }

    async fn all_rows(store: &InMemoryStore) -> Vec<ScoreRow> {
        let mut rows = Vec::new();
        let mut state = None;
        loop {
            let page = store.page_rows(state.as_ref(), 7).await.unwrap();
            rows.extend(page.rows);
            match page.paging_state {
                Some(next) => state = Some(next),
                None => break,
            }
        }
        rows.sort_by(|a, b| (&a.slug, a.bucket_id, &a.user_id).cmp(&(&b.slug, b.bucket_id, &b.user_id)));
        rows
    }

    fn config() -> MigrationConfig {
        MigrationConfig::new("test-job").with_page_size(10).with_concurrency(1)
    }

    #[tokio::test]
    async fn test_copies_everything() {
        let source = source_with(25).await;
        let destination = Arc::new(InMemoryStore::new());
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let job = MigrationJob::new(source.clone(), destination.clone(), checkpoints.clone(), config()).unwrap();

        let report = job.run().await.unwrap();
        assert_eq!(report.rows_copied, 25);
        assert_eq!(report.pages_copied, 3);
        assert_eq!(report.buckets_copied, 2);

        assert_eq!(all_rows(&destination).await, all_rows(&source).await);
        assert_eq!(destination.buckets_for("alpha").await.unwrap().len(), 2);

        let checkpoint = checkpoints.load("test-job").await.unwrap().unwrap();
        assert!(checkpoint.completed);
        assert_eq!(checkpoint.last_offset, 25);

        // A completed job is a no-op.
        let again = job.run().await.unwrap();
        assert!(again.already_complete);
        assert_eq!(again.rows_copied, 0);
        assert_ne!(again.run_id, report.run_id);
    }

    #[tokio::test]
    async fn test_resumes_after_failure() {
        let source = source_with(25).await;
        let destination = Arc::new(InMemoryStore::new());
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let job = MigrationJob::new(source.clone(), destination.clone(), checkpoints.clone(), config()).unwrap();

        // Two bucket records, one full page, then half of the second page.
        destination.fail_writes_after(Some(2 + 15));
        assert!(job.run().await.is_err());
        assert_eq!(job.metrics().write_failures.get(), 1);

        let checkpoint = checkpoints.load("test-job").await.unwrap().unwrap();
        assert_eq!(checkpoint.last_offset, 10);
        assert!(!checkpoint.completed);

        destination.fail_writes_after(None);
        let report = job.run().await.unwrap();
        assert_eq!(report.resumed_from, 10);
        assert_eq!(report.rows_copied, 15);
        assert_eq!(report.buckets_copied, 0);
        assert_eq!(all_rows(&destination).await, all_rows(&source).await);
    }

    #[tokio::test]
    async fn test_cancellation_checkpoints_progress() {
        let source = source_with(25).await;
        let destination = Arc::new(InMemoryStore::new());
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let cancel = CancellationToken::new();
        let job = MigrationJob::new(source, destination.clone(), checkpoints.clone(), config())
            .unwrap()
            .with_cancellation(cancel.clone());

        cancel.cancel();
        assert!(matches!(job.run().await, Err(Error::Cancelled)));

        let checkpoint = checkpoints.load("test-job").await.unwrap().unwrap();
        assert!(checkpoint.buckets_copied);
        assert_eq!(checkpoint.last_offset, 0);
        assert_eq!(destination.board_len("alpha"), 0);
    }

    #[tokio::test]
    async fn test_file_checkpoints_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_with(12).await;
        let destination = Arc::new(InMemoryStore::new());

        {
            let checkpoints = Arc::new(FileCheckpointStore::new(dir.path()).await.unwrap());
            let job = MigrationJob::new(source.clone(), destination.clone(), checkpoints, config()).unwrap();
            job.run().await.unwrap();
        }

        let checkpoints = Arc::new(FileCheckpointStore::new(dir.path()).await.unwrap());
        let job = MigrationJob::new(source, destination, checkpoints, config()).unwrap();
        assert!(job.run().await.unwrap().already_complete);
    }

    #[test]
    fn test_invalid_config() {
        let store: Arc<dyn ScoreStore> = Arc::new(InMemoryStore::new());
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let config = MigrationConfig::new("job").with_page_size(0);
        assert!(MigrationJob::new(store.clone(), store, checkpoints, config).is_err());
    }
}
