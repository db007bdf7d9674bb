//! Configuration types for the leaderboard index.

use crate::error::{Error, Result};
use crate::types::Durability;
use std::time::Duration;

/// Main configuration for a [`crate::Leaderboard`].
#[derive(Debug, Clone)]
pub struct LeaderboardConfig {
    /// Live rows a bucket may hold before it is rebalanced.
    pub bucket_capacity: usize,

    /// Rows fetched through the user index when looking up a user.
    pub user_lookup_limit: usize,

    /// Rows scanned per bucket by the deduplicator.
    pub dedup_scan_limit: usize,

    /// Durability for score inserts and deletes.
    pub write_durability: Durability,

    /// Durability for rows moved between buckets.
    pub move_durability: Durability,

    /// Maximum number of boards whose boundaries are cached.
    pub boundary_cache_capacity: u64,

    /// How long cached bucket boundaries are trusted.
    pub boundary_cache_ttl: Duration,

    /// Background maintenance configuration.
    pub maintenance: MaintenanceConfig,
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self {
            bucket_capacity: 1000,
            user_lookup_limit: 10,
            dedup_scan_limit: 2000,
            write_durability: Durability::Quorum,
            move_durability: Durability::strongest(),
            boundary_cache_capacity: 10_000,
            boundary_cache_ttl: Duration::from_secs(5),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl LeaderboardConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bucket capacity.
    pub fn with_bucket_capacity(mut self, capacity: usize) -> Self {
        self.bucket_capacity = capacity;
        self
    }

    /// Set how many rows are fetched per user lookup.
    pub fn with_user_lookup_limit(mut self, limit: usize) -> Self {
        self.user_lookup_limit = limit;
        self
    }

    /// Set how many rows the deduplicator scans per bucket.
    pub fn with_dedup_scan_limit(mut self, limit: usize) -> Self {
        self.dedup_scan_limit = limit;
        self
    }

    /// Set the durability for score writes.
    pub fn with_write_durability(mut self, durability: Durability) -> Self {
        self.write_durability = durability;
        self
    }

    /// Set the durability for row moves.
    pub fn with_move_durability(mut self, durability: Durability) -> Self {
        self.move_durability = durability;
        self
    }

    /// Set the boundary cache TTL.
    pub fn with_boundary_cache_ttl(mut self, ttl: Duration) -> Self {
        self.boundary_cache_ttl = ttl;
        self
    }

    /// Set the maintenance configuration.
    pub fn with_maintenance_config(mut self, maintenance: MaintenanceConfig) -> Self {
        self.maintenance = maintenance;
        self
    }

    /// Check the configuration for values the index cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_capacity == 0 {
            return Err(Error::Config("bucket_capacity must be positive".into()));
        }
        if self.user_lookup_limit == 0 {
            return Err(Error::Config("user_lookup_limit must be positive".into()));
        }
        if self.dedup_scan_limit < self.bucket_capacity {
            return Err(Error::Config(format!(
                "dedup_scan_limit ({}) must cover a full bucket ({})",
                self.dedup_scan_limit, self.bucket_capacity
            )));
        }
        self.maintenance.validate()
    }
}

/// Background maintenance configuration.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Row moves executed concurrently during one rebalance.
    pub move_concurrency: usize,

    /// Retries after the first failed attempt of a task.
    pub max_retries: u32,

    /// Delay before the first retry; doubles on every further retry.
    pub retry_backoff: Duration,

    /// Upper bound for the retry delay.
    pub max_retry_backoff: Duration,

    /// Failed tasks kept for inspection.
    pub dead_letter_capacity: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            move_concurrency: 16,
            max_retries: 2,
            retry_backoff: Duration::from_millis(100),
            max_retry_backoff: Duration::from_secs(5),
            dead_letter_capacity: 100,
        }
    }
}

impl MaintenanceConfig {
    /// Set the worker pool size for row moves.
    pub fn with_move_concurrency(mut self, concurrency: usize) -> Self {
        self.move_concurrency = concurrency;
        self
    }

    /// Set the number of retries.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the initial retry backoff.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Backoff before retry number `attempt` (1-based), without jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.max_retry_backoff)
    }

    fn validate(&self) -> Result<()> {
        if self.move_concurrency == 0 {
            return Err(Error::Config("move_concurrency must be positive".into()));
        }
        Ok(())
    }
}

/// Configuration for the bulk migration job.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Identifier under which progress is checkpointed.
    pub job_id: String,

    /// Rows read from the source per page.
    pub page_size: usize,

    /// Rows written to the destination concurrently.
    pub concurrency: usize,

    /// Durability of destination writes.
    pub durability: Durability,

    /// Pages copied between two checkpoint writes.
    pub checkpoint_interval: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            job_id: "default".to_string(),
            page_size: 1000,
            concurrency: 30,
            durability: Durability::Quorum,
            checkpoint_interval: 1,
        }
    }
}

impl MigrationConfig {
    /// Create a configuration for the given job.
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Default::default()
        }
    }

    /// Set the page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the write concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set how many pages are copied between checkpoints.
    pub fn with_checkpoint_interval(mut self, pages: usize) -> Self {
        self.checkpoint_interval = pages;
        self
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.concurrency == 0 || self.checkpoint_interval == 0 {
            return Err(Error::Config(
                "page_size, concurrency and checkpoint_interval must be positive".into(),
            ));
        }
        if self.job_id.is_empty() {
            return Err(Error::Config("job_id must not be empty".into()));
        }
        Ok(())
    }
}
