//! Metrics for migration jobs.

use crate::metrics::{Counter, Histogram, HistogramSnapshot, MAINTENANCE_DURATION_BUCKETS};
use std::fmt::Write as _;

/// Progress counters of the migration job.
#[derive(Debug)]
pub struct MigrationMetrics {
    pub rows_copied: Counter,
    pub pages_copied: Counter,
    pub buckets_copied: Counter,
    pub checkpoints_saved: Counter,
    /// Rows whose destination write failed.
    pub write_failures: Counter,
    pub runs_completed: Counter,
    pub page_duration: Histogram,
}

impl MigrationMetrics {
    pub fn new() -> Self {
        Self {
            rows_copied: Counter::new("migration_rows_copied_total", "Rows written to the destination"),
            pages_copied: Counter::new("migration_pages_copied_total", "Source pages fully copied"),
            buckets_copied: Counter::new("migration_buckets_copied_total", "Bucket records copied"),
            checkpoints_saved: Counter::new("migration_checkpoints_saved_total", "Checkpoints persisted"),
            write_failures: Counter::new("migration_write_failures_total", "Failed destination writes"),
            runs_completed: Counter::new("migration_runs_completed_total", "Runs that reached the end of the source"),
            page_duration: Histogram::with_buckets(
                "migration_page_duration_seconds",
                "Time to copy one page",
                MAINTENANCE_DURATION_BUCKETS.to_vec(),
            ),
        }
    }

    pub fn snapshot(&self) -> MigrationMetricsSnapshot {
        MigrationMetricsSnapshot {
            rows_copied: self.rows_copied.get(),
            pages_copied: self.pages_copied.get(),
            buckets_copied: self.buckets_copied.get(),
            checkpoints_saved: self.checkpoints_saved.get(),
            write_failures: self.write_failures.get(),
            page_duration: self.page_duration.snapshot(),
        }
    }

    /// Format counters in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        for counter in [
            &self.rows_copied,
            &self.pages_copied,
            &self.buckets_copied,
            &self.checkpoints_saved,
            &self.write_failures,
            &self.runs_completed,
        ] {
            let _ = write!(
                output,
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n",
                name = counter.name(),
                help = counter.help(),
                value = counter.get()
            );
        }
        output
    }
}

impl Default for MigrationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of migration metrics.
#[derive(Debug, Clone)]
pub struct MigrationMetricsSnapshot {
    pub rows_copied: u64,
    pub pages_copied: u64,
    pub buckets_copied: u64,
    pub checkpoints_saved: u64,
    pub write_failures: u64,
    pub page_duration: HistogramSnapshot,
}
