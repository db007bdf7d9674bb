//! Metrics for monitoring the leaderboard index.
//!
//! Prometheus-style instruments grouped by concern:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     LeaderboardMetrics                        │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────┐  │
//! │  │  Writes      │  │  Reads       │  │  Maintenance       │  │
//! │  │ - inserted   │  │ - rank       │  │ - scheduled        │  │
//! │  │ - updated    │  │ - not ranked │  │ - coalesced        │  │
//! │  │ - rejected   │  │ - window     │  │ - failed / retried │  │
//! │  │ - unchanged  │  │ - page       │  │ - rows moved       │  │
//! │  └──────────────┘  └──────────────┘  └────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Maintenance failures are never surfaced to callers, so the maintenance
//! counters are the place to watch for boards that keep failing to rebalance.

mod instruments;

pub use instruments::{
    Counter, Gauge, Histogram, HistogramSnapshot, HistogramTimer, LabeledCounter,
    MAINTENANCE_DURATION_BUCKETS, OPERATION_LATENCY_BUCKETS,
};

use crate::types::{AddOutcome, Rank};
use std::fmt::Write as _;
use std::time::Duration;

/// Metrics for the leaderboard index and its maintenance.
#[derive(Debug)]
pub struct LeaderboardMetrics {
    // Writes
    pub scores_inserted: Counter,
    pub scores_updated: Counter,
    pub scores_unchanged: Counter,
    pub scores_rejected: Counter,
    /// Updated rows that crossed into a neighbouring bucket.
    pub boundary_moves: Counter,
    pub add_latency: Histogram,

    // Reads
    pub rank_queries: Counter,
    pub rank_not_ranked: Counter,
    pub window_queries: Counter,
    pub page_queries: Counter,
    pub rank_latency: Histogram,

    // Maintenance
    pub maintenance_scheduled: Counter,
    /// Schedule requests folded into an identical pending task.
    pub maintenance_coalesced: Counter,
    pub maintenance_completed: Counter,
    pub maintenance_failed: Counter,
    pub maintenance_retries: Counter,
    pub maintenance_in_flight: Gauge,
    pub maintenance_duration: Histogram,
    pub rebalances: Counter,
    pub rows_moved: Counter,
    pub promotions: Counter,
    pub duplicates_removed: Counter,

    /// Errors by kind.
    pub errors: LabeledCounter<1>,
}

impl LeaderboardMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            scores_inserted: Counter::new("leaderboard_scores_inserted_total", "First scores recorded for a user"),
            scores_updated: Counter::new("leaderboard_scores_updated_total", "Scores that replaced an existing row"),
            scores_unchanged: Counter::new("leaderboard_scores_unchanged_total", "Idempotent score writes"),
            scores_rejected: Counter::new("leaderboard_scores_rejected_total", "Scores rejected by the high score policy"),
            boundary_moves: Counter::new("leaderboard_boundary_moves_total", "Updated rows moved to a neighbouring bucket"),
            add_latency: Histogram::with_buckets(
                "leaderboard_add_latency_seconds",
                "add_score latency",
                OPERATION_LATENCY_BUCKETS.to_vec(),
            ),

            rank_queries: Counter::new("leaderboard_rank_queries_total", "Rank lookups"),
            rank_not_ranked: Counter::new("leaderboard_rank_not_ranked_total", "Rank lookups for users without a score"),
            window_queries: Counter::new("leaderboard_window_queries_total", "Window reads"),
            page_queries: Counter::new("leaderboard_page_queries_total", "Page reads"),
            rank_latency: Histogram::with_buckets(
                "leaderboard_rank_latency_seconds",
                "get_rank latency",
                OPERATION_LATENCY_BUCKETS.to_vec(),
            ),

            maintenance_scheduled: Counter::new("leaderboard_maintenance_scheduled_total", "Maintenance tasks scheduled"),
            maintenance_coalesced: Counter::new("leaderboard_maintenance_coalesced_total", "Schedule requests merged into a pending task"),
            maintenance_completed: Counter::new("leaderboard_maintenance_completed_total", "Maintenance tasks completed"),
            maintenance_failed: Counter::new("leaderboard_maintenance_failed_total", "Maintenance tasks that exhausted their retries"),
            maintenance_retries: Counter::new("leaderboard_maintenance_retries_total", "Maintenance task retries"),
            maintenance_in_flight: Gauge::new("leaderboard_maintenance_in_flight", "Maintenance tasks pending or running"),
            maintenance_duration: Histogram::with_buckets(
                "leaderboard_maintenance_duration_seconds",
                "Maintenance task duration",
                MAINTENANCE_DURATION_BUCKETS.to_vec(),
            ),
            rebalances: Counter::new("leaderboard_rebalances_total", "Buckets rebalanced"),
            rows_moved: Counter::new("leaderboard_rows_moved_total", "Rows moved between buckets"),
            promotions: Counter::new("leaderboard_promotions_total", "Rows promoted to a higher bucket"),
            duplicates_removed: Counter::new("leaderboard_duplicates_removed_total", "Stale duplicate rows deleted"),

            errors: LabeledCounter::new("leaderboard_errors_total", "Errors by kind", ["kind"]),
        }
    }

    /// Record an `add_score` call.
    pub fn record_add(&self, outcome: &AddOutcome, latency: Duration) {
        match outcome {
            AddOutcome::Inserted { .. } => self.scores_inserted.inc(),
            AddOutcome::Unchanged => self.scores_unchanged.inc(),
            AddOutcome::Rejected => self.scores_rejected.inc(),
            AddOutcome::Updated { moved_to, .. } => {
                self.scores_updated.inc();
                if moved_to.is_some() {
                    self.boundary_moves.inc();
                }
            }
        }
        self.add_latency.observe_duration(latency);
    }

    /// Record a `get_rank` call.
    pub fn record_rank(&self, rank: &Rank, latency: Duration) {
        self.rank_queries.inc();
        if *rank == Rank::NotRanked {
            self.rank_not_ranked.inc();
        }
        self.rank_latency.observe_duration(latency);
    }

    /// Record a completed rebalance.
    pub fn record_rebalance(&self, moved: usize) {
        self.rebalances.inc();
        self.rows_moved.inc_by(moved as u64);
    }

    /// Record an error.
    pub fn record_error(&self, kind: &str) {
        self.errors.inc([kind]);
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            scores_inserted: self.scores_inserted.get(),
            scores_updated: self.scores_updated.get(),
            scores_unchanged: self.scores_unchanged.get(),
            scores_rejected: self.scores_rejected.get(),
            rank_queries: self.rank_queries.get(),
            rank_not_ranked: self.rank_not_ranked.get(),
            maintenance_scheduled: self.maintenance_scheduled.get(),
            maintenance_coalesced: self.maintenance_coalesced.get(),
            maintenance_completed: self.maintenance_completed.get(),
            maintenance_failed: self.maintenance_failed.get(),
            maintenance_retries: self.maintenance_retries.get(),
            maintenance_in_flight: self.maintenance_in_flight.get(),
            rows_moved: self.rows_moved.get(),
            duplicates_removed: self.duplicates_removed.get(),
            rank_latency: self.rank_latency.snapshot(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        for counter in [
            &self.scores_inserted,
            &self.scores_updated,
            &self.scores_unchanged,
            &self.scores_rejected,
            &self.boundary_moves,
            &self.rank_queries,
            &self.rank_not_ranked,
            &self.window_queries,
            &self.page_queries,
            &self.maintenance_scheduled,
            &self.maintenance_coalesced,
            &self.maintenance_completed,
            &self.maintenance_failed,
            &self.maintenance_retries,
            &self.rebalances,
            &self.rows_moved,
            &self.promotions,
            &self.duplicates_removed,
        ] {
            let _ = write!(
                output,
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n",
                name = counter.name(),
                help = counter.help(),
                value = counter.get()
            );
        }

        let gauge = &self.maintenance_in_flight;
        let _ = write!(
            output,
            "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n",
            name = gauge.name(),
            help = gauge.help(),
            value = gauge.get()
        );

        for histogram in [&self.add_latency, &self.rank_latency, &self.maintenance_duration] {
            let snap = histogram.snapshot();
            let _ = write!(
                output,
                "# HELP {name} {help}\n# TYPE {name} histogram\n",
                name = histogram.name(),
                help = histogram.help()
            );
            for (bound, count) in snap.buckets.iter().zip(&snap.bucket_counts) {
                let _ = writeln!(output, "{}_bucket{{le=\"{}\"}} {}", histogram.name(), bound, count);
            }
            let _ = write!(
                output,
                "{name}_bucket{{le=\"+Inf\"}} {count}\n{name}_sum {sum}\n{name}_count {count}\n",
                name = histogram.name(),
                sum = snap.sum,
                count = snap.count
            );
        }

        let _ = write!(
            output,
            "# HELP {name} {help}\n# TYPE {name} counter\n",
            name = self.errors.name(),
            help = self.errors.help()
        );
        for ([kind], value) in self.errors.get_all() {
            let _ = writeln!(output, "{}{{kind=\"{}\"}} {}", self.errors.name(), kind, value);
        }

        output
    }
}

impl Default for LeaderboardMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of leaderboard metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub scores_inserted: u64,
    pub scores_updated: u64,
    pub scores_unchanged: u64,
    pub scores_rejected: u64,
    pub rank_queries: u64,
    pub rank_not_ranked: u64,
    pub maintenance_scheduled: u64,
    pub maintenance_coalesced: u64,
    pub maintenance_completed: u64,
    pub maintenance_failed: u64,
    pub maintenance_retries: u64,
    pub maintenance_in_flight: i64,
    pub rows_moved: u64,
    pub duplicates_removed: u64,
    pub rank_latency: HistogramSnapshot,
}

impl MetricsSnapshot {
    /// Total score writes, whatever their outcome.
    pub fn scores_submitted(&self) -> u64 {
        self.scores_inserted + self.scores_updated + self.scores_unchanged + self.scores_rejected
    }

    /// Average rank lookup latency in milliseconds.
    pub fn avg_rank_latency_ms(&self) -> f64 {
        self.rank_latency.mean() * 1000.0
    }
}
