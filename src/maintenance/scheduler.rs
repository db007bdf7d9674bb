//! Single-flight maintenance scheduler.

use super::{MaintenanceRunner, MaintenanceTask};
use crate::config::MaintenanceConfig;
use crate::error::Error;
use crate::metrics::LeaderboardMetrics;
use crate::types::now_ms;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// A task that failed on every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub slug: String,
    pub task: MaintenanceTask,
    pub attempts: u32,
    pub error: String,
    pub failed_at_ms: u64,
}

/// Runs maintenance tasks in the background, one at a time per board.
///
/// Cloning is cheap; clones share the same queue, locks and shutdown token.
#[derive(Clone)]
pub struct MaintenanceScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    runner: Arc<dyn MaintenanceRunner>,
    config: MaintenanceConfig,
    metrics: Arc<LeaderboardMetrics>,
    /// Per-board locks, removed again once nobody holds or waits for them.
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Tasks scheduled but not started yet.
    pending: DashMap<(String, MaintenanceTask), ()>,
    /// Tasks pending or running.
    in_flight: AtomicUsize,
    idle: Notify,
    dead_letters: parking_lot::Mutex<VecDeque<DeadLetter>>,
    cancel: CancellationToken,
}

impl MaintenanceScheduler {
    /// Create a scheduler that executes tasks with `runner`.
    pub fn new(
        runner: Arc<dyn MaintenanceRunner>,
        config: MaintenanceConfig,
        metrics: Arc<LeaderboardMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                config,
                metrics,
                locks: DashMap::new(),
                pending: DashMap::new(),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                dead_letters: parking_lot::Mutex::new(VecDeque::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Queue a task for a board and return immediately.
    ///
    /// Returns `false` when an identical task is already waiting to run or
    /// the scheduler has been shut down. Must be called within a tokio
    /// runtime.
    pub fn schedule(&self, slug: &str, task: MaintenanceTask) -> bool {
        if self.inner.cancel.is_cancelled() {
            tracing::debug!(slug, task = %task, "Scheduler shut down, dropping task");
            return false;
        }

        match self.inner.pending.entry((slug.to_string(), task.clone())) {
            Entry::Occupied(_) => {
                self.inner.metrics.maintenance_coalesced.inc();
                tracing::trace!(slug, task = %task, "Coalesced maintenance task");
                return false;
            }
            Entry::Vacant(entry) => {
                entry.insert(());
            }
        }

        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        self.inner.metrics.maintenance_in_flight.inc();
        self.inner.metrics.maintenance_scheduled.inc();
        tracing::debug!(slug, task = %task, "Scheduled maintenance task");

        let inner = self.inner.clone();
        let slug = slug.to_string();
        tokio::spawn(async move {
            inner.execute(slug, task).await;
        });
        true
    }

    /// Wait until no task is pending or running.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting tasks. Queued tasks exit without running and a running
    /// rebalance stops before its next row move.
    pub fn shutdown(&self) {
        if !self.inner.cancel.is_cancelled() {
            tracing::info!(
                in_flight = self.in_flight(),
                "Shutting down maintenance scheduler"
            );
            self.inner.cancel.cancel();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Tasks pending or running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Tasks waiting to start.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Boards that currently have a lock entry.
    pub fn lock_count(&self) -> usize {
        self.inner.locks.len()
    }

    /// Tasks that failed on every attempt, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().iter().cloned().collect()
    }

    /// Token cancelled on shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }
}

impl Inner {
    async fn execute(self: Arc<Self>, slug: String, task: MaintenanceTask) {
        let lock = self
            .locks
            .entry(slug.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        {
            let guard = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                guard = lock.clone().lock_owned() => Some(guard),
            };
            self.pending.remove(&(slug.clone(), task.clone()));

            match guard {
                Some(_guard) if !self.cancel.is_cancelled() => {
                    self.run_with_retries(&slug, &task).await
                }
                _ => tracing::debug!(slug = %slug, task = %task, "Skipped maintenance task after shutdown"),
            }
        }

        drop(lock);
        self.locks.remove_if(&slug, |_, lock| Arc::strong_count(lock) == 1);
        self.finish();
    }

    async fn run_with_retries(&self, slug: &str, task: &MaintenanceTask) {
        let _timer = self.metrics.maintenance_duration.start_timer();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.runner.run(slug, task, &self.cancel).await {
                Ok(()) => {
                    self.metrics.maintenance_completed.inc();
                    tracing::debug!(slug, task = %task, attempt, "Maintenance task completed");
                    return;
                }
                Err(Error::Cancelled) => {
                    tracing::debug!(slug, task = %task, "Maintenance task cancelled");
                    return;
                }
                Err(e) => {
                    self.metrics.record_error(e.kind());

                    if attempt > self.config.max_retries {
                        tracing::error!(
                            slug,
                            task = %task,
                            attempts = attempt,
                            error = %e,
                            "Maintenance task failed"
                        );
                        self.metrics.maintenance_failed.inc();
                        self.dead_letter(slug, task, attempt, &e);
                        return;
                    }

                    let backoff = with_jitter(self.config.backoff_for(attempt));
                    self.metrics.maintenance_retries.inc();
                    tracing::warn!(
                        slug,
                        task = %task,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Maintenance task failed, retrying"
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    fn dead_letter(&self, slug: &str, task: &MaintenanceTask, attempts: u32, error: &Error) {
        let mut dead_letters = self.dead_letters.lock();
        if self.config.dead_letter_capacity == 0 {
            return;
        }
        while dead_letters.len() >= self.config.dead_letter_capacity {
            dead_letters.pop_front();
        }
        dead_letters.push_back(DeadLetter {
            slug: slug.to_string(),
            task: task.clone(),
            attempts,
            error: error.to_string(),
            failed_at_ms: now_ms(),
        });
    }

    fn finish(&self) {
        self.metrics.maintenance_in_flight.dec();
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Add up to 50% random jitter to a backoff.
fn with_jitter(backoff: Duration) -> Duration {
    let spread = backoff.as_millis() as u64 / 2;
    if spread == 0 {
        return backoff;
    }
    backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

impl std::fmt::Debug for MaintenanceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceScheduler")
            .field("in_flight", &self.in_flight())
            .field("pending", &self.pending_count())
            .field("locks", &self.lock_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Semaphore;

    /// Runner that records calls, optionally waits on a gate and fails a
    /// configurable number of times.
    #[derive(Debug, Default)]
    struct RecordingRunner {
        calls: parking_lot::Mutex<Vec<(String, MaintenanceTask)>>,
        failures_left: AtomicU32,
        gate: Option<Semaphore>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl RecordingRunner {
        fn gated() -> Self {
            Self {
                gate: Some(Semaphore::new(0)),
                ..Default::default()
            }
        }

        fn failing(times: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(times),
                ..Default::default()
            }
        }

        fn open_gate(&self, permits: usize) {
            if let Some(gate) = &self.gate {
                gate.add_permits(permits);
            }
        }

        fn calls(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl MaintenanceRunner for RecordingRunner {
        async fn run(&self, slug: &str, task: &MaintenanceTask, _cancel: &CancellationToken) -> Result<()> {
            self.calls.lock().push((slug.to_string(), task.clone()));
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);

            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            } else {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);

            let failed = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(StoreError::Unavailable("test".into()).into());
            }
            Ok(())
        }
    }

    fn config() -> MaintenanceConfig {
        MaintenanceConfig::default().with_retry_backoff(Duration::ZERO)
    }

    fn scheduler(runner: Arc<RecordingRunner>) -> (MaintenanceScheduler, Arc<LeaderboardMetrics>) {
        let metrics = Arc::new(LeaderboardMetrics::new());
        (MaintenanceScheduler::new(runner, config(), metrics.clone()), metrics)
    }

    async fn wait_for_calls(runner: &RecordingRunner, calls: usize) {
        while runner.calls() < calls {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_task_per_board() {
        let runner = Arc::new(RecordingRunner::default());
        let (scheduler, metrics) = scheduler(runner.clone());

        for bucket_id in 0..5 {
            assert!(scheduler.schedule("board", MaintenanceTask::Rebalance { bucket_id }));
        }
        scheduler.idle().await;

        assert_eq!(runner.calls(), 5);
        assert_eq!(runner.max_running.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.maintenance_completed.get(), 5);
        assert_eq!(metrics.maintenance_in_flight.get(), 0);
        assert_eq!(scheduler.lock_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_boards_run_independently() {
        let runner = Arc::new(RecordingRunner::gated());
        let (scheduler, _metrics) = scheduler(runner.clone());

        scheduler.schedule("a", MaintenanceTask::CleanBucket { bucket_id: 0 });
        scheduler.schedule("b", MaintenanceTask::CleanBucket { bucket_id: 0 });

        // Both boards start even though neither has finished.
        wait_for_calls(&runner, 2).await;
        assert_eq!(runner.max_running.load(Ordering::SeqCst), 2);

        runner.open_gate(2);
        scheduler.idle().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_identical_pending_tasks_coalesce() {
        let runner = Arc::new(RecordingRunner::gated());
        let (scheduler, metrics) = scheduler(runner.clone());

        assert!(scheduler.schedule("board", MaintenanceTask::Rebalance { bucket_id: 0 }));
        wait_for_calls(&runner, 1).await;

        let task = MaintenanceTask::CleanUser { user_id: "u".into() };
        assert!(scheduler.schedule("board", task.clone()));
        assert!(!scheduler.schedule("board", task.clone()));
        assert_eq!(metrics.maintenance_coalesced.get(), 1);

        runner.open_gate(2);
        scheduler.idle().await;
        assert_eq!(runner.calls(), 2);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let runner = Arc::new(RecordingRunner::failing(2));
        let (scheduler, metrics) = scheduler(runner.clone());

        scheduler.schedule("board", MaintenanceTask::Rebalance { bucket_id: 1 });
        scheduler.idle().await;

        assert_eq!(runner.calls(), 3);
        assert_eq!(metrics.maintenance_retries.get(), 2);
        assert_eq!(metrics.maintenance_completed.get(), 1);
        assert!(scheduler.dead_letters().is_empty());
        assert_eq!(metrics.errors.get(["store_unavailable"]), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let runner = Arc::new(RecordingRunner::failing(u32::MAX));
        let (scheduler, metrics) = scheduler(runner.clone());

        scheduler.schedule("board", MaintenanceTask::Promote { user_id: "u".into() });
        scheduler.idle().await;

        assert_eq!(runner.calls(), 3);
        assert_eq!(metrics.maintenance_failed.get(), 1);
        let dead = scheduler.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].task, MaintenanceTask::Promote { user_id: "u".into() });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_skips_queued_tasks() {
        let runner = Arc::new(RecordingRunner::gated());
        let (scheduler, _metrics) = scheduler(runner.clone());

        scheduler.schedule("board", MaintenanceTask::Rebalance { bucket_id: 0 });
        wait_for_calls(&runner, 1).await;
        scheduler.schedule("board", MaintenanceTask::Rebalance { bucket_id: 1 });

        scheduler.shutdown();
        assert!(!scheduler.schedule("board", MaintenanceTask::Rebalance { bucket_id: 2 }));

        runner.open_gate(1);
        scheduler.idle().await;
        assert_eq!(runner.calls(), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }
}
