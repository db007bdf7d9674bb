//! Lock-free metric instruments: counters, gauges and histograms.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Increment the counter by a specific amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter split by label values.
#[derive(Debug)]
pub struct LabeledCounter<const N: usize> {
    name: &'static str,
    help: &'static str,
    label_names: [&'static str; N],
    counters: RwLock<HashMap<[String; N], AtomicU64>>,
}

impl<const N: usize> LabeledCounter<N> {
    /// Create a new labeled counter.
    pub fn new(name: &'static str, help: &'static str, label_names: [&'static str; N]) -> Self {
        Self {
            name,
            help,
            label_names,
            counters: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn label_names(&self) -> &[&'static str; N] {
        &self.label_names
    }

    /// Increment the counter for the given labels.
    pub fn inc(&self, labels: [&str; N]) {
        let key: [String; N] = labels.map(str::to_string);

        if let Some(counter) = self.counters.read().get(&key) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Get the value for specific labels.
    pub fn get(&self, labels: [&str; N]) -> u64 {
        let key: [String; N] = labels.map(str::to_string);
        self.counters
            .read()
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Get all values with their labels.
    pub fn get_all(&self) -> Vec<([String; N], u64)> {
        self.counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }
}

/// A gauge that can go up and down.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicI64,
}

impl Gauge {
    /// Create a new gauge.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Latency buckets for single index operations (in seconds).
pub const OPERATION_LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Duration buckets for maintenance tasks (in seconds).
pub const MAINTENANCE_DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

/// A histogram of observed values.
#[derive(Debug)]
pub struct Histogram {
    name: &'static str,
    help: &'static str,
    buckets: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    sum: AtomicU64, // f64 bits
    count: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given upper bounds.
    pub fn with_buckets(name: &'static str, help: &'static str, mut buckets: Vec<f64>) -> Self {
        buckets.sort_by(|a, b| a.total_cmp(b));
        let bucket_counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            name,
            help,
            buckets,
            bucket_counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Observe a value.
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);

        let _ = self
            .sum
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });

        for (i, &upper) in self.buckets.iter().enumerate() {
            if value <= upper {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Observe a duration in seconds.
    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64());
    }

    /// Start a timer; the elapsed time is observed on [`HistogramTimer::observe`]
    /// or when the timer is dropped.
    pub fn start_timer(&self) -> HistogramTimer<'_> {
        HistogramTimer {
            histogram: self,
            start: Instant::now(),
            observed: false,
        }
    }

    /// Get a snapshot of the histogram data.
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            bucket_counts: self
                .bucket_counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            sum: f64::from_bits(self.sum.load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

/// Observes elapsed time into a histogram once.
pub struct HistogramTimer<'a> {
    histogram: &'a Histogram,
    start: Instant,
    observed: bool,
}

impl HistogramTimer<'_> {
    /// Stop the timer and observe the duration.
    pub fn observe(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        self.histogram.observe_duration(elapsed);
        self.observed = true;
        elapsed
    }
}

impl Drop for HistogramTimer<'_> {
    fn drop(&mut self) {
        if !self.observed {
            self.histogram.observe_duration(self.start.elapsed());
        }
    }
}

/// A snapshot of histogram data.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    /// Bucket upper bounds.
    pub buckets: Vec<f64>,
    /// Cumulative count of observations <= each bound.
    pub bucket_counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

impl HistogramSnapshot {
    /// Mean of all observations.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("rows_moved", "Rows moved");
        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_labeled_counter() {
        let errors = LabeledCounter::<1>::new("errors", "Errors by kind", ["kind"]);
        errors.inc(["store_timeout"]);
        errors.inc(["store_timeout"]);
        errors.inc(["internal"]);

        assert_eq!(errors.get(["store_timeout"]), 2);
        assert_eq!(errors.get(["config"]), 0);
        assert_eq!(errors.get_all().len(), 2);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new("in_flight", "In flight");
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
        gauge.set(-3);
        assert_eq!(gauge.get(), -3);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let histogram = Histogram::with_buckets("latency", "Latency", vec![1.0, 0.1, 0.5]);
        histogram.observe(0.05);
        histogram.observe(0.3);
        histogram.observe(2.0);

        let snap = histogram.snapshot();
        assert_eq!(snap.buckets, vec![0.1, 0.5, 1.0]);
        assert_eq!(snap.bucket_counts, vec![1, 2, 2]);
        assert_eq!(snap.count, 3);
        assert!((snap.mean() - 0.783).abs() < 0.01);
    }

    #[test]
    fn test_timer_observes_once() {
        let histogram = Histogram::with_buckets("t", "t", OPERATION_LATENCY_BUCKETS.to_vec());
        let timer = histogram.start_timer();
        timer.observe();
        {
            let _timer = histogram.start_timer();
        }
        assert_eq!(histogram.snapshot().count, 2);
    }
}
