//! Prometheus metrics for monitoring
//!
//! Counters, gauges and histograms for lease activity, rendered in the
//! Prometheus text exposition format.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counter metric (monotonically increasing)
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
            help,
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
    help: &'static str,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
            help,
        }
    }

    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
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

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Latency histogram with cumulative buckets (seconds)
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    /// Sum in microseconds
    sum: AtomicU64,
    count: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Histogram {
    /// Buckets tuned for store round-trips
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self::with_buckets(
            name,
            help,
            &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
        )
    }

    pub fn with_buckets(name: &'static str, help: &'static str, bounds: &[f64]) -> Self {
        Self {
            buckets: bounds.iter().map(|&b| (b, AtomicU64::new(0))).collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name,
            help,
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);

        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut output = format!(
            "# HELP {} {}\n# TYPE {} histogram\n",
            self.name, self.help, self.name
        );

        for (bound, count) in &self.buckets {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "{}_bucket{{le=\"+Inf\"}} {}\n",
            self.name,
            self.count()
        ));

        let sum_secs = self.sum.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        output.push_str(&format!("{}_count {}\n", self.name, self.count()));

        output
    }
}

/// Process-wide lease metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static LEASES_CLAIMED: Counter =
        Counter::new("shardlease_leases_claimed_total", "Leases acquired by the assignment loop");

    pub static CLAIM_CONFLICTS: Counter = Counter::new(
        "shardlease_claim_conflicts_total",
        "Claims rejected because another worker acted first",
    );

    pub static LEASES_RENEWED: Counter =
        Counter::new("shardlease_leases_renewed_total", "Successful lease renewals");

    pub static LEASES_LOST: Counter =
        Counter::new("shardlease_leases_lost_total", "Leases taken over by another worker");

    pub static LEASES_RELEASED: Counter = Counter::new(
        "shardlease_leases_released_total",
        "Leases handed back after a release request",
    );

    pub static SHARDS_STOLEN: Counter =
        Counter::new("shardlease_shards_stolen_total", "Shards taken over by rebalancing");

    pub static STEALS_FAILED: Counter = Counter::new(
        "shardlease_steals_failed_total",
        "Steal attempts that failed their condition or errored",
    );

    pub static REBALANCE_NO_ELIGIBLE: Counter = Counter::new(
        "shardlease_rebalance_no_eligible_total",
        "Rebalance passes where every shard was pinned or released",
    );

    pub static STORE_ERRORS: Counter =
        Counter::new("shardlease_store_errors_total", "Failed or timed out lease store calls");

    pub static OWNED_LEASES: Gauge =
        Gauge::new("shardlease_owned_leases", "Leases currently held by this process");

    pub static STORE_CALL_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new("shardlease_store_call_duration_seconds", "Lease store call latency")
    });
}

/// Render every standard metric
pub fn gather_system_metrics() -> String {
    let mut output = String::new();

    output.push_str(&standard::LEASES_CLAIMED.to_prometheus());
    output.push_str(&standard::CLAIM_CONFLICTS.to_prometheus());
    output.push_str(&standard::LEASES_RENEWED.to_prometheus());
    output.push_str(&standard::LEASES_LOST.to_prometheus());
    output.push_str(&standard::LEASES_RELEASED.to_prometheus());
    output.push_str(&standard::SHARDS_STOLEN.to_prometheus());
    output.push_str(&standard::STEALS_FAILED.to_prometheus());
    output.push_str(&standard::REBALANCE_NO_ELIGIBLE.to_prometheus());
    output.push_str(&standard::STORE_ERRORS.to_prometheus());

    output.push_str(&standard::OWNED_LEASES.to_prometheus());

    output.push_str(&standard::STORE_CALL_DURATION.to_prometheus());

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "Test counter");
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
        assert!(counter.to_prometheus().ends_with("test_counter 6\n"));
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new("test_gauge", "Test gauge");
        gauge.set(10);
        gauge.dec();
        assert_eq!(gauge.get(), 9);
    }

    #[test]
    fn test_histogram() {
        let histogram = Histogram::new("test_histogram", "Test histogram");

        histogram.observe(0.001);
        histogram.observe(0.01);
        histogram.observe(7.0);

        let prometheus = histogram.to_prometheus();
        assert!(prometheus.contains("test_histogram_count 3"));
        assert!(prometheus.contains("test_histogram_bucket{le=\"0.001\"} 1"));
        assert!(prometheus.contains("test_histogram_bucket{le=\"+Inf\"} 3"));
    }

    #[test]
    fn test_gather_lists_standard_metrics() {
        let output = gather_system_metrics();
        assert!(output.contains("shardlease_leases_claimed_total"));
        assert!(output.contains("shardlease_rebalance_no_eligible_total"));
        assert!(output.contains("shardlease_store_call_duration_seconds_count"));
    }
}
