//! Prometheus-format metrics
//!
//! Lock-free counters, gauges, and histograms exported as Prometheus
//! text on the manager's `/metrics` route.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonically increasing counter
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

    pub fn render(&self) -> String {
        format!(
            "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n",
            name = self.name,
            help = self.help,
            value = self.get()
        )
    }
}

/// Gauge that can move in both directions
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

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn render(&self) -> String {
        format!(
            "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n",
            name = self.name,
            help = self.help,
            value = self.get()
        )
    }
}

/// Latency histogram with fixed bucket bounds
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    sum_micros: AtomicU64,
    count: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Histogram {
    const DEFAULT_BOUNDS: [f64; 11] = [
        0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
    ];

    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            buckets: Self::DEFAULT_BOUNDS
                .iter()
                .map(|&bound| (bound, AtomicU64::new(0)))
                .collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name,
            help,
        }
    }

    /// Record an observation in seconds
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
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

    pub fn render(&self) -> String {
        let mut out = format!(
            "# HELP {name} {help}\n# TYPE {name} histogram\n",
            name = self.name,
            help = self.help
        );
        for (bound, count) in &self.buckets {
            out.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "{}_bucket{{le=\"+Inf\"}} {}\n",
            self.name,
            self.count()
        ));
        out.push_str(&format!(
            "{}_sum {}\n",
            self.name,
            self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
        ));
        out.push_str(&format!("{}_count {}\n", self.name, self.count()));
        out
    }
}

/// The manager's standard metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static REGISTERED_RUNNERS: Gauge =
        Gauge::new("flotilla_registered_runners", "Currently registered runners");

    pub static ASSIGNED_SHARDS: Gauge =
        Gauge::new("flotilla_assigned_shards", "Shards with an owner");

    pub static UNASSIGNED_SHARDS: Gauge =
        Gauge::new("flotilla_unassigned_shards", "Shards without an owner");

    pub static DURABLE_VERSION: Gauge = Gauge::new(
        "flotilla_durable_version",
        "Latest commit version confirmed persisted",
    );

    pub static REBALANCE_ROUNDS: Counter = Counter::new(
        "flotilla_rebalance_rounds_total",
        "Committed rebalance rounds",
    );

    pub static SHARD_MOVES: Counter = Counter::new(
        "flotilla_shard_moves_total",
        "Individual shard assignment changes",
    );

    pub static EVICTIONS: Counter = Counter::new(
        "flotilla_evictions_total",
        "Runners evicted after failed health probes",
    );

    pub static PERSIST_FAILURES: Counter = Counter::new(
        "flotilla_persist_failures_total",
        "Failed snapshot writes (before retry)",
    );

    pub static NOTIFICATIONS_SENT: Counter = Counter::new(
        "flotilla_notifications_sent_total",
        "Assignment delta messages delivered to runners",
    );

    pub static REBALANCE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new(
            "flotilla_rebalance_duration_seconds",
            "Rebalance round latency",
        )
    });

    pub static PERSIST_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new(
            "flotilla_persist_duration_seconds",
            "Snapshot write latency",
        )
    });
}

/// Render every standard metric in Prometheus text format
pub fn gather_manager_metrics() -> String {
    let mut out = String::new();

    out.push_str(&standard::REGISTERED_RUNNERS.render());
    out.push_str(&standard::ASSIGNED_SHARDS.render());
    out.push_str(&standard::UNASSIGNED_SHARDS.render());
    out.push_str(&standard::DURABLE_VERSION.render());

    out.push_str(&standard::REBALANCE_ROUNDS.render());
    out.push_str(&standard::SHARD_MOVES.render());
    out.push_str(&standard::EVICTIONS.render());
    out.push_str(&standard::PERSIST_FAILURES.render());
    out.push_str(&standard::NOTIFICATIONS_SENT.render());

    out.push_str(&standard::REBALANCE_DURATION.render());
    out.push_str(&standard::PERSIST_DURATION.render());

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let counter = Counter::new("test_total", "Test counter");
        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
        assert!(counter.render().contains("test_total 5"));
    }

    #[test]
    fn gauge_moves_both_ways() {
        let gauge = Gauge::new("test_gauge", "Test gauge");
        gauge.set(10);
        assert_eq!(gauge.get(), 10);
        gauge.set(-3);
        assert!(gauge.render().contains("test_gauge -3"));
    }

    #[test]
    fn histogram_buckets_and_count() {
        let histogram = Histogram::new("test_seconds", "Test histogram");
        histogram.observe(0.002);
        histogram.observe(0.2);
        histogram.observe(3.0); // beyond the last bound, lands in +Inf only

        let rendered = histogram.render();
        assert!(rendered.contains("test_seconds_count 3"));
        assert!(rendered.contains("le=\"+Inf\"} 3"));
    }
}
