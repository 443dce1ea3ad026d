//! Pipeline counters and rolling latency windows.
//!
//! Counters are monotonic for the life of a [`crate::QueueWorker`]; the
//! latency windows keep only samples from the last `window` (default 60s).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    value_us: u64,
}

#[derive(Debug)]
struct RollingWindow {
    samples: VecDeque<Sample>,
    window: Duration,
}

impl RollingWindow {
    fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    fn record(&mut self, value: Duration) {
        let now = Instant::now();
        self.samples.push_back(Sample {
            at: now,
            value_us: value.as_micros().min(u128::from(u64::MAX)) as u64,
        });
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while self.samples.front().is_some_and(|front| front.at < cutoff) {
            self.samples.pop_front();
        }
    }

    fn summary(&mut self) -> LatencySummary {
        self.prune(Instant::now());
        if self.samples.is_empty() {
            return LatencySummary::default();
        }
        let mut values: Vec<u64> = self.samples.iter().map(|s| s.value_us).collect();
        values.sort_unstable();
        let count = values.len();
        let percentile = |p: f64| values[((count as f64 * p) as usize).min(count - 1)];
        LatencySummary {
            count: count as u64,
            mean_us: values.iter().sum::<u64>() / count as u64,
            p50_us: percentile(0.5),
            p99_us: percentile(0.99),
            max_us: values[count - 1],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl LatencySummary {
    pub fn format(&self) -> String {
        if self.count == 0 {
            return "n=0".to_string();
        }
        format!(
            "n={} mean={:.1}ms p50={:.1}ms p99={:.1}ms max={:.1}ms",
            self.count,
            self.mean_us as f64 / 1000.0,
            self.p50_us as f64 / 1000.0,
            self.p99_us as f64 / 1000.0,
            self.max_us as f64 / 1000.0,
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub scans: u64,
    pub zones_sent: u64,
    /// Pointers dropped because the manager channel was full.
    pub zones_dropped: u64,
    pub leases_obtained: u64,
    pub lease_misses: u64,
    pub empty_zones: u64,
    pub items_dequeued: u64,
    pub items_acked: u64,
    /// Acks that found the item already re-claimed or gone.
    pub acks_missed: u64,
    pub items_failed: u64,
    pub scan_latency: LatencySummary,
    pub handler_latency: LatencySummary,
}

/// Shared by every stage of one pipeline.
#[derive(Debug)]
pub struct PipelineStats {
    scans: AtomicU64,
    zones_sent: AtomicU64,
    zones_dropped: AtomicU64,
    leases_obtained: AtomicU64,
    lease_misses: AtomicU64,
    empty_zones: AtomicU64,
    items_dequeued: AtomicU64,
    items_acked: AtomicU64,
    acks_missed: AtomicU64,
    items_failed: AtomicU64,
    scan_latency: Mutex<RollingWindow>,
    handler_latency: Mutex<RollingWindow>,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl PipelineStats {
    pub fn new(window: Duration) -> Self {
        Self {
            scans: AtomicU64::new(0),
            zones_sent: AtomicU64::new(0),
            zones_dropped: AtomicU64::new(0),
            leases_obtained: AtomicU64::new(0),
            lease_misses: AtomicU64::new(0),
            empty_zones: AtomicU64::new(0),
            items_dequeued: AtomicU64::new(0),
            items_acked: AtomicU64::new(0),
            acks_missed: AtomicU64::new(0),
            items_failed: AtomicU64::new(0),
            scan_latency: Mutex::new(RollingWindow::new(window)),
            handler_latency: Mutex::new(RollingWindow::new(window)),
        }
    }

    pub fn record_scan(&self, elapsed: Duration, sent: u64, dropped: u64) {
        self.scans.fetch_add(1, Ordering::Relaxed);
        self.zones_sent.fetch_add(sent, Ordering::Relaxed);
        self.zones_dropped.fetch_add(dropped, Ordering::Relaxed);
        self.scan_latency
            .lock()
            .expect("scan latency poisoned")
            .record(elapsed);
    }

    pub fn record_lease_obtained(&self) {
        self.leases_obtained.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lease_miss(&self) {
        self.lease_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_zone(&self) {
        self.empty_zones.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dequeued(&self, count: u64) {
        self.items_dequeued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_handled(&self, elapsed: Duration) {
        self.handler_latency
            .lock()
            .expect("handler latency poisoned")
            .record(elapsed);
    }

    pub fn record_ack(&self, deleted: bool) {
        if deleted {
            self.items_acked.fetch_add(1, Ordering::Relaxed);
        } else {
            self.acks_missed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_failure(&self) {
        self.items_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            scans: self.scans.load(Ordering::Relaxed),
            zones_sent: self.zones_sent.load(Ordering::Relaxed),
            zones_dropped: self.zones_dropped.load(Ordering::Relaxed),
            leases_obtained: self.leases_obtained.load(Ordering::Relaxed),
            lease_misses: self.lease_misses.load(Ordering::Relaxed),
            empty_zones: self.empty_zones.load(Ordering::Relaxed),
            items_dequeued: self.items_dequeued.load(Ordering::Relaxed),
            items_acked: self.items_acked.load(Ordering::Relaxed),
            acks_missed: self.acks_missed.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            scan_latency: self
                .scan_latency
                .lock()
                .expect("scan latency poisoned")
                .summary(),
            handler_latency: self
                .handler_latency
                .lock()
                .expect("handler latency poisoned")
                .summary(),
        }
    }
}
