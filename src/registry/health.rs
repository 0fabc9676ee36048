//! Health monitoring.
//!
//! Each keep-alive instance gets one timer task probing it at the template's
//! interval; probes never overlap on an instance because the task runs them
//! sequentially. Managed instances are never probed — external systems feed
//! observations in through [`HealthMonitor::report_heartbeat`]. Either path
//! lands in the same rolling window (64 samples) from which the p95/p99 and
//! error-rate aggregates are computed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default rolling-window size per instance.
pub const DEFAULT_WINDOW: usize = 64;

/// Consecutive failures after which an instance is considered degraded.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// One health observation, from a probe or a heartbeat.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeOutcome {
    /// Whether the instance answered acceptably.
    pub healthy: bool,
    /// Round-trip latency; absent on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Observation time.
    pub timestamp: DateTime<Utc>,
}

impl ProbeOutcome {
    /// A successful observation with the given latency.
    #[must_use]
    pub fn ok(latency_ms: f64) -> Self {
        Self {
            healthy: true,
            latency_ms: Some(latency_ms),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// A failed observation with an error description.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Direction of a health flip reported to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthFlip {
    /// Consecutive failures crossed the threshold.
    Degraded,
    /// A success arrived after the instance had been degraded.
    Recovered,
}

/// Per-instance health record backing the aggregates.
struct HealthRecord {
    latest: Option<ProbeOutcome>,
    window: VecDeque<ProbeOutcome>,
    consecutive_failures: u32,
    degraded: bool,
    last_error: Option<String>,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            latest: None,
            window: VecDeque::with_capacity(DEFAULT_WINDOW),
            consecutive_failures: 0,
            degraded: false,
            last_error: None,
        }
    }
}

/// Read-only snapshot of one instance's health.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    /// Latest observation, if any.
    pub latest: Option<ProbeOutcome>,
    /// Whether the monitor currently considers the instance degraded.
    pub degraded: bool,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Last failure description.
    pub last_error: Option<String>,
    /// Window statistics.
    pub stats: WindowStats,
}

/// Statistics over one rolling window (or an aggregation of windows).
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowStats {
    /// Observations counted.
    pub samples: usize,
    /// Mean latency of successful observations.
    pub avg_latency_ms: f64,
    /// 95th percentile latency.
    pub p95_latency_ms: f64,
    /// 99th percentile latency.
    pub p99_latency_ms: f64,
    /// Failed observations / total observations.
    pub error_rate: f64,
}

impl WindowStats {
    fn from_outcomes<'a>(outcomes: impl Iterator<Item = &'a ProbeOutcome>) -> Self {
        let mut latencies: Vec<f64> = Vec::new();
        let mut samples = 0usize;
        let mut failures = 0usize;
        for outcome in outcomes {
            samples += 1;
            if outcome.healthy {
                if let Some(ms) = outcome.latency_ms {
                    latencies.push(ms);
                }
            } else {
                failures += 1;
            }
        }
        if samples == 0 {
            return Self::default();
        }
        latencies.sort_by(f64::total_cmp);
        let avg = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };
        Self {
            samples,
            avg_latency_ms: avg,
            p95_latency_ms: percentile(&latencies, 0.95),
            p99_latency_ms: percentile(&latencies, 0.99),
            error_rate: failures as f64 / samples as f64,
        }
    }
}

/// Nearest-rank percentile over an already sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64 * q).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

/// Global aggregate over all monitored instances.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthAggregates {
    /// Instances with a health record.
    pub monitored: usize,
    /// Instances whose latest observation was healthy.
    pub healthy: usize,
    /// Combined window statistics.
    #[serde(flatten)]
    pub stats: WindowStats,
}

/// Async probe invoked by a monitor task; yields latency or an error text.
pub type ProbeFn =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<f64, String>> + Send + Sync>;

/// Callback invoked when an instance crosses the degraded threshold either
/// way. The error text accompanies `Degraded` flips.
pub type FlipFn = Arc<dyn Fn(&str, HealthFlip, Option<String>) + Send + Sync>;

/// Owns health records and the per-instance probe timers.
pub struct HealthMonitor {
    records: DashMap<String, Mutex<HealthRecord>>,
    tasks: DashMap<String, JoinHandle<()>>,
    cancel: CancellationToken,
    failure_threshold: u32,
    window: usize,
}

impl HealthMonitor {
    /// Creates a monitor with default thresholds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            tasks: DashMap::new(),
            cancel: CancellationToken::new(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            window: DEFAULT_WINDOW,
        }
    }

    /// Starts the probe timer for an instance.
    ///
    /// The task probes once per `interval`, strictly sequentially, and
    /// reports threshold crossings through `on_flip`. Starting an already
    /// monitored instance replaces its timer.
    pub fn start_monitoring(
        self: &Arc<Self>,
        instance_id: &str,
        interval: Duration,
        probe: ProbeFn,
        on_flip: FlipFn,
    ) {
        self.records
            .entry(instance_id.to_string())
            .or_insert_with(|| Mutex::new(HealthRecord::new()));

        let monitor = Arc::clone(self);
        let id = instance_id.to_string();
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                let outcome = match probe().await {
                    Ok(latency_ms) => ProbeOutcome::ok(latency_ms),
                    Err(error) => ProbeOutcome::failed(error),
                };
                monitor.observe(&id, outcome, Some(&on_flip));
            }
            debug!(instance = %id, "health monitoring stopped");
        });

        if let Some(previous) = self.tasks.insert(instance_id.to_string(), task) {
            previous.abort();
        }
    }

    /// Stops probing an instance and drops its record.
    pub fn stop_monitoring(&self, instance_id: &str) {
        if let Some((_, task)) = self.tasks.remove(instance_id) {
            task.abort();
        }
        self.records.remove(instance_id);
    }

    /// Injects an externally observed outcome (managed instances).
    pub fn report_heartbeat(&self, instance_id: &str, outcome: ProbeOutcome, on_flip: &FlipFn) {
        self.records
            .entry(instance_id.to_string())
            .or_insert_with(|| Mutex::new(HealthRecord::new()));
        self.observe(instance_id, outcome, Some(on_flip));
    }

    /// Records one observation, firing `on_flip` at threshold crossings.
    fn observe(&self, instance_id: &str, outcome: ProbeOutcome, on_flip: Option<&FlipFn>) {
        let Some(entry) = self.records.get(instance_id) else {
            return;
        };
        let flip = {
            let mut record = entry.lock().expect("health record lock poisoned");
            if record.window.len() == self.window {
                record.window.pop_front();
            }
            record.window.push_back(outcome.clone());

            let flip = if outcome.healthy {
                record.consecutive_failures = 0;
                if record.degraded {
                    record.degraded = false;
                    Some((HealthFlip::Recovered, None))
                } else {
                    None
                }
            } else {
                record.consecutive_failures += 1;
                record.last_error.clone_from(&outcome.error);
                if !record.degraded && record.consecutive_failures >= self.failure_threshold {
                    record.degraded = true;
                    Some((HealthFlip::Degraded, outcome.error.clone()))
                } else {
                    None
                }
            };
            record.latest = Some(outcome);
            flip
        };
        drop(entry);

        if let (Some((direction, error)), Some(on_flip)) = (flip, on_flip) {
            on_flip(instance_id, direction, error);
        }
    }

    /// Snapshot of one instance's health.
    #[must_use]
    pub fn snapshot(&self, instance_id: &str) -> Option<HealthSnapshot> {
        self.records.get(instance_id).map(|entry| {
            let record = entry.lock().expect("health record lock poisoned");
            HealthSnapshot {
                latest: record.latest.clone(),
                degraded: record.degraded,
                consecutive_failures: record.consecutive_failures,
                last_error: record.last_error.clone(),
                stats: WindowStats::from_outcomes(record.window.iter()),
            }
        })
    }

    /// Whether the latest observation is healthy; `None` when never observed.
    #[must_use]
    pub fn is_healthy(&self, instance_id: &str) -> Option<bool> {
        self.records
            .get(instance_id)
            .and_then(|entry| {
                let record = entry.lock().expect("health record lock poisoned");
                record.latest.as_ref().map(|o| o.healthy && !record.degraded)
            })
    }

    /// Global aggregates across every record.
    #[must_use]
    pub fn aggregates(&self) -> HealthAggregates {
        let mut outcomes: Vec<ProbeOutcome> = Vec::new();
        let mut monitored = 0usize;
        let mut healthy = 0usize;
        for entry in &self.records {
            let record = entry.lock().expect("health record lock poisoned");
            monitored += 1;
            if record.latest.as_ref().is_some_and(|o| o.healthy) {
                healthy += 1;
            }
            outcomes.extend(record.window.iter().cloned());
        }
        HealthAggregates {
            monitored,
            healthy,
            stats: WindowStats::from_outcomes(outcomes.iter()),
        }
    }

    /// Stops every probe task. Records stay readable.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for entry in &self.tasks {
            entry.value().abort();
        }
        self.tasks.clear();
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn noop_flip() -> FlipFn {
        Arc::new(|_, _, _| {})
    }

    #[test]
    fn percentile_nearest_rank() {
        let sorted: Vec<f64> = (1..=100).map(f64::from).collect();
        assert!((percentile(&sorted, 0.95) - 95.0).abs() < f64::EPSILON);
        assert!((percentile(&sorted, 0.99) - 99.0).abs() < f64::EPSILON);
        assert!((percentile(&[7.0], 0.95) - 7.0).abs() < f64::EPSILON);
        assert!(percentile(&[], 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn window_is_bounded() {
        let monitor = HealthMonitor::new();
        monitor
            .records
            .insert("i".into(), Mutex::new(HealthRecord::new()));
        for n in 0..100 {
            monitor.observe("i", ProbeOutcome::ok(f64::from(n)), None);
        }
        let snap = monitor.snapshot("i").unwrap();
        assert_eq!(snap.stats.samples, DEFAULT_WINDOW);
        // Oldest samples were evicted: average reflects 36..=99.
        assert!(snap.stats.avg_latency_ms > 35.0);
    }

    #[test]
    fn degraded_flip_after_threshold_and_recovery() {
        let monitor = HealthMonitor::new();
        monitor
            .records
            .insert("i".into(), Mutex::new(HealthRecord::new()));
        let flips = Arc::new(AtomicU32::new(0));
        let recoveries = Arc::new(AtomicU32::new(0));
        let (f, r) = (Arc::clone(&flips), Arc::clone(&recoveries));
        let on_flip: FlipFn = Arc::new(move |_, direction, _| match direction {
            HealthFlip::Degraded => {
                f.fetch_add(1, Ordering::SeqCst);
            }
            HealthFlip::Recovered => {
                r.fetch_add(1, Ordering::SeqCst);
            }
        });

        monitor.observe("i", ProbeOutcome::failed("x"), Some(&on_flip));
        monitor.observe("i", ProbeOutcome::failed("x"), Some(&on_flip));
        assert_eq!(flips.load(Ordering::SeqCst), 0);
        monitor.observe("i", ProbeOutcome::failed("x"), Some(&on_flip));
        assert_eq!(flips.load(Ordering::SeqCst), 1);
        // Further failures do not re-fire the flip.
        monitor.observe("i", ProbeOutcome::failed("x"), Some(&on_flip));
        assert_eq!(flips.load(Ordering::SeqCst), 1);

        monitor.observe("i", ProbeOutcome::ok(3.0), Some(&on_flip));
        assert_eq!(recoveries.load(Ordering::SeqCst), 1);
        assert!(monitor.is_healthy("i").unwrap());
    }

    #[test]
    fn aggregates_combine_instances() {
        let monitor = HealthMonitor::new();
        for id in ["a", "b"] {
            monitor
                .records
                .insert(id.into(), Mutex::new(HealthRecord::new()));
        }
        monitor.observe("a", ProbeOutcome::ok(10.0), None);
        monitor.observe("b", ProbeOutcome::failed("down"), None);

        let agg = monitor.aggregates();
        assert_eq!(agg.monitored, 2);
        assert_eq!(agg.healthy, 1);
        assert_eq!(agg.stats.samples, 2);
        assert!((agg.stats.error_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn probe_timer_runs_and_stops() {
        let monitor = Arc::new(HealthMonitor::new());
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let probe: ProbeFn = Arc::new(move || {
            let c = Arc::clone(&c);
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(1.0)
            })
        });

        monitor.start_monitoring("i", Duration::from_millis(10), probe, noop_flip());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(count.load(Ordering::SeqCst) >= 3);

        monitor.stop_monitoring("i");
        let frozen = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(count.load(Ordering::SeqCst) <= frozen + 1);
        assert!(monitor.snapshot("i").is_none());
    }

    #[tokio::test]
    async fn heartbeat_creates_record_lazily() {
        let monitor = HealthMonitor::new();
        let flip = noop_flip();
        monitor.report_heartbeat("managed-1", ProbeOutcome::ok(2.0), &flip);
        let snap = monitor.snapshot("managed-1").unwrap();
        assert!(snap.latest.unwrap().healthy);
    }
}
