//! Load balancing across the instances of a group.
//!
//! The balancer is deliberately dumb about where candidates come from: the
//! router hands it a candidate list with the eligibility facts already
//! attached (state, breaker, health) and the balancer applies the filter,
//! falls back to the raw set when everything is filtered out (brownout over
//! hard-down), and picks one instance under the configured strategy. It also
//! owns the per-instance outcome metrics (EWMA latency, counters, cooldown)
//! that the least-latency strategy and the eligibility filter consume.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Instance selection strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Per-group cursor over the candidate list.
    #[default]
    RoundRobin,
    /// Fewest in-flight requests, ties broken by smallest id.
    LeastConn,
    /// Draw proportional to instance weight.
    Weighted,
    /// Lowest latency EWMA; uninitialized counts as +∞.
    LeastLatency,
    /// Candidates in configured order, first usable wins.
    Failover,
}

impl Strategy {
    /// Stable string form used in decisions, metrics labels, and config.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::LeastConn => "least-conn",
            Self::Weighted => "weighted",
            Self::LeastLatency => "least-latency",
            Self::Failover => "failover",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instance as the router presents it for selection.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Instance id.
    pub id: String,
    /// Instance is in `running` state.
    pub running: bool,
    /// Relative weight (`metadata.weight`, default 1).
    pub weight: u32,
    /// Last known health is healthy or unknown-but-not-failing.
    pub health_ok: bool,
    /// The instance's circuit breaker is open.
    pub breaker_open: bool,
}

/// Balancer tuning knobs.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// EWMA window; α = 2 / (window + 1).
    pub ewma_window: u32,
    /// Error rate beyond which an instance is flagged unhealthy.
    pub error_rate_threshold: f64,
    /// Consecutive failures beyond which an instance is flagged unhealthy.
    pub consecutive_failure_limit: u32,
    /// How long a flagged instance sits out before automatic recovery.
    pub cooldown: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            ewma_window: 10,
            error_rate_threshold: 0.5,
            consecutive_failure_limit: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Per-instance outcome metrics.
#[derive(Debug, Clone, Default)]
pub struct ChannelMetrics {
    /// Exponentially weighted moving average of latency in milliseconds.
    pub ewma_ms: Option<f64>,
    /// Total requests reported.
    pub requests: u64,
    /// Total failures reported.
    pub errors: u64,
    /// Requests currently in flight.
    pub in_flight: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Until when the instance sits in cooldown.
    pub cooldown_until: Option<Instant>,
    /// Balancer-local healthy flag.
    pub healthy: bool,
}

impl ChannelMetrics {
    fn fresh() -> Self {
        Self {
            healthy: true,
            ..Self::default()
        }
    }

    fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests as f64
        }
    }
}

/// Strategy-driven instance selector with per-instance outcome tracking.
pub struct LoadBalancer {
    config: BalancerConfig,
    cursors: DashMap<String, AtomicUsize>,
    metrics: DashMap<String, Mutex<ChannelMetrics>>,
}

impl LoadBalancer {
    /// Creates a balancer with the given tuning.
    #[must_use]
    pub fn new(config: BalancerConfig) -> Self {
        Self {
            config,
            cursors: DashMap::new(),
            metrics: DashMap::new(),
        }
    }

    /// Picks one instance id from `candidates` under `strategy`.
    ///
    /// The eligibility filter drops candidates that are not running, whose
    /// breaker is open, whose health is known-bad, or that sit in an active
    /// cooldown. When the filter leaves nothing, the raw candidate set is
    /// used instead so a brownout degrades service rather than refusing it.
    /// Returns `None` only for an empty candidate list.
    #[must_use]
    pub fn select(
        &self,
        group: &str,
        strategy: Strategy,
        candidates: &[Candidate],
    ) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }

        let eligible: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.running && !c.breaker_open && c.health_ok && !self.in_cooldown(&c.id))
            .collect();
        let pool: Vec<&Candidate> = if eligible.is_empty() {
            debug!(group, "every candidate filtered out, using raw set");
            candidates.iter().collect()
        } else {
            eligible
        };

        let chosen = match strategy {
            Strategy::RoundRobin => {
                let cursor = self.cursors.entry(group.to_string()).or_default();
                let n = cursor.fetch_add(1, Ordering::SeqCst);
                pool[n % pool.len()]
            }
            Strategy::LeastConn => pool
                .iter()
                .min_by(|a, b| {
                    let fa = (self.in_flight(&a.id), a.id.as_str());
                    let fb = (self.in_flight(&b.id), b.id.as_str());
                    fa.cmp(&fb)
                })
                .copied()?,
            Strategy::Weighted => {
                let total: u64 = pool.iter().map(|c| u64::from(c.weight.max(1))).sum();
                let mut draw = rand::rng().random_range(0..total);
                let mut picked = pool[pool.len() - 1];
                for candidate in pool.iter().copied() {
                    let w = u64::from(candidate.weight.max(1));
                    if draw < w {
                        picked = candidate;
                        break;
                    }
                    draw -= w;
                }
                picked
            }
            Strategy::LeastLatency => pool
                .iter()
                .min_by(|a, b| {
                    let la = self.ewma(&a.id).unwrap_or(f64::INFINITY);
                    let lb = self.ewma(&b.id).unwrap_or(f64::INFINITY);
                    la.total_cmp(&lb).then_with(|| a.id.cmp(&b.id))
                })
                .copied()?,
            Strategy::Failover => pool[0],
        };
        Some(chosen.id.clone())
    }

    /// Marks a request as started for least-conn accounting.
    pub fn begin_request(&self, id: &str) {
        let entry = self.entry(id);
        let mut m = entry.lock().expect("balancer metrics lock poisoned");
        m.in_flight += 1;
    }

    /// Records a successful call and its latency.
    pub fn report_success(&self, id: &str, latency_ms: f64) {
        let alpha = 2.0 / (f64::from(self.config.ewma_window) + 1.0);
        let entry = self.entry(id);
        let mut m = entry.lock().expect("balancer metrics lock poisoned");
        m.in_flight = m.in_flight.saturating_sub(1);
        m.requests += 1;
        m.consecutive_failures = 0;
        m.ewma_ms = Some(m.ewma_ms.map_or(latency_ms, |prev| {
            alpha.mul_add(latency_ms, (1.0 - alpha) * prev)
        }));
    }

    /// Records a failed call, flipping the healthy flag past the thresholds.
    pub fn report_failure(&self, id: &str) {
        let entry = self.entry(id);
        let mut m = entry.lock().expect("balancer metrics lock poisoned");
        m.in_flight = m.in_flight.saturating_sub(1);
        m.requests += 1;
        m.errors += 1;
        m.consecutive_failures += 1;
        if m.consecutive_failures >= self.config.consecutive_failure_limit
            || m.error_rate() > self.config.error_rate_threshold
        {
            m.healthy = false;
            m.cooldown_until = Some(Instant::now() + self.config.cooldown);
        }
    }

    /// Resets an instance's metrics to a clean healthy slate.
    pub fn mark_healthy(&self, id: &str) {
        let entry = self.entry(id);
        let mut m = entry.lock().expect("balancer metrics lock poisoned");
        *m = ChannelMetrics::fresh();
    }

    /// Drops all state for a removed instance.
    pub fn remove(&self, id: &str) {
        self.metrics.remove(id);
    }

    /// Snapshot of one instance's metrics.
    #[must_use]
    pub fn snapshot(&self, id: &str) -> Option<ChannelMetrics> {
        self.metrics
            .get(id)
            .map(|m| m.lock().expect("balancer metrics lock poisoned").clone())
    }

    fn entry(&self, id: &str) -> dashmap::mapref::one::Ref<'_, String, Mutex<ChannelMetrics>> {
        self.metrics
            .entry(id.to_string())
            .or_insert_with(|| Mutex::new(ChannelMetrics::fresh()))
            .downgrade()
    }

    fn in_flight(&self, id: &str) -> u64 {
        self.snapshot(id).map_or(0, |m| m.in_flight)
    }

    fn ewma(&self, id: &str) -> Option<f64> {
        self.snapshot(id).and_then(|m| m.ewma_ms)
    }

    /// Whether the instance sits in an active cooldown. Expired cooldowns
    /// clear themselves and restore the healthy flag.
    fn in_cooldown(&self, id: &str) -> bool {
        let Some(entry) = self.metrics.get(id) else {
            return false;
        };
        let mut m = entry.lock().expect("balancer metrics lock poisoned");
        match m.cooldown_until {
            Some(deadline) if deadline > Instant::now() => true,
            Some(_) => {
                m.cooldown_until = None;
                m.healthy = true;
                m.consecutive_failures = 0;
                false
            }
            None => false,
        }
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(BalancerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str) -> Candidate {
        Candidate {
            id: id.to_string(),
            running: true,
            weight: 1,
            health_ok: true,
            breaker_open: false,
        }
    }

    fn abc() -> Vec<Candidate> {
        vec![candidate("a"), candidate("b"), candidate("c")]
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let lb = LoadBalancer::default();
        let picks: Vec<String> = (0..6)
            .map(|_| lb.select("g", Strategy::RoundRobin, &abc()).unwrap())
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn round_robin_cursors_are_per_group() {
        let lb = LoadBalancer::default();
        assert_eq!(lb.select("g1", Strategy::RoundRobin, &abc()).unwrap(), "a");
        assert_eq!(lb.select("g2", Strategy::RoundRobin, &abc()).unwrap(), "a");
        assert_eq!(lb.select("g1", Strategy::RoundRobin, &abc()).unwrap(), "b");
    }

    #[test]
    fn empty_candidates_yield_none() {
        let lb = LoadBalancer::default();
        assert!(lb.select("g", Strategy::RoundRobin, &[]).is_none());
    }

    #[test]
    fn filter_drops_open_breakers_and_non_running() {
        let lb = LoadBalancer::default();
        let mut cands = abc();
        cands[0].breaker_open = true;
        cands[1].running = false;
        for _ in 0..4 {
            assert_eq!(lb.select("g", Strategy::RoundRobin, &cands).unwrap(), "c");
        }
    }

    #[test]
    fn brownout_falls_back_to_raw_set() {
        let lb = LoadBalancer::default();
        let mut cands = abc();
        for c in &mut cands {
            c.breaker_open = true;
        }
        // Everything is filtered; the raw set is used rather than failing.
        assert!(lb.select("g", Strategy::RoundRobin, &cands).is_some());
    }

    #[test]
    fn least_conn_prefers_idle_tie_breaks_by_id() {
        let lb = LoadBalancer::default();
        assert_eq!(lb.select("g", Strategy::LeastConn, &abc()).unwrap(), "a");

        lb.begin_request("a");
        lb.begin_request("b");
        assert_eq!(lb.select("g", Strategy::LeastConn, &abc()).unwrap(), "c");
    }

    #[test]
    fn least_latency_prefers_low_ewma() {
        let lb = LoadBalancer::default();
        lb.begin_request("a");
        lb.report_success("a", 5.0);
        lb.begin_request("b");
        lb.report_success("b", 80.0);
        // c has no samples → +∞.
        assert_eq!(lb.select("g", Strategy::LeastLatency, &abc()).unwrap(), "a");
    }

    #[test]
    fn failover_takes_configured_order() {
        let lb = LoadBalancer::default();
        for _ in 0..3 {
            assert_eq!(lb.select("g", Strategy::Failover, &abc()).unwrap(), "a");
        }
        let mut cands = abc();
        cands[0].running = false;
        assert_eq!(lb.select("g", Strategy::Failover, &cands).unwrap(), "b");
    }

    #[test]
    fn weighted_respects_zero_ish_weights() {
        let lb = LoadBalancer::default();
        let mut cands = abc();
        cands[0].weight = 100;
        cands[1].weight = 0; // treated as 1
        cands[2].weight = 1;
        let mut saw_a = 0;
        for _ in 0..200 {
            if lb.select("g", Strategy::Weighted, &cands).unwrap() == "a" {
                saw_a += 1;
            }
        }
        // 100/102 of the mass is on a; 150+ of 200 draws is a safe bound.
        assert!(saw_a > 150, "a picked only {saw_a}/200 times");
    }

    #[test]
    fn ewma_followups_smooth() {
        let lb = LoadBalancer::default();
        lb.begin_request("a");
        lb.report_success("a", 100.0);
        lb.begin_request("a");
        lb.report_success("a", 0.0);
        let ewma = lb.snapshot("a").unwrap().ewma_ms.unwrap();
        // α = 2/11 → 100 * (1 - 2/11) ≈ 81.8
        assert!((ewma - 81.818).abs() < 0.01, "ewma was {ewma}");
    }

    #[test]
    fn consecutive_failures_trigger_cooldown_and_recovery() {
        let lb = LoadBalancer::new(BalancerConfig {
            cooldown: Duration::from_millis(30),
            ..BalancerConfig::default()
        });
        for _ in 0..3 {
            lb.begin_request("a");
            lb.report_failure("a");
        }
        let m = lb.snapshot("a").unwrap();
        assert!(!m.healthy);
        assert!(lb.in_cooldown("a"));

        std::thread::sleep(Duration::from_millis(40));
        assert!(!lb.in_cooldown("a"));
        assert!(lb.snapshot("a").unwrap().healthy);
    }

    #[test]
    fn mark_healthy_resets() {
        let lb = LoadBalancer::default();
        for _ in 0..5 {
            lb.begin_request("a");
            lb.report_failure("a");
        }
        lb.mark_healthy("a");
        let m = lb.snapshot("a").unwrap();
        assert!(m.healthy);
        assert_eq!(m.errors, 0);
        assert!(m.ewma_ms.is_none());
    }
}
