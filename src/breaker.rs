//! Per-instance circuit breaking.
//!
//! Failures are absorbed by a rolling time window rather than a plain
//! counter: the breaker opens only when the window holds enough samples
//! *and* the error rate crosses the threshold, so one slow afternoon does
//! not blacklist a backend. While open it refuses everything until the
//! sleep window elapses, then lets a trickle through in half-open until
//! enough consecutive successes close it again.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::observability::metrics;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation; outcomes are recorded.
    Closed,
    /// Requests are refused until the sleep window elapses.
    Open,
    /// Probing: requests admitted, one failure reopens.
    HalfOpen,
}

impl BreakerState {
    /// Stable string form for events and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Minimum samples in the window before the breaker may open.
    pub volume_threshold: usize,
    /// Error percentage (0–100) at which the breaker opens.
    pub error_threshold_pct: u8,
    /// How long an open breaker refuses before going half-open.
    pub sleep_window: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
    /// Age limit for window entries.
    pub rolling_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            volume_threshold: 10,
            error_threshold_pct: 50,
            sleep_window: Duration::from_secs(30),
            success_threshold: 3,
            rolling_window: Duration::from_secs(10),
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    last_transition: Instant,
    half_open_successes: u32,
    /// (when, success) outcome samples; pruned on every inspection.
    window: Vec<(Instant, bool)>,
}

/// Rolling-window circuit breaker for one instance.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                last_transition: Instant::now(),
                half_open_successes: 0,
                window: Vec::new(),
            }),
        }
    }

    /// Whether a request may pass right now.
    ///
    /// In `open`, the sleep window is checked: once elapsed the breaker
    /// flips to `half-open` and this inquiry is admitted.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if inner.last_transition.elapsed() >= self.config.sleep_window {
                    Self::transition(&mut inner, BreakerState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful outcome.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.window.push((now, true));
        self.prune(&mut inner, now);

        if inner.state == BreakerState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.success_threshold {
                Self::transition(&mut inner, BreakerState::Closed);
                inner.window.clear();
            }
        }
    }

    /// Records a failed outcome, opening the breaker when the thresholds
    /// are crossed (closed) or immediately (half-open).
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.window.push((now, false));
        self.prune(&mut inner, now);

        match inner.state {
            BreakerState::HalfOpen => Self::transition(&mut inner, BreakerState::Open),
            BreakerState::Closed => {
                let samples = inner.window.len();
                if samples >= self.config.volume_threshold {
                    let errors = inner.window.iter().filter(|(_, ok)| !ok).count();
                    let rate_pct = errors * 100 / samples;
                    if rate_pct >= usize::from(self.config.error_threshold_pct) {
                        Self::transition(&mut inner, BreakerState::Open);
                    }
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Current state; prunes stale samples on the way.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        let now = Instant::now();
        self.prune(&mut inner, now);
        inner.state
    }

    /// Admin path: pins the breaker to a state.
    pub fn force_state(&self, state: BreakerState) {
        let mut inner = self.lock();
        Self::transition(&mut inner, state);
        inner.window.clear();
    }

    /// Admin path: back to a pristine closed breaker.
    pub fn reset(&self) {
        self.force_state(BreakerState::Closed);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().expect("breaker lock poisoned")
    }

    fn prune(&self, inner: &mut BreakerInner, now: Instant) {
        let horizon = self.config.rolling_window;
        inner.window.retain(|(when, _)| now.duration_since(*when) <= horizon);
    }

    fn transition(inner: &mut BreakerInner, to: BreakerState) {
        if inner.state == to {
            return;
        }
        debug!(from = %inner.state, to = %to, "breaker transition");
        metrics::record_breaker_transition(inner.state.as_str(), to.as_str());
        inner.state = to;
        inner.last_transition = Instant::now();
        inner.half_open_successes = 0;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

/// Lazily created breakers keyed by instance id.
pub struct BreakerSet {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerSet {
    /// Creates an empty set; breakers appear on first use.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Returns the breaker for an instance, creating it if needed.
    #[must_use]
    pub fn breaker(&self, instance_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    /// Whether the instance's breaker currently refuses requests.
    #[must_use]
    pub fn is_open(&self, instance_id: &str) -> bool {
        self.breakers
            .get(instance_id)
            .is_some_and(|b| b.state() == BreakerState::Open)
    }

    /// Drops the breaker for a removed instance.
    pub fn remove(&self, instance_id: &str) {
        self.breakers.remove(instance_id);
    }
}

impl Default for BreakerSet {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            volume_threshold: 5,
            error_threshold_pct: 50,
            sleep_window: Duration::from_millis(100),
            success_threshold: 3,
            rolling_window: Duration::from_secs(10),
        }
    }

    #[test]
    fn stays_closed_below_volume_threshold() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn opens_on_volume_and_rate() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn rate_below_threshold_stays_closed() {
        let breaker = CircuitBreaker::new(fast_config());
        // 4 failures in 10 samples = 40% < 50%.
        for _ in 0..6 {
            breaker.record_success();
        }
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_after_sleep_then_closes_on_successes() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(!breaker.allow_request());

        std::thread::sleep(Duration::from_millis(120));
        // First inquiry after the sleep window flips to half-open.
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(120));
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn old_samples_are_pruned() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            rolling_window: Duration::from_millis(50),
            ..fast_config()
        });
        for _ in 0..4 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(80));
        // Stale failures no longer count toward the volume threshold.
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn force_and_reset() {
        let breaker = CircuitBreaker::default();
        breaker.force_state(BreakerState::Open);
        assert!(!breaker.allow_request());
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn set_creates_lazily_and_removes() {
        let set = BreakerSet::default();
        assert!(!set.is_open("i"));
        let breaker = set.breaker("i");
        breaker.force_state(BreakerState::Open);
        assert!(set.is_open("i"));
        set.remove("i");
        assert!(!set.is_open("i"));
    }
}
