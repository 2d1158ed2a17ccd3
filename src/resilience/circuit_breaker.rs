//! Per-upstream circuit breaker.
//!
//! # States
//! - Closed: normal operation, calls pass through and are counted per window
//! - Open: upstream assumed unhealthy, every call is shed
//! - Half-Open: about half the calls are admitted while the upstream is on probation
//!
//! # State Transitions
//! ```text
//! Closed    → Open:      failed >= openCountThreshold and failed/total > openThreshold
//! any       → Open:      HTTP 429 or a usable Retry-After (forced, immediate)
//! Open      → Half-Open: openDuration (or the forced override) elapsed
//! Half-Open → Open:      failed >= halfOpenCountThreshold and ratio > halfOpenThreshold
//! Half-Open → Closed:    halfOpenDuration elapsed without a trip
//! ```

use super::config::BreakerConfig;
use super::policy::{next_state, BreakerState, Policy, Transition};
use super::retry_after::retry_after_from_headers;
use reqwest::header::HeaderMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Header a transport puts on the synthetic 429 it returns for a shed call,
/// naming the breaker that shed it.
pub const BREAKER_HEADER: &str = "x-circuit-breaker";

#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    /// Calls counted by the active policy (always 0 while open).
    pub total_count: u32,
    pub failed_count: u32,
    /// Hint a transport should hand out with shed calls.
    pub retry_after: Duration,
}

/// How a completed call is reported to the active policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    /// Open now, for the given duration, regardless of counts.
    ForceOpen(Duration),
    /// Our own rejection echoed back; not an upstream signal.
    Ignore,
}

/// Classify a completed call.
///
/// Client errors other than 429 say nothing about upstream health and count
/// as successes. A 429 or any failing response with a usable `Retry-After`
/// forces the breaker open; `fallback` is used when a 429 carries no usable hint.
pub fn classify(
    name: &str,
    status: u16,
    headers: &HeaderMap,
    fallback: Duration,
) -> CallOutcome {
    if is_own_rejection(name, headers) {
        return CallOutcome::Ignore;
    }
    if status < 400 || (status < 500 && status != 429) {
        return CallOutcome::Success;
    }
    match retry_after_from_headers(headers) {
        Some(wait) => CallOutcome::ForceOpen(wait),
        None if status == 429 => CallOutcome::ForceOpen(fallback),
        None => CallOutcome::Failure,
    }
}

fn is_own_rejection(name: &str, headers: &HeaderMap) -> bool {
    headers
        .get(BREAKER_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == name)
}

struct Core {
    policy: Policy,
    generation: u64,
    /// Open duration of the most recent forced-open transition, if that was the last one.
    open_override: Option<Duration>,
}

struct Shared {
    name: String,
    cfg: BreakerConfig,
    core: Mutex<Core>,
}

/// Circuit breaker guarding one logical upstream.
///
/// Exactly one policy is live at any time. Transitions are applied while the
/// breaker's lock is held, so callers never observe two policies at once.
/// Timers run as tokio tasks when a runtime is available; every query also
/// fires an elapsed deadline itself, so the breaker behaves the same without one.
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: BreakerConfig) -> Self {
        let now = Instant::now();
        let shared = Arc::new(Shared {
            name: name.into(),
            cfg,
            core: Mutex::new(Core {
                policy: Policy::closed(now, 0),
                generation: 0,
                open_override: None,
            }),
        });
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.shared.cfg
    }

    /// Whether the next call must be shed. Half-open answers are random.
    pub fn is_open(&self) -> bool {
        let mut core = self.shared.lock();
        self.shared.poll_timers(&mut core, Instant::now());
        core.policy.is_open()
    }

    pub fn state(&self) -> BreakerState {
        let mut core = self.shared.lock();
        self.shared.poll_timers(&mut core, Instant::now());
        core.policy.state()
    }

    /// Duration to advertise to shed callers: the override of the latest
    /// forced opening, or the configured open duration.
    pub fn retry_after(&self) -> Duration {
        let mut core = self.shared.lock();
        self.shared.poll_timers(&mut core, Instant::now());
        core.open_override.unwrap_or(self.shared.cfg.open_duration)
    }

    /// Report a completed upstream call.
    pub fn on_request(&self, status: u16, headers: &HeaderMap) {
        let shared = &self.shared;
        let now = Instant::now();
        let mut core = shared.lock();
        shared.poll_timers(&mut core, now);

        match classify(&shared.name, status, headers, shared.cfg.open_duration) {
            CallOutcome::Success => {
                if let Some(t) = core.policy.on_success_call(now, &shared.cfg) {
                    shared.apply(&mut core, t, now);
                }
            }
            CallOutcome::Failure => {
                if let Some(t) = core.policy.on_failed_call(now, &shared.cfg) {
                    shared.apply(&mut core, t, now);
                }
            }
            CallOutcome::ForceOpen(wait) => {
                if core.policy.state() == BreakerState::Open {
                    debug!(
                        circuit = %shared.name,
                        http_status = status,
                        "circuit already open, ignoring forced-open signal"
                    );
                    return;
                }
                let wait = shared.cfg.bounded_open_duration(wait);
                error!(
                    circuit = %shared.name,
                    http_status = status,
                    retry_after_ms = wait.as_millis() as u64,
                    "Circuit is open"
                );
                shared.install(&mut core, BreakerState::Open, Some(wait), now);
            }
            CallOutcome::Ignore => {
                debug!(
                    circuit = %shared.name,
                    http_status = status,
                    "ignoring rejection issued by this breaker"
                );
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut core = self.shared.lock();
        self.shared.poll_timers(&mut core, Instant::now());
        let (total_count, failed_count) = core.policy.counts();
        BreakerSnapshot {
            name: self.shared.name.clone(),
            state: core.policy.state(),
            total_count,
            failed_count,
            retry_after: core.open_override.unwrap_or(self.shared.cfg.open_duration),
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.shared.name)
            .field("config", &self.shared.cfg)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        // Nothing in the core can be left half-updated by a panic worth
        // surfacing; the breaker never fails its callers.
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fire every policy timer that is already due, each at its own deadline.
    fn poll_timers(self: &Arc<Self>, core: &mut Core, now: Instant) {
        while let Some(deadline) = core.policy.deadline().filter(|d| *d <= now) {
            match core.policy.on_timer(now) {
                Some(t) => self.apply(core, t, deadline),
                None => break,
            }
        }
    }

    fn fire_timer(self: &Arc<Self>, generation: u64) {
        let mut core = self.lock();
        if core.generation != generation {
            return;
        }
        self.poll_timers(&mut core, Instant::now());
    }

    fn apply(self: &Arc<Self>, core: &mut Core, transition: Transition, at: Instant) {
        let from = core.policy.state();
        let to = next_state(from, transition);
        match transition {
            Transition::Open => error!(circuit = %self.name, from = %from, "Circuit is open"),
            Transition::HalfOpen => info!(circuit = %self.name, from = %from, "Circuit is half-open"),
            Transition::Close => info!(circuit = %self.name, from = %from, "Circuit is closed"),
        }
        self.install(core, to, None, at);
    }

    /// Dispose the active policy and install a fresh one for `state`.
    fn install(
        self: &Arc<Self>,
        core: &mut Core,
        state: BreakerState,
        open_override: Option<Duration>,
        at: Instant,
    ) {
        core.policy.dispose();
        core.generation += 1;
        core.open_override = open_override;

        let generation = core.generation;
        let mut policy = match state {
            BreakerState::Closed => Policy::closed(at, generation),
            BreakerState::Open => Policy::open(
                at,
                open_override.unwrap_or(self.cfg.open_duration),
                generation,
            ),
            BreakerState::HalfOpen => Policy::half_open(at, &self.cfg, generation),
        };
        self.schedule_timer(&mut policy);
        core.policy = policy;
    }

    fn schedule_timer(self: &Arc<Self>, policy: &mut Policy) {
        let Some(deadline) = policy.deadline() else {
            return;
        };
        // Without a runtime the deadline is honoured lazily by `poll_timers`.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared: Weak<Shared> = Arc::downgrade(self);
        let generation = policy.generation();
        let task = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(shared) = shared.upgrade() {
                shared.fire_timer(generation);
            }
        });
        policy.attach_timer(task.abort_handle());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    const FALLBACK: Duration = Duration::from_secs(10);

    #[test]
    fn test_classify_statuses() {
        let none = HeaderMap::new();
        assert_eq!(classify("svc", 200, &none, FALLBACK), CallOutcome::Success);
        assert_eq!(classify("svc", 304, &none, FALLBACK), CallOutcome::Success);
        assert_eq!(classify("svc", 400, &none, FALLBACK), CallOutcome::Success);
        assert_eq!(classify("svc", 404, &none, FALLBACK), CallOutcome::Success);
        assert_eq!(classify("svc", 500, &none, FALLBACK), CallOutcome::Failure);
        assert_eq!(classify("svc", 503, &none, FALLBACK), CallOutcome::Failure);
        assert_eq!(
            classify("svc", 429, &none, FALLBACK),
            CallOutcome::ForceOpen(FALLBACK)
        );
    }

    #[test]
    fn test_classify_retry_after() {
        let hinted = headers(&[("retry-after", "30")]);
        assert_eq!(
            classify("svc", 503, &hinted, FALLBACK),
            CallOutcome::ForceOpen(Duration::from_secs(30))
        );
        assert_eq!(
            classify("svc", 429, &hinted, FALLBACK),
            CallOutcome::ForceOpen(Duration::from_secs(30))
        );
        // Client errors never force anything, hint or not.
        assert_eq!(classify("svc", 404, &hinted, FALLBACK), CallOutcome::Success);

        let garbage = headers(&[("retry-after", "later")]);
        assert_eq!(classify("svc", 503, &garbage, FALLBACK), CallOutcome::Failure);
        assert_eq!(
            classify("svc", 429, &garbage, FALLBACK),
            CallOutcome::ForceOpen(FALLBACK)
        );
    }

    #[test]
    fn test_classify_own_rejection() {
        let own = headers(&[("retry-after", "10"), (BREAKER_HEADER, "svc")]);
        assert_eq!(classify("svc", 429, &own, FALLBACK), CallOutcome::Ignore);

        let other = headers(&[(BREAKER_HEADER, "billing")]);
        assert_eq!(
            classify("svc", 429, &other, FALLBACK),
            CallOutcome::ForceOpen(FALLBACK)
        );
    }

    #[test]
    fn test_breaker_without_runtime() {
        let cb = CircuitBreaker::new("svc", BreakerConfig::default());
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(!cb.is_open());

        cb.on_request(429, &HeaderMap::new());
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(cb.is_open());
        assert_eq!(cb.retry_after(), Duration::from_secs(10));
    }

    #[test]
    fn test_forced_open_is_clamped() {
        let cfg = BreakerConfig::default().with_max_open_duration(Duration::from_secs(20));
        let cb = CircuitBreaker::new("svc", cfg);
        cb.on_request(503, &headers(&[("retry-after", "3600")]));
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.retry_after(), Duration::from_secs(20));
    }

    #[test]
    fn test_already_open_keeps_first_override() {
        let cb = CircuitBreaker::new("svc", BreakerConfig::default());
        cb.on_request(429, &headers(&[("retry-after", "5")]));
        cb.on_request(429, &headers(&[("retry-after", "50")]));
        assert_eq!(cb.retry_after(), Duration::from_secs(5));
    }

    #[test]
    fn test_own_rejection_does_not_open() {
        let cb = CircuitBreaker::new("svc", BreakerConfig::default());
        cb.on_request(429, &headers(&[("retry-after", "10"), (BREAKER_HEADER, "svc")]));
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_snapshot() {
        let cb = CircuitBreaker::new("svc", BreakerConfig::default());
        cb.on_request(200, &HeaderMap::new());
        cb.on_request(500, &HeaderMap::new());
        cb.on_request(404, &HeaderMap::new());

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.name, "svc");
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.total_count, 3);
        assert_eq!(snapshot.failed_count, 1);
        assert_eq!(snapshot.retry_after, Duration::from_secs(10));
    }

    #[test]
    fn test_breaker_thread_safe() {
        let cfg = BreakerConfig::default().with_open_count_threshold(1_000);
        let cb = Arc::new(CircuitBreaker::new("svc", cfg));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cb = Arc::clone(&cb);
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        cb.on_request(500, &HeaderMap::new());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.total_count, 50);
        assert_eq!(snapshot.failed_count, 50);
        assert_eq!(snapshot.state, BreakerState::Closed);
    }

    #[test]
    fn test_retry_after_follows_elapsed_deadline_without_runtime() {
        let cb = CircuitBreaker::new("svc", BreakerConfig::default());
        cb.on_request(429, &headers(&[("retry-after", "1")]));
        assert_eq!(cb.retry_after(), Duration::from_secs(1));

        std::thread::sleep(Duration::from_millis(1_100));

        // Read before any other query: the elapsed open deadline still applies.
        assert_eq!(cb.retry_after(), Duration::from_secs(10));
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert_eq!(cb.retry_after(), Duration::from_secs(10));
    }
}
