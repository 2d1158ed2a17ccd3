//! Breaker policies: the behaviour of one breaker state.
//!
//! A policy never switches state by itself. Its operations return a
//! [`Transition`] intent; the owning breaker maps it through [`next_state`],
//! disposes the policy and installs the next one before returning to its
//! caller. A policy that has produced an intent is disposed on the spot, so a
//! count-based trip and a timer landing in the same tick cannot both act.

use super::config::BreakerConfig;
use rand::Rng;
use std::fmt;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transition intent produced by a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Open,
    Close,
    HalfOpen,
}

/// The state a breaker moves to when its active policy in `from` produces `transition`.
pub fn next_state(from: BreakerState, transition: Transition) -> BreakerState {
    match (from, transition) {
        (_, Transition::Open) => BreakerState::Open,
        (_, Transition::Close) => BreakerState::Closed,
        (_, Transition::HalfOpen) => BreakerState::HalfOpen,
    }
}

/// Probability that a half-open breaker rejects a given call.
const HALF_OPEN_REJECT_RATIO: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct ClosedPolicy {
    window_start: Instant,
    total_count: u32,
    failed_count: u32,
}

impl ClosedPolicy {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            total_count: 0,
            failed_count: 0,
        }
    }

    // Hard reset, not a sliding window.
    fn reset_window(&mut self, now: Instant, cfg: &BreakerConfig) {
        if now.saturating_duration_since(self.window_start) > cfg.breaker_window {
            self.window_start = now;
            self.total_count = 0;
            self.failed_count = 0;
        }
    }

    fn on_success_call(&mut self, now: Instant, cfg: &BreakerConfig) -> Option<Transition> {
        self.reset_window(now, cfg);
        self.total_count = self.total_count.saturating_add(1);
        None
    }

    fn on_failed_call(&mut self, now: Instant, cfg: &BreakerConfig) -> Option<Transition> {
        self.reset_window(now, cfg);
        self.total_count = self.total_count.saturating_add(1);
        self.failed_count = self.failed_count.saturating_add(1);
        tripped(
            self.failed_count,
            self.total_count,
            cfg.open_count_threshold,
            cfg.open_threshold,
        )
        .then_some(Transition::Open)
    }
}

#[derive(Debug, Clone)]
pub struct OpenPolicy {
    deadline: Instant,
}

impl OpenPolicy {
    pub fn new(now: Instant, duration: Duration) -> Self {
        Self {
            deadline: now + duration,
        }
    }
}

/// Probation after an open period.
///
/// Every observed call, successful or not, counts as a failure: the ratio can
/// only stay flat or worsen, so recovery is proven by outlasting
/// `half_open_duration` rather than by a handful of good responses.
#[derive(Debug, Clone)]
pub struct HalfOpenPolicy {
    total_count: u32,
    failed_count: u32,
    deadline: Instant,
}

impl HalfOpenPolicy {
    pub fn new(now: Instant, cfg: &BreakerConfig) -> Self {
        Self {
            total_count: 0,
            failed_count: 0,
            deadline: now + cfg.half_open_duration,
        }
    }

    fn record(&mut self) {
        self.total_count = self.total_count.saturating_add(1);
        self.failed_count = self.failed_count.saturating_add(1);
    }

    fn on_success_call(&mut self) -> Option<Transition> {
        self.record();
        None
    }

    fn on_failed_call(&mut self, cfg: &BreakerConfig) -> Option<Transition> {
        self.record();
        tripped(
            self.failed_count,
            self.total_count,
            cfg.half_open_count_threshold,
            cfg.half_open_threshold,
        )
        .then_some(Transition::Open)
    }
}

fn tripped(failed: u32, total: u32, count_threshold: u32, ratio_threshold: f64) -> bool {
    failed >= count_threshold && total > 0 && f64::from(failed) / f64::from(total) > ratio_threshold
}

#[derive(Debug, Clone)]
pub enum PolicyKind {
    Closed(ClosedPolicy),
    Open(OpenPolicy),
    HalfOpen(HalfOpenPolicy),
}

/// The live policy of a breaker together with its lifecycle bookkeeping.
#[derive(Debug)]
pub struct Policy {
    kind: PolicyKind,
    generation: u64,
    live: bool,
    timer: Option<AbortHandle>,
}

impl Policy {
    pub fn new(kind: PolicyKind, generation: u64) -> Self {
        Self {
            kind,
            generation,
            live: true,
            timer: None,
        }
    }

    pub fn closed(now: Instant, generation: u64) -> Self {
        Self::new(PolicyKind::Closed(ClosedPolicy::new(now)), generation)
    }

    pub fn open(now: Instant, duration: Duration, generation: u64) -> Self {
        Self::new(PolicyKind::Open(OpenPolicy::new(now, duration)), generation)
    }

    pub fn half_open(now: Instant, cfg: &BreakerConfig, generation: u64) -> Self {
        Self::new(PolicyKind::HalfOpen(HalfOpenPolicy::new(now, cfg)), generation)
    }

    pub fn state(&self) -> BreakerState {
        match self.kind {
            PolicyKind::Closed(_) => BreakerState::Closed,
            PolicyKind::Open(_) => BreakerState::Open,
            PolicyKind::HalfOpen(_) => BreakerState::HalfOpen,
        }
    }

    pub fn kind(&self) -> &PolicyKind {
        &self.kind
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// `(total, failed)` calls counted by this policy; open policies count nothing.
    pub fn counts(&self) -> (u32, u32) {
        match &self.kind {
            PolicyKind::Closed(p) => (p.total_count, p.failed_count),
            PolicyKind::HalfOpen(p) => (p.total_count, p.failed_count),
            PolicyKind::Open(_) => (0, 0),
        }
    }

    /// When this policy's own timer transition is due.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.kind {
            PolicyKind::Closed(_) => None,
            PolicyKind::Open(p) => Some(p.deadline),
            PolicyKind::HalfOpen(p) => Some(p.deadline),
        }
    }

    pub fn is_open(&self) -> bool {
        match self.kind {
            PolicyKind::Closed(_) => false,
            PolicyKind::Open(_) => true,
            PolicyKind::HalfOpen(_) => rand::thread_rng().gen_bool(HALF_OPEN_REJECT_RATIO),
        }
    }

    pub fn on_success_call(&mut self, now: Instant, cfg: &BreakerConfig) -> Option<Transition> {
        if !self.live {
            return None;
        }
        let intent = match &mut self.kind {
            PolicyKind::Closed(p) => p.on_success_call(now, cfg),
            PolicyKind::HalfOpen(p) => p.on_success_call(),
            PolicyKind::Open(_) => None,
        };
        self.emit(intent)
    }

    pub fn on_failed_call(&mut self, now: Instant, cfg: &BreakerConfig) -> Option<Transition> {
        if !self.live {
            return None;
        }
        let intent = match &mut self.kind {
            PolicyKind::Closed(p) => p.on_failed_call(now, cfg),
            PolicyKind::HalfOpen(p) => p.on_failed_call(cfg),
            PolicyKind::Open(_) => None,
        };
        self.emit(intent)
    }

    /// Fire the policy's timer if it is due. A disposed policy never fires.
    pub fn on_timer(&mut self, now: Instant) -> Option<Transition> {
        if !self.live {
            return None;
        }
        let intent = match &self.kind {
            PolicyKind::Open(p) if now >= p.deadline => Some(Transition::HalfOpen),
            PolicyKind::HalfOpen(p) if now >= p.deadline => Some(Transition::Close),
            _ => None,
        };
        self.emit(intent)
    }

    /// Hand the policy the abort handle of its scheduled timer task.
    pub fn attach_timer(&mut self, handle: AbortHandle) {
        if self.live {
            self.timer = Some(handle);
        } else {
            handle.abort();
        }
    }

    /// Cancel the pending timer and stop reacting to anything. Idempotent.
    pub fn dispose(&mut self) {
        self.live = false;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn emit(&mut self, intent: Option<Transition>) -> Option<Transition> {
        if intent.is_some() {
            self.dispose();
        }
        intent
    }
}

impl Drop for Policy {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BreakerConfig {
        BreakerConfig::default()
    }

    #[test]
    fn test_next_state() {
        assert_eq!(
            next_state(BreakerState::Closed, Transition::Open),
            BreakerState::Open
        );
        assert_eq!(
            next_state(BreakerState::Open, Transition::HalfOpen),
            BreakerState::HalfOpen
        );
        assert_eq!(
            next_state(BreakerState::HalfOpen, Transition::Close),
            BreakerState::Closed
        );
        assert_eq!(
            next_state(BreakerState::HalfOpen, Transition::Open),
            BreakerState::Open
        );
    }

    #[test]
    fn test_closed_trips_on_threshold() {
        let cfg = cfg();
        let now = Instant::now();
        let mut policy = Policy::closed(now, 0);

        for _ in 0..59 {
            assert_eq!(policy.on_failed_call(now, &cfg), None);
            assert!(!policy.is_open());
        }
        assert_eq!(policy.on_failed_call(now, &cfg), Some(Transition::Open));
        assert!(!policy.is_live());
        // Disposed: nothing more comes out of it.
        assert_eq!(policy.on_failed_call(now, &cfg), None);
    }

    #[test]
    fn test_closed_requires_ratio() {
        let cfg = cfg();
        let now = Instant::now();
        let mut policy = Policy::closed(now, 0);

        // 20 successes then failures: the ratio only exceeds 0.8 once failed > 4 * succeeded.
        for _ in 0..20 {
            assert_eq!(policy.on_success_call(now, &cfg), None);
        }
        for _ in 0..80 {
            assert_eq!(policy.on_failed_call(now, &cfg), None);
        }
        assert_eq!(policy.counts(), (100, 80));
        assert_eq!(policy.on_failed_call(now, &cfg), Some(Transition::Open));
    }

    #[test]
    fn test_closed_success_never_trips() {
        let cfg = cfg().with_open_count_threshold(1).with_open_threshold(0.1);
        let now = Instant::now();
        let mut policy = Policy::closed(now, 0);
        for _ in 0..100 {
            assert_eq!(policy.on_success_call(now, &cfg), None);
        }
    }

    #[test]
    fn test_closed_window_hard_reset() {
        let cfg = cfg();
        let start = Instant::now();
        let mut policy = Policy::closed(start, 0);

        for _ in 0..59 {
            policy.on_failed_call(start, &cfg);
        }
        assert_eq!(policy.counts(), (59, 59));

        // Exactly at the window edge nothing resets.
        let edge = start + cfg.breaker_window;
        policy.on_success_call(edge, &cfg);
        assert_eq!(policy.counts(), (60, 59));

        let later = edge + Duration::from_millis(1);
        assert_eq!(policy.on_failed_call(later, &cfg), None);
        assert_eq!(policy.counts(), (1, 1));
    }

    #[test]
    fn test_open_ignores_calls_and_fires_at_deadline() {
        let cfg = cfg();
        let now = Instant::now();
        let mut policy = Policy::open(now, Duration::from_secs(5), 1);

        assert!(policy.is_open());
        assert_eq!(policy.on_failed_call(now, &cfg), None);
        assert_eq!(policy.on_success_call(now, &cfg), None);
        assert_eq!(policy.counts(), (0, 0));

        assert_eq!(policy.on_timer(now + Duration::from_millis(4_999)), None);
        assert_eq!(
            policy.on_timer(now + Duration::from_secs(5)),
            Some(Transition::HalfOpen)
        );
        assert_eq!(policy.on_timer(now + Duration::from_secs(6)), None);
    }

    #[test]
    fn test_half_open_counts_successes_as_failures() {
        let cfg = cfg();
        let now = Instant::now();
        let mut policy = Policy::half_open(now, &cfg, 2);

        for _ in 0..5 {
            assert_eq!(policy.on_success_call(now, &cfg), None);
        }
        assert_eq!(policy.counts(), (5, 5));
    }

    #[test]
    fn test_half_open_reopens_on_failures() {
        let cfg = cfg();
        let now = Instant::now();
        let mut policy = Policy::half_open(now, &cfg, 2);

        for _ in 0..9 {
            assert_eq!(policy.on_failed_call(now, &cfg), None);
        }
        assert_eq!(policy.on_failed_call(now, &cfg), Some(Transition::Open));
        // The close timer is dead once the count trip fired.
        assert_eq!(policy.on_timer(now + cfg.half_open_duration), None);
    }

    #[test]
    fn test_half_open_closes_at_deadline() {
        let cfg = cfg();
        let now = Instant::now();
        let mut policy = Policy::half_open(now, &cfg, 2);

        policy.on_failed_call(now, &cfg);
        assert_eq!(policy.on_timer(now + Duration::from_secs(9)), None);
        assert_eq!(
            policy.on_timer(now + cfg.half_open_duration),
            Some(Transition::Close)
        );
        // Timer fired first: the count trip is now a no-op.
        for _ in 0..20 {
            assert_eq!(policy.on_failed_call(now, &cfg), None);
        }
    }

    #[test]
    fn test_half_open_samples_about_half() {
        let cfg = cfg();
        let policy = Policy::half_open(Instant::now(), &cfg, 0);
        let rejected = (0..2_000).filter(|_| policy.is_open()).count();
        assert!(rejected > 800 && rejected < 1_200, "rejected {rejected}");
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let mut policy = Policy::open(Instant::now(), Duration::from_secs(1), 0);
        policy.dispose();
        policy.dispose();
        assert!(!policy.is_live());
        assert_eq!(policy.on_timer(Instant::now() + Duration::from_secs(2)), None);
    }
}
