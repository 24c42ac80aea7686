//! Per-backend circuit breaker

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Cooldown after the first failure
pub const DEFAULT_BASE_COOLDOWN: Duration = Duration::from_secs(2);
/// Cooldowns stop doubling here
pub const DEFAULT_MAX_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub base_cooldown: Duration,
    pub max_cooldown: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            base_cooldown: DEFAULT_BASE_COOLDOWN,
            max_cooldown: DEFAULT_MAX_COOLDOWN,
        }
    }
}

impl BreakerPolicy {
    /// Cooldown after `failures` consecutive failures: base * 2^(failures - 1), capped
    pub fn cooldown(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_cooldown
            .saturating_mul(1u32 << exponent)
            .min(self.max_cooldown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Healthy, all traffic admitted
    Closed,
    /// Failing, no traffic until the cooldown passes
    Open,
    /// Cooldown passed, one trial connection admitted
    HalfOpen,
}

/// CLOSED -> OPEN on failure, OPEN -> HALF_OPEN when the cooldown expires,
/// HALF_OPEN -> CLOSED on a successful trial or back to OPEN (longer cooldown) on a
/// failed one.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    policy: BreakerPolicy,
    state: BreakerState,
    failures: u32,
    open_until: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            state: BreakerState::Closed,
            failures: 0,
            open_until: None,
            trial_in_flight: false,
        }
    }

    /// Whether a new connection may be sent here at `now`. An OPEN breaker whose
    /// cooldown has passed moves to HALF_OPEN.
    pub fn is_eligible(&mut self, now: Instant) -> bool {
        if self.state == BreakerState::Open && self.open_until.is_some_and(|t| now >= t) {
            self.state = BreakerState::HalfOpen;
            self.trial_in_flight = false;
        }
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => !self.trial_in_flight,
        }
    }

    /// Record that a connection was sent here. Returns true if it is the
    /// HALF_OPEN trial.
    pub fn on_admit(&mut self) -> bool {
        if self.state == BreakerState::HalfOpen {
            self.trial_in_flight = true;
            true
        } else {
            false
        }
    }

    pub fn on_success(&mut self) {
        self.state = BreakerState::Closed;
        self.failures = 0;
        self.open_until = None;
        self.trial_in_flight = false;
    }

    pub fn on_failure(&mut self, now: Instant) {
        self.failures = self.failures.saturating_add(1);
        self.state = BreakerState::Open;
        self.open_until = Some(now + self.policy.cooldown(self.failures));
        self.trial_in_flight = false;
    }

    /// The trial connection went away without an outcome; allow another
    pub fn abandon_trial(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    /// State as observed at `now`, without side effects
    pub fn state_at(&self, now: Instant) -> BreakerState {
        match (self.state, self.open_until) {
            (BreakerState::Open, Some(until)) if now >= until => BreakerState::HalfOpen,
            (state, _) => state,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Time left before an OPEN breaker lets a trial through
    pub fn remaining_cooldown(&self, now: Instant) -> Option<Duration> {
        match self.state {
            BreakerState::Open => self.open_until.map(|t| t.saturating_duration_since(now)),
            _ => None,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_doubles_and_caps() {
        let policy = BreakerPolicy::default();
        assert_eq!(policy.cooldown(1), Duration::from_secs(2));
        assert_eq!(policy.cooldown(2), Duration::from_secs(4));
        assert_eq!(policy.cooldown(4), Duration::from_secs(16));
        assert_eq!(policy.cooldown(5), Duration::from_secs(30));
        assert_eq!(policy.cooldown(500), Duration::from_secs(30));
    }

    #[test]
    fn full_cycle() {
        let start = Instant::now();
        let mut breaker = CircuitBreaker::default();
        assert!(breaker.is_eligible(start));

        breaker.on_failure(start);
        assert_eq!(breaker.state_at(start), BreakerState::Open);
        let first = breaker.remaining_cooldown(start).unwrap();
        assert_eq!(first, Duration::from_secs(2));
        assert!(!breaker.is_eligible(start + Duration::from_secs(1)));

        let t1 = start + first;
        assert_eq!(breaker.state_at(t1), BreakerState::HalfOpen);
        assert!(breaker.is_eligible(t1));
        assert!(breaker.on_admit());
        // Only one trial at a time
        assert!(!breaker.is_eligible(t1));

        breaker.on_failure(t1);
        let second = breaker.remaining_cooldown(t1).unwrap();
        assert!(second > first);
        assert!(!breaker.is_eligible(t1 + first));

        let t2 = t1 + second;
        assert!(breaker.is_eligible(t2));
        assert!(breaker.on_admit());
        breaker.on_success();
        assert_eq!(breaker.state_at(t2), BreakerState::Closed);
        assert_eq!(breaker.failures(), 0);
        assert!(breaker.is_eligible(t2));
        assert!(!breaker.on_admit());
    }

    #[test]
    fn abandoned_trial_frees_the_slot() {
        let start = Instant::now();
        let mut breaker = CircuitBreaker::default();
        breaker.on_failure(start);

        let later = start + Duration::from_secs(3);
        assert!(breaker.is_eligible(later));
        breaker.on_admit();
        assert!(!breaker.is_eligible(later));
        breaker.abandon_trial();
        assert!(breaker.is_eligible(later));
    }
}
