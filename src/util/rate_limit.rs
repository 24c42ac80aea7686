//! Input admission control (per-connection token bucket)

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Default sustained input rate per connection
pub const INPUT_RATE_RPS: u32 = 20;

/// Default burst a connection may send before being throttled
pub const INPUT_RATE_BURST: u32 = 10;

/// Token-bucket limits for one connection's input stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    /// Refill rate in tokens per second
    pub rps: u32,
    /// Bucket capacity
    pub burst: u32,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            rps: INPUT_RATE_RPS,
            burst: INPUT_RATE_BURST,
        }
    }
}

impl AdmissionLimits {
    fn quota(&self) -> Quota {
        let rps = NonZeroU32::new(self.rps).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(self.burst).unwrap_or(NonZeroU32::MIN);
        Quota::per_second(rps).allow_burst(burst)
    }
}

/// Per-connection input gate.
///
/// A full bucket admits `burst` inputs back to back, then one more every `1/rps`
/// seconds. Rejected inputs are simply dropped by the caller; nothing is queued and
/// the connection is never closed for sending too fast.
#[derive(Clone)]
pub struct InputAdmission {
    limiter: Arc<Limiter>,
    limits: AdmissionLimits,
}

impl InputAdmission {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::direct(limits.quota())),
            limits,
        }
    }

    /// Consume one token if available (returns true if admitted)
    pub fn try_admit(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl Default for InputAdmission {
    fn default() -> Self {
        Self::new(AdmissionLimits::default())
    }
}

impl std::fmt::Debug for InputAdmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputAdmission")
            .field("limits", &self.limits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_of_five_then_drops() {
        let gate = InputAdmission::new(AdmissionLimits { rps: 10, burst: 5 });

        let admitted = (0..100).filter(|_| gate.try_admit()).count();

        assert_eq!(admitted, 5);
    }

    #[test]
    fn bucket_refills_at_rps() {
        let gate = InputAdmission::new(AdmissionLimits { rps: 10, burst: 5 });
        while gate.try_admit() {}

        // One token every 100ms
        std::thread::sleep(Duration::from_millis(150));

        assert!(gate.try_admit());
        assert!(!gate.try_admit());
    }

    #[test]
    fn zero_limits_fall_back_to_one() {
        let gate = InputAdmission::new(AdmissionLimits { rps: 0, burst: 0 });
        assert!(gate.try_admit());
        assert!(!gate.try_admit());
    }
}
