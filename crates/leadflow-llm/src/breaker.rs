use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use leadflow_config::BreakerConfig;

/// Whether a call may proceed through the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed: call passes.
    Allowed,
    /// Circuit recovering: this call is the single probe.
    Probe,
    /// Circuit open: fail fast with `circuit_open`.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open { since: Instant },
    /// A probe is in flight; everyone else is rejected until it resolves.
    HalfOpen,
}

/// Per-provider CLOSED/OPEN/HALF_OPEN gate.
///
/// Legal transitions: closed → open → half_open → {closed | open}.
/// For streaming calls the outcome is decided when the stream terminates.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: State,
    consecutive_failures: u32,
    failure_threshold: u32,
    recovery_timeout: Duration,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            failure_threshold,
            recovery_timeout,
            last_failure: None,
        }
    }

    /// Admit or reject the next call. Granting a probe moves the breaker
    /// to half-open; concurrent callers are rejected until it resolves.
    pub fn try_acquire(&mut self) -> Admission {
        match self.state {
            State::Closed => Admission::Allowed,
            State::Open { since } => {
                if since.elapsed() >= self.recovery_timeout {
                    self.state = State::HalfOpen;
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            State::HalfOpen => Admission::Rejected,
        }
    }

    /// Would a call right now be rejected? Used by the router's
    /// availability filter; does not mutate state.
    pub fn is_open(&self) -> bool {
        match self.state {
            State::Closed => false,
            State::Open { since } => since.elapsed() < self.recovery_timeout,
            State::HalfOpen => true,
        }
    }

    /// Record a successful call (or completed stream). A successful probe
    /// closes the circuit; the failure count resets.
    pub fn record_success(&mut self) {
        self.state = State::Closed;
        self.consecutive_failures = 0;
    }

    /// Record a failed call (or failed stream).
    ///
    /// `counted` is false for failures that say nothing about provider
    /// health (auth, bad request): they do not advance the failure count
    /// in the closed state, but a failed probe always re-opens.
    pub fn record_failure(&mut self, counted: bool) {
        self.last_failure = Some(Instant::now());
        match self.state {
            State::HalfOpen => {
                // Probe failed: back to open, timer restarted.
                self.state = State::Open {
                    since: Instant::now(),
                };
            }
            State::Closed => {
                if !counted {
                    return;
                }
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    self.state = State::Open {
                        since: Instant::now(),
                    };
                }
            }
            State::Open { .. } => {}
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Breaker per provider tag, shared across the resilient client and the
/// router's availability filter.
pub struct BreakerRegistry {
    breakers: DashMap<String, Mutex<CircuitBreaker>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl BreakerRegistry {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold: config.failure_threshold,
            recovery_timeout: Duration::from_secs(config.recovery_timeout_secs),
        }
    }

    fn with_breaker<R>(&self, provider: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let entry = self.breakers.entry(provider.to_string()).or_insert_with(|| {
            Mutex::new(CircuitBreaker::new(
                self.failure_threshold,
                self.recovery_timeout,
            ))
        });
        let mut breaker = entry.lock();
        f(&mut breaker)
    }

    pub fn try_acquire(&self, provider: &str) -> Admission {
        self.with_breaker(provider, |b| b.try_acquire())
    }

    pub fn is_open(&self, provider: &str) -> bool {
        self.with_breaker(provider, |b| b.is_open())
    }

    pub fn record_success(&self, provider: &str) {
        self.with_breaker(provider, |b| {
            if b.is_open() {
                info!(provider, "circuit closed after successful probe");
            }
            b.record_success();
        });
    }

    pub fn record_failure(&self, provider: &str, counted: bool) {
        self.with_breaker(provider, |b| {
            let was_open = b.is_open();
            b.record_failure(counted);
            if !was_open && b.is_open() {
                warn!(
                    provider,
                    failures = b.consecutive_failures(),
                    "circuit breaker OPEN"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(threshold, Duration::from_millis(recovery_ms))
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let mut b = breaker(3, 60_000);
        b.record_failure(true);
        b.record_failure(true);
        assert!(!b.is_open());
        b.record_failure(true);
        assert!(b.is_open());
        assert_eq!(b.try_acquire(), Admission::Rejected);
    }

    #[test]
    fn success_resets_failure_count() {
        let mut b = breaker(3, 60_000);
        b.record_failure(true);
        b.record_failure(true);
        b.record_success();
        b.record_failure(true);
        b.record_failure(true);
        assert!(!b.is_open());
    }

    #[test]
    fn uncounted_failures_do_not_trip_closed_breaker() {
        let mut b = breaker(2, 60_000);
        b.record_failure(false);
        b.record_failure(false);
        b.record_failure(false);
        assert!(!b.is_open());
    }

    #[test]
    fn probe_after_recovery_then_close_on_success() {
        let mut b = breaker(1, 0);
        b.record_failure(true);
        // recovery_timeout of zero: next acquire is immediately the probe
        assert_eq!(b.try_acquire(), Admission::Probe);
        // concurrent callers are rejected while the probe is in flight
        assert_eq!(b.try_acquire(), Admission::Rejected);
        b.record_success();
        assert_eq!(b.try_acquire(), Admission::Allowed);
    }

    #[test]
    fn failed_probe_reopens() {
        let mut b = breaker(1, 0);
        b.record_failure(true);
        assert_eq!(b.try_acquire(), Admission::Probe);
        b.record_failure(true);
        // Re-opened with a fresh timer; zero timeout means the next call
        // becomes a probe again.
        assert_eq!(b.try_acquire(), Admission::Probe);
    }

    #[test]
    fn no_direct_closed_to_half_open() {
        let mut b = breaker(5, 60_000);
        // From closed, acquisition is always Allowed, never Probe.
        for _ in 0..10 {
            assert_eq!(b.try_acquire(), Admission::Allowed);
        }
    }

    #[test]
    fn stays_rejected_before_recovery_timeout() {
        let mut b = breaker(1, 60_000);
        b.record_failure(true);
        assert_eq!(b.try_acquire(), Admission::Rejected);
        assert_eq!(b.try_acquire(), Admission::Rejected);
    }

    #[tokio::test]
    async fn registry_tracks_providers_independently() {
        let registry = BreakerRegistry::new(&leadflow_config::BreakerConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 60,
        });
        registry.record_failure("groq", true);
        assert!(registry.is_open("groq"));
        assert!(!registry.is_open("anthropic"));
        assert_eq!(registry.try_acquire("anthropic"), Admission::Allowed);
    }
}
