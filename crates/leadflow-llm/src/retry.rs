use rand::RngExt;
use std::time::Duration;

use leadflow_config::RetryConfig;
use leadflow_core::FlowError;

/// Bounded exponential backoff around the breaker.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before retry `attempt` (0-based):
    /// `min(base * 2^attempt, cap) + jitter`, jitter uniform in
    /// `[0, 0.1 * base * 2^attempt]`. A rate-limit retry-after hint
    /// overrides the computed delay.
    pub fn delay(&self, attempt: u32, retry_after_hint: Option<u64>) -> Duration {
        if let Some(secs) = retry_after_hint {
            return Duration::from_secs(secs).min(self.max_delay);
        }
        let exp = self.base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt);
        let capped = exp.min(self.max_delay.as_millis() as u64);
        let jitter_cap = exp / 10;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_cap)
        };
        Duration::from_millis(capped + jitter)
    }
}

/// Only transient provider failures are retried. Everything else
/// (auth, bad request, protocol, circuit open) surfaces immediately.
pub fn is_retryable(err: &FlowError) -> bool {
    matches!(
        err,
        FlowError::RateLimited { .. } | FlowError::Upstream(_) | FlowError::Timeout(_)
    )
}

/// Extract a retry-after hint (seconds) from a rate-limit error.
pub fn retry_after_hint(err: &FlowError) -> Option<u64> {
    if let FlowError::RateLimited { retry_after_secs } = err {
        *retry_after_secs
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };
        // jitter adds at most 10% of the uncapped exponential term
        let d0 = policy.delay(0, None);
        assert!(d0 >= Duration::from_millis(1_000) && d0 <= Duration::from_millis(1_100));
        let d3 = policy.delay(3, None);
        assert!(d3 >= Duration::from_millis(8_000) && d3 <= Duration::from_millis(8_800));
        // attempt 7 would be 128s uncapped; capped at 60s (+ jitter)
        let d7 = policy.delay(7, None);
        assert!(d7 >= Duration::from_secs(60));
        assert!(d7 <= Duration::from_millis(60_000 + 12_800));
    }

    #[test]
    fn retry_after_hint_overrides_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0, Some(5)), Duration::from_secs(5));
        // hint is still capped
        assert_eq!(policy.delay(0, Some(600)), Duration::from_secs(60));
    }

    #[test]
    fn retryable_classes() {
        assert!(is_retryable(&FlowError::RateLimited {
            retry_after_secs: None
        }));
        assert!(is_retryable(&FlowError::Upstream("503".into())));
        assert!(is_retryable(&FlowError::Timeout("deadline".into())));

        assert!(!is_retryable(&FlowError::Auth("bad key".into())));
        assert!(!is_retryable(&FlowError::BadRequest("schema".into())));
        assert!(!is_retryable(&FlowError::Protocol("garbage".into())));
        assert!(!is_retryable(&FlowError::CircuitOpen {
            provider: "groq".into()
        }));
    }

    #[test]
    fn hint_extraction() {
        assert_eq!(
            retry_after_hint(&FlowError::RateLimited {
                retry_after_secs: Some(30)
            }),
            Some(30)
        );
        assert_eq!(retry_after_hint(&FlowError::Timeout("t".into())), None);
    }
}
