//! Platform call budgets. Counters live on the bus so every worker in
//! the process (or, with a networked bus, the fleet) draws from the same
//! allowance. Keys are `crm:ratelimit:<platform>:<bucket>`; the bucket
//! label encodes the platform's declared reset boundary, so a new
//! boundary starts a fresh counter.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use leadflow_bus::Bus;
use leadflow_config::ResetBoundary;
use leadflow_core::Result;

use crate::platform::RateBudget;

// Counters linger past their boundary and are reaped by TTL.
const COUNTER_TTL: Duration = Duration::from_secs(48 * 3600);

fn bucket_label(boundary: ResetBoundary) -> String {
    match boundary {
        ResetBoundary::Day => Utc::now().format("%Y-%m-%d").to_string(),
        ResetBoundary::Hour => Utc::now().format("%Y-%m-%dT%H").to_string(),
    }
}

fn counter_key(platform: &str, boundary: ResetBoundary) -> String {
    format!("crm:ratelimit:{platform}:{}", bucket_label(boundary))
}

#[derive(Clone)]
pub struct RateLimiter {
    bus: Arc<dyn Bus>,
}

impl RateLimiter {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    /// Consume `calls` from the platform's current bucket. Returns false
    /// when the budget is exhausted; the overshoot is refunded so a
    /// smaller later request may still fit.
    pub async fn try_consume(
        &self,
        platform: &str,
        budget: RateBudget,
        calls: u64,
    ) -> Result<bool> {
        let key = counter_key(platform, budget.boundary);
        let total = self.bus.incr(&key, calls as i64).await?;
        self.bus.expire(&key, COUNTER_TTL).await?;
        if total as u64 > budget.calls {
            self.bus.incr(&key, -(calls as i64)).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Calls left in the current bucket.
    pub async fn remaining(&self, platform: &str, budget: RateBudget) -> Result<u64> {
        let key = counter_key(platform, budget.boundary);
        let used = self
            .bus
            .get(&key)
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            .max(0) as u64;
        Ok(budget.calls.saturating_sub(used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_bus::memory::MemoryBus;

    fn budget(calls: u64) -> RateBudget {
        RateBudget {
            calls,
            boundary: ResetBoundary::Day,
        }
    }

    #[tokio::test]
    async fn consumes_until_exhausted() {
        let limiter = RateLimiter::new(Arc::new(MemoryBus::new()));
        let b = budget(3);
        assert!(limiter.try_consume("apollo", b, 1).await.unwrap());
        assert!(limiter.try_consume("apollo", b, 2).await.unwrap());
        assert!(!limiter.try_consume("apollo", b, 1).await.unwrap());
        assert_eq!(limiter.remaining("apollo", b).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refund_leaves_room_for_smaller_requests() {
        let limiter = RateLimiter::new(Arc::new(MemoryBus::new()));
        let b = budget(10);
        assert!(limiter.try_consume("hubspot", b, 8).await.unwrap());
        // 8 used; 5 more does not fit and is refunded...
        assert!(!limiter.try_consume("hubspot", b, 5).await.unwrap());
        // ...so 2 still does.
        assert!(limiter.try_consume("hubspot", b, 2).await.unwrap());
    }

    #[tokio::test]
    async fn platforms_do_not_share_budgets() {
        let limiter = RateLimiter::new(Arc::new(MemoryBus::new()));
        let b = budget(1);
        assert!(limiter.try_consume("a", b, 1).await.unwrap());
        assert!(limiter.try_consume("b", b, 1).await.unwrap());
        assert!(!limiter.try_consume("a", b, 1).await.unwrap());
    }
}
