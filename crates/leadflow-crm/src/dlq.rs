//! Dead-letter queue for sync units that exhausted retries. One capped,
//! time-indexed bus stream per platform (`crm:dlq:<platform>`), held for
//! operator review.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use leadflow_bus::Bus;
use leadflow_core::{DeadLetterItem, Result};

fn dlq_key(platform: &str) -> String {
    format!("crm:dlq:{platform}")
}

#[derive(Clone)]
pub struct DeadLetterQueue {
    bus: Arc<dyn Bus>,
    cap: usize,
}

impl DeadLetterQueue {
    pub fn new(bus: Arc<dyn Bus>, cap: usize) -> Self {
        Self { bus, cap }
    }

    pub async fn push(&self, platform: &str, record: Value, error: &str) -> Result<u64> {
        let item = DeadLetterItem {
            platform: platform.to_string(),
            record,
            error: error.to_string(),
            created_at: Utc::now(),
        };
        warn!(platform, error, "unit dead-lettered");
        let key = dlq_key(platform);
        let seq = self.bus.xadd(&key, serde_json::to_value(&item)?).await?;
        self.bus.xtrim(&key, self.cap).await?;
        Ok(seq)
    }

    /// Items with seq > `after`, oldest first.
    pub async fn items(
        &self,
        platform: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<(u64, DeadLetterItem)>> {
        let entries = self.bus.xread(&dlq_key(platform), after, limit).await?;
        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            items.push((entry.seq, serde_json::from_value(entry.value)?));
        }
        Ok(items)
    }

    pub async fn len(&self, platform: &str) -> Result<u64> {
        self.bus.xlen(&dlq_key(platform)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_bus::memory::MemoryBus;
    use serde_json::json;

    #[tokio::test]
    async fn push_read_and_cap() {
        let dlq = DeadLetterQueue::new(Arc::new(MemoryBus::new()), 2);
        dlq.push("apollo", json!({"id": 1}), "rate_limit").await.unwrap();
        dlq.push("apollo", json!({"id": 2}), "rate_limit").await.unwrap();
        dlq.push("apollo", json!({"id": 3}), "timeout").await.unwrap();

        // Capped at 2: the oldest entry was evicted.
        assert_eq!(dlq.len("apollo").await.unwrap(), 2);
        let items = dlq.items("apollo", 0, 10).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].1.record["id"], 2);
        assert_eq!(items[1].1.error, "timeout");

        // Platforms are separate streams.
        assert_eq!(dlq.len("hubspot").await.unwrap(), 0);
    }
}
