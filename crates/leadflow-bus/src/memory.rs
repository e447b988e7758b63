//! In-process bus backend. Used in production single-node deployments and
//! in every test; the trait seam is where a networked backend would go.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::{Bus, StreamEntry};
use leadflow_core::{FlowError, Result};

const SUBSCRIBER_BUFFER: usize = 4096;

struct KvEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

#[derive(Default)]
struct StreamLog {
    next_seq: u64,
    entries: VecDeque<StreamEntry>,
}

/// In-memory [`Bus`] implementation backed by dashmaps.
#[derive(Default)]
pub struct MemoryBus {
    kv: DashMap<String, KvEntry>,
    channels: DashMap<String, Vec<mpsc::Sender<Value>>>,
    streams: DashMap<String, Mutex<StreamLog>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        if let Some(entry) = self.kv.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.kv.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.kv.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.kv.remove(key).is_some())
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        let mut entry = self.kv.entry(key.to_string()).or_insert_with(|| KvEntry {
            value: Value::from(0i64),
            expires_at: None,
        });
        if entry.is_expired() {
            entry.value = Value::from(0i64);
            entry.expires_at = None;
        }
        let current = entry
            .value
            .as_i64()
            .ok_or_else(|| FlowError::Bus(format!("key {key} holds a non-integer value")))?;
        let next = current + by;
        entry.value = Value::from(next);
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        if let Some(mut entry) = self.kv.get_mut(key) {
            if entry.is_expired() {
                return Ok(false);
            }
            entry.expires_at = Some(Instant::now() + ttl);
            return Ok(true);
        }
        Ok(false)
    }

    async fn publish(&self, channel: &str, message: Value) -> Result<usize> {
        let Some(mut senders) = self.channels.get_mut(channel) else {
            return Ok(0);
        };
        let mut reached = 0usize;
        senders.retain(|tx| {
            // Closed receivers are pruned; a full buffer drops this message
            // for that subscriber only (backpressure is enforced upstream
            // by the streaming fabric's own queues).
            match tx.try_send(message.clone()) {
                Ok(()) => {
                    reached += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        Ok(reached)
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Value>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.channels.entry(channel.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn xadd(&self, stream: &str, value: Value) -> Result<u64> {
        let log = self.streams.entry(stream.to_string()).or_default();
        let mut log = log.lock();
        log.next_seq += 1;
        let seq = log.next_seq;
        log.entries.push_back(StreamEntry { seq, value });
        Ok(seq)
    }

    async fn xread(&self, stream: &str, after: u64, limit: usize) -> Result<Vec<StreamEntry>> {
        let Some(log) = self.streams.get(stream) else {
            return Ok(Vec::new());
        };
        let log = log.lock();
        Ok(log
            .entries
            .iter()
            .filter(|e| e.seq > after)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn xlen(&self, stream: &str) -> Result<u64> {
        Ok(self
            .streams
            .get(stream)
            .map(|log| log.lock().entries.len() as u64)
            .unwrap_or(0))
    }

    async fn xtrim(&self, stream: &str, max_len: usize) -> Result<u64> {
        let Some(log) = self.streams.get(stream) else {
            return Ok(0);
        };
        let mut log = log.lock();
        let mut evicted = 0u64;
        while log.entries.len() > max_len {
            log.entries.pop_front();
            evicted += 1;
        }
        Ok(evicted)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let before = self.kv.len();
        self.kv.retain(|_, entry| !entry.is_expired());
        Ok((before - self.kv.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn kv_roundtrip_and_ttl() {
        let bus = MemoryBus::new();
        bus.set("k", json!({"a": 1}), None).await.unwrap();
        assert_eq!(bus.get("k").await.unwrap(), Some(json!({"a": 1})));

        bus.set("short", json!(1), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(bus.get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_is_cumulative() {
        let bus = MemoryBus::new();
        assert_eq!(bus.incr("c", 1).await.unwrap(), 1);
        assert_eq!(bus.incr("c", 2).await.unwrap(), 3);
        assert_eq!(bus.incr("c", -3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn incr_rejects_non_integer() {
        let bus = MemoryBus::new();
        bus.set("s", json!("text"), None).await.unwrap();
        assert!(bus.incr("s", 1).await.is_err());
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers_in_order() {
        let bus = MemoryBus::new();
        let mut rx1 = bus.subscribe("chan").await.unwrap();
        let mut rx2 = bus.subscribe("chan").await.unwrap();

        assert_eq!(bus.publish("chan", json!(1)).await.unwrap(), 2);
        assert_eq!(bus.publish("chan", json!(2)).await.unwrap(), 2);

        assert_eq!(rx1.recv().await.unwrap(), json!(1));
        assert_eq!(rx1.recv().await.unwrap(), json!(2));
        assert_eq!(rx2.recv().await.unwrap(), json!(1));
        assert_eq!(rx2.recv().await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_later_messages() {
        let bus = MemoryBus::new();
        bus.publish("chan", json!("early")).await.unwrap();
        let mut rx = bus.subscribe("chan").await.unwrap();
        bus.publish("chan", json!("late")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), json!("late"));
    }

    #[tokio::test]
    async fn stream_append_read_trim() {
        let bus = MemoryBus::new();
        assert_eq!(bus.xadd("s", json!("a")).await.unwrap(), 1);
        assert_eq!(bus.xadd("s", json!("b")).await.unwrap(), 2);
        assert_eq!(bus.xadd("s", json!("c")).await.unwrap(), 3);

        let entries = bus.xread("s", 1, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 2);

        assert_eq!(bus.xtrim("s", 1).await.unwrap(), 2);
        assert_eq!(bus.xlen("s").await.unwrap(), 1);
        // Sequence numbers keep climbing after a trim.
        assert_eq!(bus.xadd("s", json!("d")).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn purge_drops_only_expired() {
        let bus = MemoryBus::new();
        bus.set("keep", json!(1), None).await.unwrap();
        bus.set("drop", json!(2), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.purge_expired().await.unwrap(), 1);
        assert_eq!(bus.get("keep").await.unwrap(), Some(json!(1)));
    }
}
