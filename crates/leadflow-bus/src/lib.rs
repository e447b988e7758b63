//! # leadflow-bus
//!
//! Abstract bus consumed by the streaming fabric (pub/sub), the usage
//! tracker (KV with TTL), the CRM rate limiter (counters), and the
//! dead-letter queue (append-only streams). Mirrors the primitives of a
//! Redis-style service so a networked backend can be swapped in behind
//! the same trait.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

use leadflow_core::Result;

/// One entry read back from a durable stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Monotonic per-stream sequence number assigned by `xadd`.
    pub seq: u64,
    pub value: Value,
}

/// Bus primitives. All keys are flat strings; namespacing is by convention
/// (`stream:<id>`, `usage:realtime:last24h`, `crm:ratelimit:<platform>:<bucket>`,
/// `crm:dlq:<platform>`, `oauth:state:<nonce>`).
#[async_trait]
pub trait Bus: Send + Sync {
    // ── Key-value with TTL ─────────────────────────────────────
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
    /// Atomic add on an integer key (created at `by` if absent).
    async fn incr(&self, key: &str, by: i64) -> Result<i64>;
    /// Reset a key's TTL. Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    // ── Pub/sub ────────────────────────────────────────────────
    /// Publish to a channel. Returns the number of subscribers reached.
    /// Publishing to a channel with no subscribers is not an error.
    async fn publish(&self, channel: &str, message: Value) -> Result<usize>;
    /// Subscribe to a channel. The receiver sees messages published after
    /// this call, in publication order.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Value>>;

    // ── Durable streams ────────────────────────────────────────
    /// Append an entry; returns its sequence number (starting at 1).
    async fn xadd(&self, stream: &str, value: Value) -> Result<u64>;
    /// Read up to `limit` entries with seq > `after`.
    async fn xread(&self, stream: &str, after: u64, limit: usize) -> Result<Vec<StreamEntry>>;
    async fn xlen(&self, stream: &str) -> Result<u64>;
    /// Drop oldest entries beyond `max_len`. Returns how many were evicted.
    async fn xtrim(&self, stream: &str, max_len: usize) -> Result<u64>;

    // ── Maintenance ────────────────────────────────────────────
    /// Drop expired KV entries. Returns how many were purged.
    async fn purge_expired(&self) -> Result<u64>;
}
