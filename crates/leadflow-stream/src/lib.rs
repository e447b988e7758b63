//! # leadflow-stream
//!
//! Fan-out of token/event chunks from the agent runtime to subscribers.
//! Guarantees per-stream FIFO, exactly one terminal chunk, bounded
//! subscriber queues with slow-subscriber eviction, a grace window for
//! terminal chunks, and cooperative cancellation.
//!
//! The stream id is the execution id; chunks are mirrored onto the bus
//! channel `stream:<id>` and the terminal chunk is retained under
//! `stream:<id>:terminal` for the grace window.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use leadflow_bus::Bus;
use leadflow_config::StreamConfig;
use leadflow_core::{Chunk, ChunkBody, FlowError, Result};

fn channel_key(stream_id: Uuid) -> String {
    format!("stream:{stream_id}")
}

fn terminal_key(stream_id: Uuid) -> String {
    format!("stream:{stream_id}:terminal")
}

struct OpenStream {
    next_seq: u64,
    subscribers: Vec<mpsc::Sender<Chunk>>,
    cancel: CancellationToken,
}

/// The streaming fabric. One per process; streams are registered by the
/// agent runtime and read by any number of subscribers.
pub struct StreamFabric {
    bus: Arc<dyn Bus>,
    streams: DashMap<Uuid, Mutex<OpenStream>>,
    subscriber_buffer: usize,
    grace: Duration,
}

impl StreamFabric {
    pub fn new(bus: Arc<dyn Bus>, config: &StreamConfig) -> Self {
        Self {
            bus,
            streams: DashMap::new(),
            subscriber_buffer: config.subscriber_buffer.max(2),
            grace: Duration::from_secs(config.grace_secs),
        }
    }

    /// Register a stream. Returns its cancellation token; the runtime
    /// watches it and stops issuing provider calls once tripped.
    pub fn open(&self, stream_id: Uuid) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.streams.insert(
            stream_id,
            Mutex::new(OpenStream {
                next_seq: 0,
                subscribers: Vec::new(),
                cancel: cancel.clone(),
            }),
        );
        debug!(%stream_id, "stream opened");
        cancel
    }

    pub fn is_open(&self, stream_id: Uuid) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Cancellation token for an open stream.
    pub fn cancel_token(&self, stream_id: Uuid) -> Option<CancellationToken> {
        self.streams.get(&stream_id).map(|s| s.lock().cancel.clone())
    }

    /// Request cancellation. The runtime writes the terminal
    /// `error{cancelled}` chunk at its next safe point.
    pub fn cancel(&self, stream_id: Uuid) -> Result<()> {
        match self.streams.get(&stream_id) {
            Some(stream) => {
                stream.lock().cancel.cancel();
                Ok(())
            }
            None => Err(FlowError::StreamGone(stream_id)),
        }
    }

    /// Publish one chunk. FIFO per stream; publishing a terminal chunk
    /// closes the stream, and publishing after that is an error.
    pub async fn publish(&self, stream_id: Uuid, body: ChunkBody) -> Result<u64> {
        let chunk = {
            let Some(stream) = self.streams.get(&stream_id) else {
                return Err(FlowError::StreamGone(stream_id));
            };
            let mut stream = stream.lock();
            stream.next_seq += 1;
            let chunk = Chunk {
                stream_id,
                seq: stream.next_seq,
                body,
            };

            // Fan out under the lock so subscribers observe the seq order.
            stream.subscribers.retain(|tx| {
                if tx.is_closed() {
                    return false;
                }
                // One slot is kept in reserve so an evicted subscriber can
                // still be told why it was dropped.
                if tx.capacity() <= 1 {
                    let eviction = Chunk {
                        stream_id,
                        seq: chunk.seq,
                        body: ChunkBody::Error {
                            code: "slow_subscriber".into(),
                            message: "subscriber queue overflow".into(),
                        },
                    };
                    let _ = tx.try_send(eviction);
                    warn!(%stream_id, "dropped slow subscriber");
                    return false;
                }
                tx.try_send(chunk.clone()).is_ok()
            });
            chunk
        };

        // Mirror onto the bus channel for external consumers.
        self.bus
            .publish(&channel_key(stream_id), serde_json::to_value(&chunk)?)
            .await?;

        if chunk.is_terminal() {
            self.close(stream_id, &chunk).await?;
        }
        Ok(chunk.seq)
    }

    async fn close(&self, stream_id: Uuid, terminal: &Chunk) -> Result<()> {
        // Retain the terminal chunk for reconnecting clients.
        self.bus
            .set(
                &terminal_key(stream_id),
                serde_json::to_value(terminal)?,
                Some(self.grace),
            )
            .await?;
        // Dropping the entry closes every subscriber channel once their
        // queues drain.
        self.streams.remove(&stream_id);
        debug!(%stream_id, "stream closed");
        Ok(())
    }

    /// Attach a subscriber. Live streams deliver chunks published after
    /// this call. A stream closed within the grace window delivers its
    /// terminal chunk; past the window the subscriber gets `error{gone}`.
    pub async fn subscribe(&self, stream_id: Uuid) -> Result<mpsc::Receiver<Chunk>> {
        if let Some(stream) = self.streams.get(&stream_id) {
            let (tx, rx) = mpsc::channel(self.subscriber_buffer);
            stream.lock().subscribers.push(tx);
            return Ok(rx);
        }

        let (tx, rx) = mpsc::channel(1);
        match self.bus.get(&terminal_key(stream_id)).await? {
            Some(value) => {
                let terminal: Chunk = serde_json::from_value(value)?;
                let _ = tx.try_send(terminal);
            }
            None => {
                let _ = tx.try_send(Chunk {
                    stream_id,
                    seq: 0,
                    body: ChunkBody::Error {
                        code: "gone".into(),
                        message: "stream closed beyond the grace window".into(),
                    },
                });
            }
        }
        Ok(rx)
    }
}
