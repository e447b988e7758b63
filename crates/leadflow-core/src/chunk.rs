use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// What a subscriber wants delivered on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Every token as it arrives.
    #[default]
    Tokens,
    /// Whole messages only (tokens suppressed).
    Messages,
    /// Tokens plus node/tool lifecycle events.
    Events,
}

/// One unit of streamed output.
///
/// A stream's chunk sequence is FIFO and ends with exactly one terminal
/// chunk (`Complete` or `Error`); nothing follows the terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub stream_id: Uuid,
    pub seq: u64,
    #[serde(flatten)]
    pub body: ChunkBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkBody {
    /// A token of model output.
    Token { text: String },
    /// A lifecycle event (node entered, tool called, ...).
    Event { name: String, payload: Value },
    /// Terminal: the execution finished successfully.
    Complete { result: Value },
    /// Terminal: the execution failed, or this subscriber was evicted.
    Error { code: String, message: String },
}

impl Chunk {
    pub fn is_terminal(&self) -> bool {
        matches!(self.body, ChunkBody::Complete { .. } | ChunkBody::Error { .. })
    }
}
