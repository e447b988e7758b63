//! # leadflow-core
//!
//! Core types, errors, and traits for the leadflow orchestration core.
//! This crate defines the shared vocabulary used by every other crate in
//! the workspace.

pub mod call;
pub mod chunk;
pub mod crm;
pub mod error;
pub mod execution;
pub mod lead;
pub mod metrics;
pub mod trace;

pub use call::{ApiCallLog, NullUsageSink, TaskClass, TokenUsage, UsageSink};
pub use chunk::{Chunk, ChunkBody, StreamMode};
pub use crm::{
    CrmContact, CrmCredential, DeadLetterItem, SyncDirection, SyncError, SyncResult, SyncStatus,
};
pub use error::{FlowError, Result};
pub use execution::{AgentExecution, Checkpoint, ExecutionStatus, Suspension};
pub use lead::{Company, Contact, Lead, Qualification, Tier};
pub use metrics::{Interval, LatencyPercentiles, ProviderSummary, RealtimeMetrics, UsageBucket};
pub use trace::{LogTraceSink, TraceEvent, TraceSink};
