//! # leadflow-runtime
//!
//! The agent runtime: a uniform execution surface over linear and graph
//! agents, with checkpointing, structured output, tool dispatch,
//! deadlines and cancellation, stream publication, the job scheduler,
//! and the orchestrator facade that wires the whole core together.

pub mod agents;
pub mod context;
pub mod executor;
pub mod graph;
pub mod linear;
pub mod logging;
pub mod orchestrator;
pub mod scheduler;
pub mod schema;
pub mod tools;

pub use context::{CheckpointStore, ChunkSink, NodeContext, NullSink, RouteConstraints};
pub use executor::{AgentKind, AgentRuntime, ExecutionState, InvokeOptions, InvokeResult};
pub use graph::{
    END, Edge, GraphBuilder, GraphRunOutcome, GraphSpec, GraphState, MergeRule, Node, NodeOutcome,
    StateDelta,
};
pub use linear::{LinearAgent, Prompt, run_linear};
pub use logging::init_logging;
pub use orchestrator::Orchestrator;
pub use scheduler::{JobHandle, JobKind, JobSpec, JobStatus, Scheduler};
pub use tools::{Tool, ToolContext, ToolOutcome, ToolRegistry, ToolSpec};
