//! Graph agent engine: named nodes over a shared key-addressed state
//! with declared merge rules, plain and conditional edges, cycles,
//! parallel fan-out with a barrier at the join, checkpoints on every
//! level, a hard step cap, and `suspend` for human-in-the-loop pauses.

use futures::future::join_all;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use leadflow_core::{FlowError, Result, Suspension, TaskClass, TraceEvent};

use crate::context::NodeContext;
use crate::tools::ToolRegistry;

/// The designated sink node name terminating execution.
pub const END: &str = "end";

/// How concurrent writes to one state key are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// Last write wins (the only implicit rule, for single-writer keys).
    Replace,
    /// Values accumulate into a list.
    Append,
    /// Keep the numeric maximum.
    NumericMax,
    /// Treat the value as a set of items and union them.
    SetUnion,
}

/// Key-addressed shared state.
#[derive(Debug, Clone, Default)]
pub struct GraphState {
    values: Map<String, Value>,
}

impl GraphState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Self {
        Self {
            values: value.as_object().cloned().unwrap_or_default(),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    fn apply(&mut self, key: &str, value: Value, rule: MergeRule) {
        match rule {
            MergeRule::Replace => {
                self.values.insert(key.to_string(), value);
            }
            MergeRule::Append => {
                let entry = self
                    .values
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if !entry.is_array() {
                    *entry = Value::Array(vec![entry.take()]);
                }
                let list = entry.as_array_mut().expect("append target is an array");
                match value {
                    Value::Array(items) => list.extend(items),
                    single => list.push(single),
                }
            }
            MergeRule::NumericMax => {
                let current = self.values.get(key).and_then(|v| v.as_f64());
                let incoming = value.as_f64();
                let winner = match (current, incoming) {
                    (Some(a), Some(b)) => Value::from(a.max(b)),
                    (None, Some(b)) => Value::from(b),
                    _ => value,
                };
                self.values.insert(key.to_string(), winner);
            }
            MergeRule::SetUnion => {
                let entry = self
                    .values
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if !entry.is_array() {
                    *entry = Value::Array(vec![entry.take()]);
                }
                let list = entry.as_array_mut().expect("union target is an array");
                let incoming = match value {
                    Value::Array(items) => items,
                    single => vec![single],
                };
                for item in incoming {
                    if !list.contains(&item) {
                        list.push(item);
                    }
                }
            }
        }
    }
}

/// State mutations produced by one node run.
#[derive(Debug, Clone, Default)]
pub struct StateDelta(pub Vec<(String, Value)>);

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: Value) -> Self {
        self.0.push((key.to_string(), value));
        self
    }
}

/// What a node run produced.
pub enum NodeOutcome {
    Delta(StateDelta),
    /// Pause for human input; the runtime checkpoints and exits without
    /// terminating the execution.
    Suspend { reason: String, payload: Value },
}

pub type NodeFuture<'a> = Pin<Box<dyn Future<Output = Result<NodeOutcome>> + Send + 'a>>;
pub type NodeFn =
    Arc<dyn for<'a> Fn(&'a NodeContext, &'a GraphState) -> NodeFuture<'a> + Send + Sync>;

/// A graph node: declared writes and tools plus the body.
#[derive(Clone)]
pub struct Node {
    pub name: String,
    pub writes: Vec<String>,
    pub tools: Vec<String>,
    run: NodeFn,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("writes", &self.writes)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl Node {
    pub fn new(name: &str, writes: &[&str], run: NodeFn) -> Self {
        Self {
            name: name.to_string(),
            writes: writes.iter().map(|s| s.to_string()).collect(),
            tools: Vec::new(),
            run,
        }
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|s| s.to_string()).collect();
        self
    }
}

type ChooseFn = Arc<dyn Fn(&GraphState) -> String + Send + Sync>;

/// Outgoing edge of a node.
#[derive(Clone)]
pub enum Edge {
    /// Unconditional successor.
    Direct(String),
    /// Predicate over state picks the successor from the declared options.
    Conditional { choose: ChooseFn, options: Vec<String> },
    /// All targets run in parallel; their common successor is a barrier
    /// that resumes once every branch has emitted its delta.
    FanOut(Vec<String>),
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Edge::Direct(target) => f.debug_tuple("Direct").field(target).finish(),
            Edge::Conditional { options, .. } => f
                .debug_struct("Conditional")
                .field("options", options)
                .finish_non_exhaustive(),
            Edge::FanOut(targets) => f.debug_tuple("FanOut").field(targets).finish(),
        }
    }
}

/// Compiled, validated graph. Construction goes through [`GraphBuilder`],
/// which rejects dangling edges, unknown tools, and undeclared merges.
#[derive(Debug)]
pub struct GraphSpec {
    pub name: String,
    pub task: TaskClass,
    entry: String,
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Edge>,
    merge_rules: HashMap<String, MergeRule>,
}

pub struct GraphBuilder {
    name: String,
    task: TaskClass,
    entry: Option<String>,
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Edge>,
    merge_rules: HashMap<String, MergeRule>,
}

impl GraphBuilder {
    pub fn new(name: &str, task: TaskClass) -> Self {
        Self {
            name: name.to_string(),
            task,
            entry: None,
            nodes: HashMap::new(),
            edges: HashMap::new(),
            merge_rules: HashMap::new(),
        }
    }

    pub fn entry(mut self, node: &str) -> Self {
        self.entry = Some(node.to_string());
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.insert(node.name.clone(), node);
        self
    }

    pub fn edge(mut self, from: &str, to: &str) -> Self {
        self.edges.insert(from.to_string(), Edge::Direct(to.to_string()));
        self
    }

    pub fn conditional_edge<F>(mut self, from: &str, options: &[&str], choose: F) -> Self
    where
        F: Fn(&GraphState) -> String + Send + Sync + 'static,
    {
        self.edges.insert(
            from.to_string(),
            Edge::Conditional {
                choose: Arc::new(choose),
                options: options.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }

    pub fn fan_out(mut self, from: &str, targets: &[&str]) -> Self {
        self.edges.insert(
            from.to_string(),
            Edge::FanOut(targets.iter().map(|s| s.to_string()).collect()),
        );
        self
    }

    pub fn merge_rule(mut self, key: &str, rule: MergeRule) -> Self {
        self.merge_rules.insert(key.to_string(), rule);
        self
    }

    /// Compile the graph. Configuration mistakes surface here, not at
    /// run time.
    pub fn build(self, tools: &ToolRegistry) -> Result<GraphSpec> {
        let entry = self
            .entry
            .ok_or_else(|| FlowError::GraphCompile(format!("graph {}: no entry node", self.name)))?;
        if !self.nodes.contains_key(&entry) {
            return Err(FlowError::GraphCompile(format!(
                "graph {}: entry node {entry} does not exist",
                self.name
            )));
        }

        let check_target = |from: &str, to: &str| -> Result<()> {
            if to != END && !self.nodes.contains_key(to) {
                return Err(FlowError::GraphCompile(format!(
                    "graph {}: edge {from} -> {to} targets an unknown node",
                    self.name
                )));
            }
            Ok(())
        };

        for (from, edge) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(FlowError::GraphCompile(format!(
                    "graph {}: edge from unknown node {from}",
                    self.name
                )));
            }
            match edge {
                Edge::Direct(to) => check_target(from, to)?,
                Edge::Conditional { options, .. } => {
                    if options.is_empty() {
                        return Err(FlowError::GraphCompile(format!(
                            "graph {}: conditional edge from {from} declares no options",
                            self.name
                        )));
                    }
                    for to in options {
                        check_target(from, to)?;
                    }
                }
                Edge::FanOut(targets) => {
                    if targets.len() < 2 {
                        return Err(FlowError::GraphCompile(format!(
                            "graph {}: fan-out from {from} needs at least two branches",
                            self.name
                        )));
                    }
                    for to in targets {
                        check_target(from, to)?;
                    }
                    // Concurrent branches writing one key must declare how
                    // those writes merge.
                    let mut writers: HashMap<&str, u32> = HashMap::new();
                    for target in targets {
                        if let Some(node) = self.nodes.get(target) {
                            for key in &node.writes {
                                *writers.entry(key.as_str()).or_default() += 1;
                            }
                        }
                    }
                    for (key, count) in writers {
                        if count > 1 && !self.merge_rules.contains_key(key) {
                            return Err(FlowError::GraphCompile(format!(
                                "graph {}: key {key} is written by {count} parallel branches with no merge rule",
                                self.name
                            )));
                        }
                    }
                }
            }
        }

        for node in self.nodes.values() {
            if !self.edges.contains_key(&node.name) {
                return Err(FlowError::GraphCompile(format!(
                    "graph {}: node {} has no outgoing edge",
                    self.name, node.name
                )));
            }
            for tool in &node.tools {
                if !tools.contains(tool) {
                    return Err(FlowError::GraphCompile(format!(
                        "graph {}: node {} references unknown tool {tool}",
                        self.name, node.name
                    )));
                }
            }
        }

        Ok(GraphSpec {
            name: self.name,
            task: self.task,
            entry,
            nodes: self.nodes,
            edges: self.edges,
            merge_rules: self.merge_rules,
        })
    }
}

/// Checkpoint payload: the state plus the frontier to re-enter on
/// resume.
pub fn checkpoint_blob(state: &GraphState, frontier: &[String]) -> Value {
    serde_json::json!({
        "values": state.to_value(),
        "frontier": frontier,
    })
}

/// Split a checkpoint payload back into state and frontier.
pub fn parse_checkpoint_blob(blob: &Value) -> (GraphState, Vec<String>) {
    let state = GraphState::from_value(blob["values"].clone());
    let frontier = blob["frontier"]
        .as_array()
        .map(|names| {
            names
                .iter()
                .filter_map(|n| n.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    (state, frontier)
}

/// How a graph run ended (short of an error).
pub enum GraphRunOutcome {
    Finished(GraphState),
    Suspended {
        state: GraphState,
        suspension: Suspension,
    },
}

impl GraphSpec {
    pub fn entry_node(&self) -> &str {
        &self.entry
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    fn rule_for(&self, key: &str) -> MergeRule {
        self.merge_rules.get(key).copied().unwrap_or(MergeRule::Replace)
    }

    /// Execute from `frontier` (entry, or the resume node) at `start_step`.
    /// A checkpoint is persisted before every level, so the state that
    /// produced any partial output survives a step-cap abort.
    pub async fn run(
        &self,
        ctx: &NodeContext,
        mut state: GraphState,
        frontier: Vec<String>,
        start_step: u32,
        max_steps: u32,
    ) -> Result<GraphRunOutcome> {
        let mut frontier = frontier;
        let mut step = start_step;

        loop {
            frontier.retain(|name| name != END);
            if frontier.is_empty() {
                return Ok(GraphRunOutcome::Finished(state));
            }

            if ctx.cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }

            if step + frontier.len() as u32 > max_steps {
                // The last checkpoint already holds every delta applied so
                // far; partial results stay retrievable.
                ctx.checkpoint(step, checkpoint_blob(&state, &frontier), None)
                    .await?;
                return Err(FlowError::RecursionExhausted { steps: step });
            }

            ctx.checkpoint(step, checkpoint_blob(&state, &frontier), None)
                .await?;

            // The whole level runs concurrently against the same snapshot;
            // a barrier node only appears in the next frontier, after all
            // of its predecessors emitted.
            let runs = frontier.iter().map(|name| {
                let node = &self.nodes[name];
                let state_ref = &state;
                async move {
                    ctx.trace(TraceEvent::NodeEnter {
                        execution_id: ctx.execution_id,
                        node: node.name.clone(),
                        step,
                    });
                    let outcome = (node.run)(ctx, state_ref).await;
                    ctx.trace(TraceEvent::NodeExit {
                        execution_id: ctx.execution_id,
                        node: node.name.clone(),
                        step,
                        outcome: match &outcome {
                            Ok(NodeOutcome::Delta(_)) => "delta".into(),
                            Ok(NodeOutcome::Suspend { .. }) => "suspend".into(),
                            Err(e) => e.code().into(),
                        },
                    });
                    (node.name.clone(), outcome)
                }
            });
            let results = join_all(runs).await;

            step += frontier.len() as u32;

            // Apply deltas first so a sibling suspension checkpoints them.
            let mut suspension: Option<Suspension> = None;
            for (name, outcome) in results {
                match outcome? {
                    NodeOutcome::Delta(delta) => {
                        for (key, value) in delta.0 {
                            state.apply(&key, value, self.rule_for(&key));
                        }
                    }
                    NodeOutcome::Suspend { reason, payload } => {
                        suspension = Some(Suspension {
                            reason,
                            payload,
                            resume_node: name,
                        });
                    }
                }
            }
            if let Some(suspension) = suspension {
                let resume = vec![suspension.resume_node.clone()];
                ctx.checkpoint(step, checkpoint_blob(&state, &resume), Some(suspension.clone()))
                    .await?;
                return Ok(GraphRunOutcome::Suspended { state, suspension });
            }

            // Next frontier: follow each node's edge, deduplicated so a
            // common successor becomes the barrier join.
            let mut next: Vec<String> = Vec::new();
            for name in &frontier {
                match &self.edges[name] {
                    Edge::Direct(to) => {
                        if !next.contains(to) {
                            next.push(to.clone());
                        }
                    }
                    Edge::Conditional { choose, options } => {
                        let to = choose(&state);
                        if !options.contains(&to) {
                            return Err(FlowError::GraphCompile(format!(
                                "graph {}: conditional edge from {name} chose undeclared node {to}",
                                self.name
                            )));
                        }
                        if !next.contains(&to) {
                            next.push(to);
                        }
                    }
                    Edge::FanOut(targets) => {
                        for to in targets {
                            if !next.contains(to) {
                                next.push(to.clone());
                            }
                        }
                    }
                }
            }
            frontier = next;
        }
    }
}
