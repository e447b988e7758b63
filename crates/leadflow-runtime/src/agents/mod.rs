//! Built-in sales agents: linear (qualification, enrichment, marketing,
//! conversation) and graph-shaped (growth, bdr).

pub mod bdr;
pub mod conversation;
pub mod enrichment;
pub mod growth;
pub mod marketing;
pub mod qualification;

use std::sync::Arc;

use leadflow_core::Result;

use crate::executor::AgentKind;
use crate::tools::ToolRegistry;

pub use bdr::{CalendarSlotsTool, bdr_graph};
pub use conversation::ConversationAgent;
pub use enrichment::EnrichmentAgent;
pub use growth::growth_graph;
pub use marketing::MarketingAgent;
pub use qualification::QualificationAgent;

/// Tools the built-in agents rely on.
pub fn builtin_tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(CalendarSlotsTool));
    registry
}

/// The standard agent set, compiled against a tool registry.
pub fn builtin_agents(tools: &ToolRegistry) -> Result<Vec<(String, AgentKind)>> {
    Ok(vec![
        (
            "qualification".into(),
            AgentKind::Linear(Arc::new(QualificationAgent)),
        ),
        (
            "enrichment".into(),
            AgentKind::Linear(Arc::new(EnrichmentAgent)),
        ),
        (
            "marketing".into(),
            AgentKind::Linear(Arc::new(MarketingAgent)),
        ),
        (
            "conversation".into(),
            AgentKind::Linear(Arc::new(ConversationAgent)),
        ),
        ("growth".into(), AgentKind::Graph(Arc::new(growth_graph(tools)?))),
        ("bdr".into(), AgentKind::Graph(Arc::new(bdr_graph(tools)?))),
    ])
}
