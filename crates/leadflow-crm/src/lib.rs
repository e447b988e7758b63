//! # leadflow-crm
//!
//! Bidirectional synchronization between the local contact store and
//! external platforms: capability-tagged adapters, encrypted credential
//! vault, bus-backed rate budgets, conflict-aware reconciliation, and a
//! per-platform dead-letter queue.

pub mod credentials;
pub mod dlq;
pub mod engine;
pub mod platform;
pub mod platforms;
pub mod ratelimit;

pub use credentials::CredentialVault;
pub use dlq::DeadLetterQueue;
pub use engine::{PlatformHealth, SyncEngine, SyncHandle, SyncMetrics};
pub use platform::{
    CrmPlatform, ExternalRecord, ListPage, RateBudget, SyncFilters, WebhookEvent,
};
pub use platforms::{ApolloPlatform, FailureKind, HubSpotPlatform, MockPlatform, SalesNavPlatform};
pub use ratelimit::RateLimiter;
