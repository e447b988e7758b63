//! # leadflow-config
//!
//! Configuration schema and loading for the leadflow orchestration core.
//! Config comes from `leadflow.toml` with environment overrides; missing
//! credentials for enabled providers are fatal at startup.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    AgentsConfig, BreakerConfig, CrmConfig, CryptoConfig, FlowConfig, LoggingConfig,
    PlatformConfig, ProviderConfig, ProvidersConfig, ResetBoundary, RetryConfig, RouterConfig,
    SchedulerConfig, StorageConfig, StreamConfig, UsageConfig,
};
