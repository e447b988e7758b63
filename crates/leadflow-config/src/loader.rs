use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::schema::FlowConfig;
use leadflow_core::{FlowError, Result};

/// Loads the leadflow configuration from disk plus environment overrides.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Resolve the config path: explicit path > LEADFLOW_CONFIG env >
    /// ./leadflow.toml.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("LEADFLOW_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("leadflow.toml")
    }

    /// Load the config from disk, falling back to defaults, then validate.
    /// Missing required environment variables are fatal here, at startup.
    pub fn load(path: Option<&Path>) -> Result<FlowConfig> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<FlowConfig>(&raw).map_err(|e| {
                FlowError::Config(format!("failed to parse {}: {}", config_path.display(), e))
            })?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            FlowConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => return Err(FlowError::Config(e)),
        }

        Ok(config)
    }

    /// Apply env var overrides (LEADFLOW_DB_PATH, LEADFLOW_LOG_LEVEL, ...).
    fn apply_env_overrides(mut config: FlowConfig) -> FlowConfig {
        if let Ok(v) = std::env::var("LEADFLOW_DB_PATH") {
            config.storage.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("LEADFLOW_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("OLLAMA_BASE_URL") {
            config.providers.ollama.base_url = Some(v);
            config.providers.ollama.enabled = true;
        }
        config
    }
}
