use leadflow_config::{ConfigLoader, FlowConfig, ResetBoundary};
use std::io::Write;

fn disable_external(config: &mut FlowConfig) {
    config.providers.groq.enabled = false;
    config.providers.anthropic.enabled = false;
    config.providers.deepseek.enabled = false;
    config.providers.ollama.enabled = false;
    for platform in config.crm.platforms.values_mut() {
        platform.enabled = false;
    }
}

#[test]
fn defaults_match_documented_values() {
    let config = FlowConfig::default();
    assert_eq!(config.breaker.failure_threshold, 5);
    assert_eq!(config.breaker.recovery_timeout_secs, 60);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.base_delay_ms, 1_000);
    assert_eq!(config.retry.max_delay_ms, 60_000);
    assert_eq!(config.agents.max_steps, 25);
    assert_eq!(config.agents.checkpoint_ttl_hours, 24);
    assert_eq!(config.stream.subscriber_buffer, 1024);
    assert_eq!(config.stream.grace_secs, 60);
    assert_eq!(config.usage.cache_ttl_secs, 300);
}

#[test]
fn validate_rejects_enabled_provider_without_key() {
    let mut config = FlowConfig::default();
    disable_external(&mut config);
    config.providers.groq.enabled = true;
    config.providers.groq.api_key_env = "LEADFLOW_TEST_KEY_THAT_DOES_NOT_EXIST".into();
    let err = config.validate().unwrap_err();
    assert!(err.contains("groq"));
}

#[test]
fn validate_allows_keyless_local_provider() {
    let mut config = FlowConfig::default();
    disable_external(&mut config);
    config.providers.ollama.enabled = true;
    config.providers.ollama.api_key_env = String::new();
    assert!(config.validate().is_ok());
}

#[test]
fn validate_rejects_bad_success_floor() {
    let mut config = FlowConfig::default();
    disable_external(&mut config);
    config.router.success_floor = 1.5;
    assert!(config.validate().is_err());
}

#[test]
fn validate_warns_on_zero_retries() {
    let mut config = FlowConfig::default();
    disable_external(&mut config);
    config.retry.max_attempts = 0;
    let warnings = config.validate().unwrap();
    assert_eq!(warnings.len(), 1);
}

#[test]
fn partial_toml_fills_defaults() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[breaker]
failure_threshold = 3

[providers.groq]
enabled = false

[providers.anthropic]
enabled = false

[providers.deepseek]
enabled = false

[crm]
[crm.platforms]
"#
    )
    .unwrap();

    let config = ConfigLoader::load(Some(file.path())).unwrap();
    assert_eq!(config.breaker.failure_threshold, 3);
    // untouched sections keep defaults
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.scheduler.workers, 8);
}

#[test]
fn missing_file_uses_defaults() {
    let mut config = FlowConfig::default();
    disable_external(&mut config);
    // Defaults parse back through toml unchanged.
    let raw = toml::to_string(&config).unwrap();
    let reparsed: FlowConfig = toml::from_str(&raw).unwrap();
    assert_eq!(reparsed.breaker.failure_threshold, 5);
    assert_eq!(
        reparsed.crm.platforms.get("hubspot").unwrap().reset_boundary,
        ResetBoundary::Day
    );
}
