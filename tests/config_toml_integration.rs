use node_agent::{AgentConfig, ConfigError};
use std::path::PathBuf;
use tempfile::NamedTempFile;

#[test]
fn test_config_serialization_roundtrip() {
    let original_config = AgentConfig::default();

    let toml_str = original_config
        .to_toml_string()
        .expect("Should be able to serialize config to TOML");

    assert!(!toml_str.is_empty(), "TOML string should not be empty");
    for section in ["[engine]", "[reporting]", "[checkpoint]", "[runtime]"] {
        assert!(toml_str.contains(section), "missing {}", section);
    }

    let deserialized_config =
        AgentConfig::from_toml_str(&toml_str).expect("Should be able to deserialize TOML string");
    assert_eq!(original_config, deserialized_config);
}

#[test]
fn test_config_file_operations() {
    let mut original_config = AgentConfig::default();
    original_config.checkpoint.directory = PathBuf::from("/tmp/node-agent-state");
    original_config.reporting.ack_timeout_ms = 2_500;

    let temp_file = NamedTempFile::new().expect("Should be able to create temporary file");
    original_config
        .to_toml_file(temp_file.path())
        .expect("Should be able to write config to file");

    let loaded_config =
        AgentConfig::from_toml_file(temp_file.path()).expect("Should be able to read config");
    assert_eq!(loaded_config, original_config);
}

#[test]
fn test_operator_config_sample() {
    let toml_content = r#"
[engine]
pull_timeout_secs = 300
cleanup_wait_secs = 60
purge_ack_timeout_secs = 120

[engine.container_retry]
max_attempts = 5
base_delay_ms = 200
max_delay_ms = 5000
multiplier = 2.0
jitter = 0.1

[reporting]
ack_timeout_ms = 3000

[checkpoint]
directory = "/srv/node-agent"
interval_secs = 10

[runtime]
docker_host = "unix:///run/user/1000/docker.sock"
"#;

    let config = AgentConfig::from_toml_str(toml_content).expect("Should parse sample config");

    assert_eq!(config.engine.pull_timeout_secs, 300);
    assert_eq!(config.engine.cleanup_wait_secs, 60);
    assert_eq!(config.engine.purge_ack_timeout_secs, 120);
    assert_eq!(config.engine.container_retry.max_attempts, 5);
    assert_eq!(config.engine.container_retry.base_delay_ms, 200);
    // Unset sections and fields keep their defaults
    assert_eq!(
        config.engine.resource_retry,
        AgentConfig::default().engine.resource_retry
    );
    assert_eq!(config.reporting.ack_timeout_ms, 3_000);
    assert_eq!(
        config.reporting.retry,
        AgentConfig::default().reporting.retry
    );
    assert!(config.checkpoint.enabled);
    assert_eq!(config.checkpoint.directory, PathBuf::from("/srv/node-agent"));
    assert_eq!(config.checkpoint.interval_secs, 10);
    assert_eq!(
        config.runtime.docker_host.as_deref(),
        Some("unix:///run/user/1000/docker.sock")
    );
}

#[test]
fn test_invalid_toml_is_rejected() {
    let result = AgentConfig::from_toml_str("[engine\npull_timeout_secs = 1");
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}
