//! Integration tests for configuration management
//!
//! These tests verify that configuration files are loaded with defaults for
//! missing sections, rejected when invalid, and survive a save/load cycle.

use bastion_engine::config::Config;
use sdk::errors::EngineError;
use sdk::permissions::TrustLevel;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write config");
    file
}

#[test]
fn test_partial_config_uses_defaults() {
    let file = config_file(
        r#"
[core]
log_level = "debug"

[circuit_breaker]
failure_threshold = 2
"#,
    );

    let config = Config::load_from_path(file.path()).unwrap();
    let defaults = Config::default();

    assert_eq!(config.core.log_level, "debug");
    assert_eq!(config.circuit_breaker.failure_threshold, 2);
    assert_eq!(config.circuit_breaker.cooldown_ms, 30_000);
    assert_eq!(config.review, defaults.review);
    assert_eq!(config.monitor, defaults.monitor);
    assert_eq!(config.signature.mandatory_at, TrustLevel::System);
}

#[test]
fn test_empty_file_is_the_default_config() {
    let file = config_file("");
    assert_eq!(Config::load_from_path(file.path()).unwrap(), Config::default());
}

#[test]
fn test_review_thresholds_are_read() {
    let file = config_file(
        r#"
[review]
high_risk_weight = 5.0
low_risk_weight = 0.5
pending_threshold = 2.0
reject_threshold = 20.0

[signature]
mandatory_at = "verified"
"#,
    );

    let config = Config::load_from_path(file.path()).unwrap();
    assert_eq!(config.review.high_risk_weight, 5.0);
    assert_eq!(config.review.pending_threshold, 2.0);
    assert_eq!(config.signature.mandatory_at, TrustLevel::Verified);
}

#[test]
fn test_invalid_configs_are_rejected() {
    let cases = [
        "[core]\nlog_level = \"loud\"\n",
        "[review]\npending_threshold = 10.0\nreject_threshold = 5.0\n",
        "[circuit_breaker]\nfailure_threshold = 0\n",
        "[monitor]\nsnapshot_capacity = 0\n",
        "[execution]\ndefault_timeout_ms = 0\n",
        "[signature]\nmandatory_at = \"sometimes\"\n",
        "[core\nlog_level = ",
    ];

    for contents in cases {
        let file = config_file(contents);
        assert!(
            matches!(Config::load_from_path(file.path()), Err(EngineError::Config(_))),
            "accepted invalid config: {}",
            contents
        );
    }
}

#[test]
fn test_missing_file_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let result = Config::load_from_path(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(EngineError::Config(_))));
}

#[test]
fn test_config_round_trips_through_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");

    let mut config = Config::default();
    config.core.log_level = "warn".to_string();
    config.execution.default_timeout_ms = 5_000;
    config.audit.max_entries = 128;
    config.signature.mandatory_at = TrustLevel::Trusted;

    std::fs::write(&path, config.to_toml().unwrap()).unwrap();
    let loaded = Config::load_from_path(&path).unwrap();

    assert_eq!(loaded, config);
}
