//! Configuration management
//!
//! This module handles loading, validation, and management of the Bastion
//! configuration. Configuration is stored in TOML format at ~/.bastion/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level
//! - **review**: Risk weights and decision thresholds
//! - **circuit_breaker**: Failure threshold and cooldown
//! - **monitor**: Snapshot ring size and throttle window
//! - **execution**: Default call deadline
//! - **audit**: Retention of audit entries and security events
//! - **signature**: Signature enforcement policy
//!
//! Every section is optional; a missing section or key takes its default.
//!
//! # Examples
//!
//! ```no_run
//! use bastion_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Breaker threshold: {}", config.circuit_breaker.failure_threshold);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use sdk::permissions::TrustLevel;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Security review scoring
    #[serde(default)]
    pub review: ReviewConfig,

    /// Per-plugin circuit breaker
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Resource monitor
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Call execution
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Audit and event retention
    #[serde(default)]
    pub audit: AuditConfig,

    /// Signature policy
    #[serde(default)]
    pub signature: SignatureConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Risk scoring weights and thresholds
///
/// A plugin's score is the sum of the weights of its requested permissions,
/// each discounted by its trust level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default = "default_high_risk_weight")]
    pub high_risk_weight: f64,

    #[serde(default = "default_low_risk_weight")]
    pub low_risk_weight: f64,

    /// Scores above this go to a human
    #[serde(default = "default_pending_threshold")]
    pub pending_threshold: f64,

    /// Scores above this are rejected outright
    #[serde(default = "default_reject_threshold")]
    pub reject_threshold: f64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            high_risk_weight: default_high_risk_weight(),
            low_risk_weight: default_low_risk_weight(),
            pending_threshold: default_pending_threshold(),
            reject_threshold: default_reject_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open circuit waits before admitting a trial call
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Samples retained per plugin
    #[serde(default = "default_snapshot_capacity")]
    pub snapshot_capacity: usize,

    /// How long a breaching sample keeps new calls out
    #[serde(default = "default_throttle_window_ms")]
    pub throttle_window_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            snapshot_capacity: default_snapshot_capacity(),
            throttle_window_ms: default_throttle_window_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Deadline used when the caller does not supply one
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_max_audit_entries")]
    pub max_entries: usize,

    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_audit_entries(),
            max_events: default_max_events(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// Trust level from which a failed signature aborts the install
    /// instead of downgrading the plugin to `basic`
    #[serde(default = "default_mandatory_at")]
    pub mandatory_at: TrustLevel,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            mandatory_at: default_mandatory_at(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_high_risk_weight() -> f64 {
    3.0
}

fn default_low_risk_weight() -> f64 {
    1.0
}

fn default_pending_threshold() -> f64 {
    4.0
}

fn default_reject_threshold() -> f64 {
    15.0
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_snapshot_capacity() -> usize {
    60
}

fn default_throttle_window_ms() -> u64 {
    10_000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_audit_entries() -> usize {
    50_000
}

fn default_max_events() -> usize {
    10_000
}

fn default_mandatory_at() -> TrustLevel {
    TrustLevel::System
}

impl Config {
    /// Load configuration from the default location, creating it if missing
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load and validate configuration from a specific file
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let config = Self::default_config();
        config.validate()?;

        let toml_string = config.to_toml()?;
        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".bastion").join("config.toml"))
    }

    pub fn default_config() -> Self {
        Self::default()
    }

    pub fn to_toml(&self) -> Result<String, EngineError> {
        toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Check value ranges and cross-field constraints
    pub fn validate(&self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let review = &self.review;
        if !(review.high_risk_weight >= 0.0 && review.low_risk_weight >= 0.0) {
            return Err(EngineError::Config(
                "review weights must be non-negative".to_string(),
            ));
        }
        if !(review.pending_threshold >= 0.0) {
            return Err(EngineError::Config(
                "review.pending_threshold must be non-negative".to_string(),
            ));
        }
        if !(review.reject_threshold >= review.pending_threshold) {
            return Err(EngineError::Config(
                "review.reject_threshold must not be below review.pending_threshold".to_string(),
            ));
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(EngineError::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.cooldown_ms == 0 {
            return Err(EngineError::Config(
                "circuit_breaker.cooldown_ms must be at least 1".to_string(),
            ));
        }

        if self.monitor.snapshot_capacity == 0 {
            return Err(EngineError::Config(
                "monitor.snapshot_capacity must be at least 1".to_string(),
            ));
        }

        if self.execution.default_timeout_ms == 0 {
            return Err(EngineError::Config(
                "execution.default_timeout_ms must be at least 1".to_string(),
            ));
        }

        if self.audit.max_entries == 0 || self.audit.max_events == 0 {
            return Err(EngineError::Config(
                "audit.max_entries and audit.max_events must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default_config();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.review.high_risk_weight, 3.0);
        assert_eq!(config.review.pending_threshold, 4.0);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.cooldown_ms, 30_000);
        assert_eq!(config.monitor.snapshot_capacity, 60);
        assert_eq!(config.signature.mandatory_at, TrustLevel::System);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_takes_defaults() {
        let config = Config::from_toml_str(
            r#"
            [circuit_breaker]
            failure_threshold = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.cooldown_ms, 30_000);
        assert_eq!(config.review, ReviewConfig::default());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = Config::from_toml_str("[core]\nlog_level = \"loud\"\n").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let err = Config::from_toml_str(
            "[review]\npending_threshold = 10.0\nreject_threshold = 5.0\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("reject_threshold"));

        assert!(Config::from_toml_str("[signature]\nmandatory_at = \"root\"\n").is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default_config();
        let toml_string = config.to_toml().unwrap();

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(config, deserialized);
    }
}
