//! Error types and handling
//!
//! This module provides the error taxonomy used throughout the Bastion security
//! core. All errors implement the `EngineErrorExt` trait which provides
//! user-friendly hints and indicates whether errors are recoverable.
//!
//! # Security
//!
//! Error messages are safe to hand back to the hosting application:
//! - No key material or signatures are included
//! - No plugin payloads are echoed
//! - Identifiers are limited to plugin ids, permission names and event ids

use crate::limits::ResourceDimension;
use crate::permissions::{DenialReason, Permission};
use thiserror::Error;

/// Trait for engine error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait EngineErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is a static string and never contains request data.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors are transient or caller-correctable: backing off,
    /// waiting for review, or fixing the request may succeed. Non-recoverable
    /// errors require a new manifest submission or administrative action.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Install time**: `Validation`, `Signature`, `ReviewRejected`, `AlreadyInstalled`
/// - **Per call**: `PermissionDenied`, `CircuitOpen`, `ResourceLimitExceeded`,
///   `Timeout`, `NetworkPolicyViolation`, `Plugin`
/// - **Administrative**: `NotFound`, `InvalidState`, `Config`
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, EngineErrorExt};
/// use sdk::permissions::{DenialReason, Permission};
///
/// let error = EngineError::PermissionDenied {
///     plugin_id: "vibration-analyzer".to_string(),
///     permission: Permission::NetworkHttp,
///     reason: DenialReason::NotGranted,
/// };
/// assert!(error.is_recoverable());
///
/// let fatal = EngineError::ReviewRejected {
///     plugin_id: "vibration-analyzer".to_string(),
///     reason: "risk score too high".to_string(),
/// };
/// assert!(!fatal.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Install-time errors
    #[error("Manifest validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Signature verification failed: {0}")]
    Signature(String),

    #[error("Review rejected for plugin {plugin_id}: {reason}")]
    ReviewRejected { plugin_id: String, reason: String },

    #[error("Plugin already installed: {0}")]
    AlreadyInstalled(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Per-call errors
    #[error("Permission {permission} denied for plugin {plugin_id}: {reason}")]
    PermissionDenied {
        plugin_id: String,
        permission: Permission,
        reason: DenialReason,
    },

    #[error("Circuit open for plugin {plugin_id}, retry after {retry_after_ms} ms")]
    CircuitOpen {
        plugin_id: String,
        retry_after_ms: u64,
    },

    #[error("Resource limit exceeded for plugin {plugin_id}: {dimension}")]
    ResourceLimitExceeded {
        plugin_id: String,
        dimension: ResourceDimension,
    },

    #[error("Execution of plugin {plugin_id} timed out after {timeout_ms} ms")]
    Timeout { plugin_id: String, timeout_ms: u64 },

    #[error("Network policy of plugin {plugin_id} does not allow {target}")]
    NetworkPolicyViolation { plugin_id: String, target: String },

    #[error("Plugin error: {0}")]
    Plugin(String),

    // Lookup errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
}

impl EngineErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",

            Self::Validation(_) => "Fix the reported manifest problems and submit again",
            Self::Signature(_) => "Manifest signature could not be verified. Re-sign the manifest",
            Self::ReviewRejected { .. } => "Plugin was rejected. Submit a new manifest",
            Self::AlreadyInstalled(_) => "Uninstall the plugin before installing it again",
            Self::InvalidState(_) => "Operation is not allowed in the current state",

            Self::PermissionDenied { .. } => "The plugin is not allowed to perform this operation",
            Self::CircuitOpen { .. } => "Plugin is failing repeatedly. Back off and try later",
            Self::ResourceLimitExceeded { .. } => {
                "Plugin is over its resource limits. Try again shortly"
            }
            Self::Timeout { .. } => "Plugin took too long to respond",
            Self::NetworkPolicyViolation { .. } => "The plugin may not contact this host",
            Self::Plugin(_) => "Plugin execution failed. Check plugin logs",

            Self::NotFound(_) => "The requested item does not exist",
            Self::UnknownOperation(_) => "Unknown operation requested",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::Validation(_)
            | Self::Signature(_)
            | Self::ReviewRejected { .. }
            | Self::UnknownOperation(_) => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}
