//! Bastion SDK
//!
//! Shared types for the Bastion plugin security core: the permission vocabulary,
//! manifest documents and their normalized form, resource limits, the error
//! taxonomy, and the runtime trait an execution substrate implements.

/// Error types and handling
pub mod errors;

/// Permission vocabulary and trust levels
pub mod permissions;

/// Resource limits and presets
pub mod limits;

/// Versioned wire documents
pub mod document;

/// Normalized manifest
pub mod manifest;

/// Host operations callable by plugins
pub mod method;

/// Execution substrate trait
pub mod runtime;

// Re-export commonly used types
pub use errors::{EngineError, EngineErrorExt};
pub use limits::{LimitsSpec, ResourceDimension, ResourceLimits, ResourcePreset, ResourceSample};
pub use manifest::{
    Author, ManifestSignature, ManifestVersion, NetworkPolicy, PluginManifest, PluginType,
    SignatureAlgorithm,
};
pub use method::PluginMethod;
pub use permissions::{DenialReason, Permission, PermissionCategory, PermissionInfo, TrustLevel};
pub use runtime::{PluginResponse, PluginRuntime};
