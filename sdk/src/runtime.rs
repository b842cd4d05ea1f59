//! Execution substrate seam
//!
//! The security core never runs plugin code itself. A [`PluginRuntime`] is the
//! isolation layer (WASM host, worker process, container) that loads a plugin and
//! performs calls on its behalf. The sandbox manager wraps every call with
//! authorization, resource admission, concurrency limits and a deadline.

use crate::errors::EngineError;
use crate::limits::ResourceSample;
use crate::manifest::PluginManifest;
use crate::method::PluginMethod;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a runtime hands back for one call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginResponse {
    pub output: Value,
    /// Usage measured during the call, if the runtime can observe it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResourceSample>,
}

impl PluginResponse {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: ResourceSample) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Isolation layer that actually executes plugin code
///
/// Implementations must be cancel-safe: the sandbox drops the `invoke` future
/// when a call exceeds its deadline.
#[async_trait]
pub trait PluginRuntime: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    /// Prepare an instance for `manifest`
    async fn load(&self, manifest: &PluginManifest, code: &[u8]) -> Result<(), EngineError>;

    /// Run one call inside the instance
    async fn invoke(
        &self,
        plugin_id: &str,
        method: PluginMethod,
        args: Value,
    ) -> Result<PluginResponse, EngineError>;

    /// Release the instance. Unloading an unknown plugin is not an error.
    async fn unload(&self, plugin_id: &str) -> Result<(), EngineError>;
}
