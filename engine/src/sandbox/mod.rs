//! Sandbox manager
//!
//! Owns the lifecycle of plugin instances and wires each one into the
//! permission gateway, resource monitor and circuit breaker.
//!
//! ```text
//! installing ──activate──▶ active ◀──resume── paused
//!                            │  ▲      pause──▶
//!              breaker opens │  │ breaker closes
//!                            ▼  │
//!                           error
//! any state ──destroy──▶ uninstalled
//! ```
//!
//! Each instance lives in its own slot: a mutex around the instance record and
//! a semaphore bounding concurrent calls to `maxConcurrentCalls`.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerState};
use crate::events::{SecurityEventStore, SeverityCounts};
use crate::gateway::{InitialPermissions, PermissionGateway};
use crate::monitor::{ResourceMonitor, ResourceSnapshot};
use crate::sync::{lock, read, write};
use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use sdk::limits::{ResourceDimension, ResourceLimits};
use sdk::manifest::PluginManifest;
use sdk::permissions::{Permission, TrustLevel};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    Installing,
    Active,
    Paused,
    Error,
    Uninstalled,
}

impl PluginStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Installing => "installing",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Uninstalled => "uninstalled",
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInstance {
    pub plugin_id: String,
    pub manifest: PluginManifest,
    pub trust_level: TrustLevel,
    /// Effective permissions as of the last change
    pub granted_permissions: BTreeSet<Permission>,
    pub resource_limits: ResourceLimits,
    pub status: PluginStatus,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything the dashboards show for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    pub instance: PluginInstance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_snapshot: Option<ResourceSnapshot>,
    pub effective_permissions: BTreeSet<Permission>,
    pub open_events: SeverityCounts,
    pub available_slots: usize,
}

struct Slot {
    instance: Mutex<PluginInstance>,
    calls: Arc<Semaphore>,
}

pub struct SandboxManager {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    gateway: Arc<PermissionGateway>,
    monitor: Arc<ResourceMonitor>,
    breaker: Arc<CircuitBreaker>,
    events: Arc<SecurityEventStore>,
}

impl SandboxManager {
    pub fn new(
        gateway: Arc<PermissionGateway>,
        monitor: Arc<ResourceMonitor>,
        breaker: Arc<CircuitBreaker>,
        events: Arc<SecurityEventStore>,
    ) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            gateway,
            monitor,
            breaker,
            events,
        }
    }

    fn slot(&self, plugin_id: &str) -> Result<Arc<Slot>, EngineError> {
        read(&self.slots)
            .get(plugin_id)
            .map(Arc::clone)
            .ok_or_else(|| EngineError::NotFound(format!("plugin {}", plugin_id)))
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        read(&self.slots).contains_key(plugin_id)
    }

    /// Create an instance in `installing` state
    ///
    /// Limits are clamped to the trust level's resource ceiling. The instance
    /// becomes callable once [`activate`](Self::activate) is called.
    pub fn create(
        &self,
        manifest: PluginManifest,
        trust: TrustLevel,
        initial: InitialPermissions,
    ) -> Result<PluginInstance, EngineError> {
        let plugin_id = manifest.id.clone();
        let limits = manifest
            .limits()
            .clamp_to(&trust.resource_ceiling().limits());

        let mut slots = write(&self.slots);
        if slots.contains_key(&plugin_id) {
            return Err(EngineError::AlreadyInstalled(plugin_id));
        }

        let effective = self
            .gateway
            .register(&plugin_id, manifest.permissions.clone(), initial);

        let now = Utc::now();
        let instance = PluginInstance {
            plugin_id: plugin_id.clone(),
            manifest,
            trust_level: trust,
            granted_permissions: effective,
            resource_limits: limits,
            status: PluginStatus::Installing,
            installed_at: now,
            updated_at: now,
        };

        slots.insert(
            plugin_id.clone(),
            Arc::new(Slot {
                instance: Mutex::new(instance.clone()),
                calls: Arc::new(Semaphore::new(limits.max_concurrent_calls as usize)),
            }),
        );

        info!(
            plugin_id = %plugin_id,
            trust = %trust,
            max_memory_mb = limits.max_memory_mb,
            max_concurrent_calls = limits.max_concurrent_calls,
            "Sandbox created"
        );
        Ok(instance)
    }

    /// Move an installing instance to `active` and start watching it
    ///
    /// The breaker and resource monitor only exist from here until `destroy`.
    pub fn activate(&self, plugin_id: &str) -> Result<PluginInstance, EngineError> {
        let instance =
            self.transition(plugin_id, &[PluginStatus::Installing], PluginStatus::Active)?;
        self.monitor.register(plugin_id, instance.resource_limits);
        self.breaker.register(plugin_id);
        Ok(instance)
    }

    /// Tear down an instance and everything registered for it
    ///
    /// Later authorizations for the plugin fail with `plugin_not_active`.
    pub fn destroy(&self, plugin_id: &str) -> Result<PluginInstance, EngineError> {
        let slot = write(&self.slots)
            .remove(plugin_id)
            .ok_or_else(|| EngineError::NotFound(format!("plugin {}", plugin_id)))?;

        slot.calls.close();
        self.gateway.unregister(plugin_id);
        self.monitor.unregister(plugin_id);
        self.breaker.unregister(plugin_id);

        let mut instance = lock(&slot.instance);
        instance.status = PluginStatus::Uninstalled;
        instance.updated_at = Utc::now();
        info!(plugin_id, "Sandbox destroyed");
        Ok(instance.clone())
    }

    pub fn pause(&self, plugin_id: &str) -> Result<PluginInstance, EngineError> {
        let instance =
            self.transition(plugin_id, &[PluginStatus::Active], PluginStatus::Paused)?;
        self.gateway.set_active(plugin_id, false);
        Ok(instance)
    }

    pub fn resume(&self, plugin_id: &str) -> Result<PluginInstance, EngineError> {
        let instance =
            self.transition(plugin_id, &[PluginStatus::Paused], PluginStatus::Active)?;
        self.gateway.set_active(plugin_id, true);
        Ok(instance)
    }

    /// Flag an instance as failing. Permissions stay registered so a
    /// half-open trial call can still be authorized.
    ///
    /// A paused instance stays paused; only `resume` makes it callable again.
    pub fn mark_error(&self, plugin_id: &str) -> Result<PluginInstance, EngineError> {
        self.transition(
            plugin_id,
            &[PluginStatus::Active, PluginStatus::Error],
            PluginStatus::Error,
        )
    }

    /// Restore an errored instance after its breaker closes
    pub fn mark_recovered(&self, plugin_id: &str) -> Result<PluginInstance, EngineError> {
        let slot = self.slot(plugin_id)?;
        let mut instance = lock(&slot.instance);
        if instance.status == PluginStatus::Error {
            instance.status = PluginStatus::Active;
            instance.updated_at = Utc::now();
            self.gateway.set_active(plugin_id, true);
            info!(plugin_id, "Plugin recovered");
        }
        Ok(instance.clone())
    }

    fn transition(
        &self,
        plugin_id: &str,
        from: &[PluginStatus],
        to: PluginStatus,
    ) -> Result<PluginInstance, EngineError> {
        let slot = self.slot(plugin_id)?;
        let mut instance = lock(&slot.instance);
        if !from.contains(&instance.status) {
            return Err(EngineError::InvalidState(format!(
                "plugin {} is {}, cannot become {}",
                plugin_id, instance.status, to
            )));
        }
        if instance.status != to {
            debug!(plugin_id, from = %instance.status, to = %to, "Plugin status changed");
            instance.status = to;
            instance.updated_at = Utc::now();
        }
        Ok(instance.clone())
    }

    /// Replace the manifest of a running instance
    ///
    /// Used when an escalation widens the declared permissions.
    pub fn supersede_manifest(
        &self,
        plugin_id: &str,
        manifest: PluginManifest,
    ) -> Result<PluginInstance, EngineError> {
        let slot = self.slot(plugin_id)?;
        let mut instance = lock(&slot.instance);
        if manifest.id != instance.plugin_id {
            return Err(EngineError::InvalidState(format!(
                "manifest for {} cannot replace {}",
                manifest.id, instance.plugin_id
            )));
        }
        instance.manifest = manifest;
        instance.updated_at = Utc::now();
        Ok(instance.clone())
    }

    /// Copy the gateway's effective set onto the instance record
    pub fn sync_permissions(&self, plugin_id: &str) -> Result<PluginInstance, EngineError> {
        let slot = self.slot(plugin_id)?;
        let effective = self
            .gateway
            .effective_permissions(plugin_id)
            .unwrap_or_default();
        let mut instance = lock(&slot.instance);
        instance.granted_permissions = effective;
        instance.updated_at = Utc::now();
        Ok(instance.clone())
    }

    /// Take one concurrent-call slot
    ///
    /// Untrusted and basic plugins are refused immediately when saturated.
    /// Higher trust levels wait for a slot.
    pub async fn acquire_call(&self, plugin_id: &str) -> Result<OwnedSemaphorePermit, EngineError> {
        let slot = self.slot(plugin_id)?;
        let trust = lock(&slot.instance).trust_level;
        let calls = Arc::clone(&slot.calls);
        drop(slot);

        let closed = || EngineError::InvalidState(format!("plugin {} was uninstalled", plugin_id));
        if trust <= TrustLevel::Basic {
            calls.try_acquire_owned().map_err(|e| match e {
                TryAcquireError::NoPermits => {
                    warn!(plugin_id, "Concurrent call limit reached");
                    EngineError::ResourceLimitExceeded {
                        plugin_id: plugin_id.to_string(),
                        dimension: ResourceDimension::Concurrency,
                    }
                }
                TryAcquireError::Closed => closed(),
            })
        } else {
            calls.acquire_owned().await.map_err(|_| closed())
        }
    }

    pub fn get(&self, plugin_id: &str) -> Option<PluginInstance> {
        self.slot(plugin_id)
            .ok()
            .map(|slot| lock(&slot.instance).clone())
    }

    /// All instances sorted by plugin id
    pub fn list(&self) -> Vec<PluginInstance> {
        let slots: Vec<Arc<Slot>> = read(&self.slots).values().map(Arc::clone).collect();
        let mut instances: Vec<PluginInstance> = slots
            .iter()
            .map(|slot| lock(&slot.instance).clone())
            .collect();
        instances.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        instances
    }

    pub fn status(&self, plugin_id: &str) -> Option<SandboxStatus> {
        let slot = self.slot(plugin_id).ok()?;
        let instance = lock(&slot.instance).clone();
        Some(SandboxStatus {
            circuit_breaker: self.breaker.state(plugin_id),
            latest_snapshot: self.monitor.latest(plugin_id),
            effective_permissions: self
                .gateway
                .effective_permissions(plugin_id)
                .unwrap_or_default(),
            open_events: self.events.unresolved_counts(Some(plugin_id)),
            available_slots: slot.calls.available_permits(),
            instance,
        })
    }

    pub fn get_all_status(&self) -> Vec<SandboxStatus> {
        self.list()
            .iter()
            .filter_map(|instance| self.status(&instance.plugin_id))
            .collect()
    }
}
