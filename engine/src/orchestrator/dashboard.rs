//! Read-only views for hosts and dashboards
//!
//! Nothing here changes state or writes audit entries.

use super::SecurityOrchestrator;
use crate::circuit_breaker::{CircuitBreakerState, CircuitState};
use crate::events::{EventFilter, SecurityEvent, SeverityCounts};
use crate::gateway::{AuditFilter, AuditLogEntry, PermissionOverlay};
use crate::monitor::{ResourceSnapshot, UsageSummary};
use crate::review::ReviewRecord;
use crate::sandbox::{PluginInstance, PluginStatus, SandboxStatus};
use crate::signer::TrustedSigner;
use sdk::limits::{ResourceLimits, ResourcePreset};
use sdk::permissions::{Permission, PermissionInfo};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const OVERVIEW_AUDIT_LIMIT: usize = 20;
const DASHBOARD_EVENT_LIMIT: usize = 10;

/// Everything known about one plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityOverview {
    pub plugin_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PermissionOverlay>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSummary>,
    pub recent_audit: Vec<AuditLogEntry>,
    pub open_events: Vec<SecurityEvent>,
}

/// Fleet-wide summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityDashboard {
    pub total_plugins: usize,
    pub by_status: BTreeMap<String, usize>,
    pub open_circuits: Vec<CircuitBreakerState>,
    pub pending_reviews: usize,
    pub open_events: SeverityCounts,
    pub recent_events: Vec<SecurityEvent>,
    pub trusted_signers: usize,
    pub audit_entries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetInfo {
    pub name: ResourcePreset,
    pub limits: ResourceLimits,
}

impl SecurityOrchestrator {
    pub fn list_instances(&self) -> Vec<PluginInstance> {
        self.sandbox.list()
    }

    pub fn get_instance(&self, plugin_id: &str) -> Option<PluginInstance> {
        self.sandbox.get(plugin_id)
    }

    pub fn get_security_overview(&self, plugin_id: &str) -> SecurityOverview {
        SecurityOverview {
            plugin_id: plugin_id.to_string(),
            sandbox: self.sandbox.status(plugin_id),
            permissions: self.gateway.overlay(plugin_id),
            review: self.review.latest(plugin_id),
            usage: self.monitor.summary(plugin_id),
            recent_audit: self.gateway.get_audit_log(&AuditFilter {
                limit: Some(OVERVIEW_AUDIT_LIMIT),
                ..AuditFilter::for_plugin(plugin_id)
            }),
            open_events: self.events.list(&EventFilter {
                unresolved_only: true,
                ..EventFilter::for_plugin(plugin_id)
            }),
        }
    }

    pub fn get_security_dashboard(&self) -> SecurityDashboard {
        let instances = self.sandbox.list();
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        for instance in &instances {
            *by_status
                .entry(instance.status.as_str().to_string())
                .or_default() += 1;
        }

        SecurityDashboard {
            total_plugins: instances.len(),
            by_status,
            open_circuits: self
                .breaker
                .all_states()
                .into_iter()
                .filter(|s| s.state != CircuitState::Closed)
                .collect(),
            pending_reviews: self.review.pending().len(),
            open_events: self.events.unresolved_counts(None),
            recent_events: self.events.list(&EventFilter {
                limit: Some(DASHBOARD_EVENT_LIMIT),
                ..EventFilter::default()
            }),
            trusted_signers: self.signers.snapshot().len(),
            audit_entries: self.gateway.audit().len(),
        }
    }

    pub fn get_audit_log(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        self.gateway.get_audit_log(filter)
    }

    pub fn get_security_events(&self, filter: &EventFilter) -> Vec<SecurityEvent> {
        self.events.list(filter)
    }

    /// Retained samples, for one plugin or all of them
    pub fn get_resource_snapshots(
        &self,
        plugin_id: Option<&str>,
    ) -> HashMap<String, Vec<ResourceSnapshot>> {
        match plugin_id {
            Some(id) => {
                let samples = self.monitor.get_snapshot(id);
                if samples.is_empty() {
                    HashMap::new()
                } else {
                    HashMap::from([(id.to_string(), samples)])
                }
            }
            None => self.monitor.get_all_snapshots(),
        }
    }

    pub fn get_sandbox_status(&self, plugin_id: Option<&str>) -> Vec<SandboxStatus> {
        match plugin_id {
            Some(id) => self.sandbox.status(id).into_iter().collect(),
            None => self.sandbox.get_all_status(),
        }
    }

    pub fn get_available_permissions(&self) -> Vec<PermissionInfo> {
        Permission::ALL.iter().map(|p| p.info()).collect()
    }

    pub fn get_resource_presets(&self) -> Vec<PresetInfo> {
        ResourcePreset::ALL
            .iter()
            .map(|&name| PresetInfo {
                name,
                limits: name.limits(),
            })
            .collect()
    }

    pub fn list_trusted_signers(&self) -> Vec<TrustedSigner> {
        self.signers.list()
    }

    pub fn get_pending_reviews(&self) -> Vec<ReviewRecord> {
        self.review.pending()
    }

    pub fn get_review_history(&self, plugin_id: Option<&str>) -> Vec<ReviewRecord> {
        self.review.history(plugin_id)
    }

    /// Instances currently able to serve calls
    pub fn active_instances(&self) -> Vec<PluginInstance> {
        self.sandbox
            .list()
            .into_iter()
            .filter(|i| i.status == PluginStatus::Active)
            .collect()
    }
}
