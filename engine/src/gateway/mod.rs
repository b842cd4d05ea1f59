//! Permission gateway
//!
//! Runtime mediation of every capability a plugin uses. Each plugin has a
//! permission overlay:
//!
//! - **declared**: what the manifest asks for, the hard upper bound
//! - **baseline**: what was approved at install time
//! - **granted**: added later by an administrator
//! - **revoked**: removed later by an administrator
//!
//! The effective set is `(baseline ∪ granted) − revoked` and is always a subset
//! of `declared`. Only the administrative escalation path can widen `declared`.
//!
//! Every authorization, grant, revoke and escalation is written to the audit
//! log while the plugin's overlay is locked, so a plugin's audit trail is in the
//! same order as the decisions it records.

pub mod audit;

pub use audit::{AuditAction, AuditFilter, AuditLog, AuditLogEntry};

use crate::sync::{lock, read, write};
use audit::AuditRecord;
use sdk::errors::EngineError;
use sdk::permissions::{DenialReason, Permission, TrustLevel};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Outcome of a single capability check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
}

impl AuthorizationDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: DenialReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Permission assignment a plugin starts with once it is approved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitialPermissions {
    pub baseline: BTreeSet<Permission>,
    pub granted: BTreeSet<Permission>,
    pub revoked: BTreeSet<Permission>,
}

impl InitialPermissions {
    /// Automatic approval: everything declared that the trust ceiling allows
    pub fn automatic(declared: &BTreeSet<Permission>, trust: TrustLevel) -> Self {
        Self {
            baseline: declared
                .iter()
                .copied()
                .filter(|p| trust.ceiling_allows(*p))
                .collect(),
            ..Self::default()
        }
    }

    /// Administrative approval of exactly `approved`
    ///
    /// Permissions outside the approval are recorded as revoked so that the
    /// baseline granted by the trust ceiling cannot bring them back.
    pub fn administrative(
        declared: &BTreeSet<Permission>,
        trust: TrustLevel,
        approved: &BTreeSet<Permission>,
    ) -> Self {
        let automatic = Self::automatic(declared, trust);
        Self {
            baseline: automatic.baseline,
            granted: approved.intersection(declared).copied().collect(),
            revoked: declared.difference(approved).copied().collect(),
        }
    }

    /// What this assignment makes effective
    pub fn effective(&self) -> BTreeSet<Permission> {
        self.baseline
            .union(&self.granted)
            .copied()
            .filter(|p| !self.revoked.contains(p))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOverlay {
    pub declared: BTreeSet<Permission>,
    pub baseline: BTreeSet<Permission>,
    pub granted: BTreeSet<Permission>,
    pub revoked: BTreeSet<Permission>,
    pub active: bool,
}

impl PermissionOverlay {
    fn new(declared: BTreeSet<Permission>, initial: InitialPermissions) -> Self {
        let keep = |set: BTreeSet<Permission>| -> BTreeSet<Permission> {
            set.into_iter().filter(|p| declared.contains(p)).collect()
        };
        Self {
            baseline: keep(initial.baseline),
            granted: keep(initial.granted),
            revoked: keep(initial.revoked),
            declared,
            active: true,
        }
    }

    pub fn effective(&self) -> BTreeSet<Permission> {
        self.baseline
            .union(&self.granted)
            .copied()
            .filter(|p| !self.revoked.contains(p) && self.declared.contains(p))
            .collect()
    }

    pub fn allows(&self, permission: Permission) -> bool {
        self.declared.contains(&permission)
            && !self.revoked.contains(&permission)
            && (self.baseline.contains(&permission) || self.granted.contains(&permission))
    }

    fn check(&self, permission: Permission) -> AuthorizationDecision {
        if !self.active {
            AuthorizationDecision::deny(DenialReason::PluginNotActive)
        } else if !self.declared.contains(&permission) {
            AuthorizationDecision::deny(DenialReason::NotDeclared)
        } else if self.revoked.contains(&permission) {
            AuthorizationDecision::deny(DenialReason::Revoked)
        } else if self.allows(permission) {
            AuthorizationDecision::allow()
        } else {
            AuthorizationDecision::deny(DenialReason::NotGranted)
        }
    }
}

type OverlayCell = Arc<Mutex<PermissionOverlay>>;

pub struct PermissionGateway {
    plugins: RwLock<HashMap<String, OverlayCell>>,
    audit: AuditLog,
}

impl PermissionGateway {
    pub fn new(max_audit_entries: usize) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            audit: AuditLog::new(max_audit_entries),
        }
    }

    fn cell(&self, plugin_id: &str) -> Option<OverlayCell> {
        read(&self.plugins).get(plugin_id).map(Arc::clone)
    }

    /// Start mediating `plugin_id`, replacing any previous overlay
    pub fn register(
        &self,
        plugin_id: &str,
        declared: BTreeSet<Permission>,
        initial: InitialPermissions,
    ) -> BTreeSet<Permission> {
        let overlay = PermissionOverlay::new(declared, initial);
        let effective = overlay.effective();
        write(&self.plugins).insert(plugin_id.to_string(), Arc::new(Mutex::new(overlay)));
        info!(
            plugin_id,
            "Registered permissions: {}",
            join_permissions(&effective)
        );
        effective
    }

    /// Stop mediating `plugin_id`; later checks fail with `plugin_not_active`
    pub fn unregister(&self, plugin_id: &str) {
        if write(&self.plugins).remove(plugin_id).is_some() {
            debug!(plugin_id, "Permissions unregistered");
        }
    }

    /// Toggle whether authorizations can succeed (pause and resume)
    pub fn set_active(&self, plugin_id: &str, active: bool) {
        if let Some(cell) = self.cell(plugin_id) {
            lock(&cell).active = active;
            debug!(plugin_id, active, "Permission overlay activity changed");
        }
    }

    /// Decide whether `plugin_id` may use `permission` right now
    ///
    /// Always appends exactly one audit entry recording the decision.
    pub fn authorize(&self, plugin_id: &str, permission: Permission) -> AuthorizationDecision {
        let cell = self.cell(plugin_id);
        let guard = cell.as_ref().map(|c| lock(c));
        let decision = match guard.as_deref() {
            Some(overlay) => overlay.check(permission),
            None => AuthorizationDecision::deny(DenialReason::PluginNotActive),
        };

        self.audit.append(AuditRecord {
            plugin_id,
            permission,
            action: AuditAction::Authorize,
            allowed: decision.allowed,
            reason: decision.reason.map(|r| r.as_str().to_string()),
            actor: None,
        });
        drop(guard);

        if !decision.allowed {
            debug!(
                plugin_id,
                permission = %permission,
                reason = ?decision.reason,
                "Authorization denied"
            );
        }

        decision
    }

    /// Add `permission` to the effective set
    ///
    /// Only declared permissions can be granted. Granting an effective
    /// permission changes nothing but is still audited.
    pub fn grant_permission(
        &self,
        plugin_id: &str,
        permission: Permission,
        actor: &str,
    ) -> Result<BTreeSet<Permission>, EngineError> {
        self.change(plugin_id, permission, actor, AuditAction::Grant)
    }

    /// Remove `permission` from the effective set
    ///
    /// Revoking twice leaves the effective set unchanged; both calls are audited.
    pub fn revoke_permission(
        &self,
        plugin_id: &str,
        permission: Permission,
        actor: &str,
    ) -> Result<BTreeSet<Permission>, EngineError> {
        self.change(plugin_id, permission, actor, AuditAction::Revoke)
    }

    fn change(
        &self,
        plugin_id: &str,
        permission: Permission,
        actor: &str,
        action: AuditAction,
    ) -> Result<BTreeSet<Permission>, EngineError> {
        let Some(cell) = self.cell(plugin_id) else {
            self.audit.append(AuditRecord {
                plugin_id,
                permission,
                action,
                allowed: false,
                reason: Some(DenialReason::PluginNotActive.as_str().to_string()),
                actor: Some(actor),
            });
            return Err(EngineError::NotFound(format!("plugin {}", plugin_id)));
        };

        let mut overlay = lock(&cell);

        if !overlay.declared.contains(&permission) {
            self.audit.append(AuditRecord {
                plugin_id,
                permission,
                action,
                allowed: false,
                reason: Some(DenialReason::NotDeclared.as_str().to_string()),
                actor: Some(actor),
            });
            warn!(
                plugin_id,
                permission = %permission,
                "Refused to {} undeclared permission",
                action
            );
            return Err(EngineError::PermissionDenied {
                plugin_id: plugin_id.to_string(),
                permission,
                reason: DenialReason::NotDeclared,
            });
        }

        let before = overlay.allows(permission);
        match action {
            AuditAction::Grant => {
                overlay.revoked.remove(&permission);
                overlay.granted.insert(permission);
            }
            _ => {
                overlay.granted.remove(&permission);
                overlay.revoked.insert(permission);
            }
        }
        let after = overlay.allows(permission);

        self.audit.append(AuditRecord {
            plugin_id,
            permission,
            action,
            allowed: true,
            reason: (before == after).then(|| "unchanged".to_string()),
            actor: Some(actor),
        });

        info!(
            plugin_id,
            permission = %permission,
            changed = before != after,
            "Permission {} by {}",
            if action == AuditAction::Grant { "granted" } else { "revoked" },
            actor
        );

        Ok(overlay.effective())
    }

    /// Administrative path that widens the declared set
    ///
    /// The caller is responsible for superseding the plugin's manifest so the
    /// two stay in agreement.
    pub fn escalate_permission(
        &self,
        plugin_id: &str,
        permission: Permission,
        actor: &str,
        justification: &str,
    ) -> Result<BTreeSet<Permission>, EngineError> {
        let cell = self
            .cell(plugin_id)
            .ok_or_else(|| EngineError::NotFound(format!("plugin {}", plugin_id)))?;

        let mut overlay = lock(&cell);
        overlay.declared.insert(permission);
        overlay.revoked.remove(&permission);
        overlay.granted.insert(permission);

        self.audit.append(AuditRecord {
            plugin_id,
            permission,
            action: AuditAction::Escalate,
            allowed: true,
            reason: Some(justification.to_string()),
            actor: Some(actor),
        });

        warn!(
            plugin_id,
            permission = %permission,
            "Permission escalated by {}: {}",
            actor,
            justification
        );

        Ok(overlay.effective())
    }

    pub fn effective_permissions(&self, plugin_id: &str) -> Option<BTreeSet<Permission>> {
        self.cell(plugin_id).map(|cell| lock(&cell).effective())
    }

    pub fn overlay(&self, plugin_id: &str) -> Option<PermissionOverlay> {
        self.cell(plugin_id).map(|cell| lock(&cell).clone())
    }

    pub fn get_audit_log(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        self.audit.query(filter)
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }
}

pub(crate) fn join_permissions(set: &BTreeSet<Permission>) -> String {
    if set.is_empty() {
        return "(none)".to_string();
    }
    set.iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
