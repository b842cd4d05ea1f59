//! Permission vocabulary and trust levels
//!
//! The permission vocabulary is closed: every capability a plugin can request is
//! a variant of [`Permission`]. Unknown strings never map to a permission, so a
//! manifest that names one fails validation instead of being silently trimmed.

use crate::limits::ResourcePreset;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A single named capability from the closed vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    StorageRead,
    StorageWrite,
    NetworkHttp,
    NetworkWs,
    EventSubscribe,
    EventPublish,
    DataDeviceRead,
    DataDeviceWrite,
    DataSensorRead,
    DataSensorWrite,
    DataAlertRead,
    DataAlertWrite,
    DataDiagnosisRead,
    DataDiagnosisWrite,
    ModelInference,
    ModelEmbed,
    UiNotification,
    UiWidget,
    SystemConfigRead,
    SystemLog,
}

/// Coarse grouping used by dashboards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionCategory {
    Storage,
    Network,
    Event,
    Data,
    Model,
    Ui,
    System,
}

/// Returned by `Permission::from_str` for strings outside the vocabulary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPermission(pub String);

impl fmt::Display for UnknownPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown permission '{}'", self.0)
    }
}

impl std::error::Error for UnknownPermission {}

impl Permission {
    pub const ALL: [Permission; 20] = [
        Permission::StorageRead,
        Permission::StorageWrite,
        Permission::NetworkHttp,
        Permission::NetworkWs,
        Permission::EventSubscribe,
        Permission::EventPublish,
        Permission::DataDeviceRead,
        Permission::DataDeviceWrite,
        Permission::DataSensorRead,
        Permission::DataSensorWrite,
        Permission::DataAlertRead,
        Permission::DataAlertWrite,
        Permission::DataDiagnosisRead,
        Permission::DataDiagnosisWrite,
        Permission::ModelInference,
        Permission::ModelEmbed,
        Permission::UiNotification,
        Permission::UiWidget,
        Permission::SystemConfigRead,
        Permission::SystemLog,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StorageRead => "storage:read",
            Self::StorageWrite => "storage:write",
            Self::NetworkHttp => "network:http",
            Self::NetworkWs => "network:ws",
            Self::EventSubscribe => "event:subscribe",
            Self::EventPublish => "event:publish",
            Self::DataDeviceRead => "data:device:read",
            Self::DataDeviceWrite => "data:device:write",
            Self::DataSensorRead => "data:sensor:read",
            Self::DataSensorWrite => "data:sensor:write",
            Self::DataAlertRead => "data:alert:read",
            Self::DataAlertWrite => "data:alert:write",
            Self::DataDiagnosisRead => "data:diagnosis:read",
            Self::DataDiagnosisWrite => "data:diagnosis:write",
            Self::ModelInference => "model:inference",
            Self::ModelEmbed => "model:embed",
            Self::UiNotification => "ui:notification",
            Self::UiWidget => "ui:widget",
            Self::SystemConfigRead => "system:config:read",
            Self::SystemLog => "system:log",
        }
    }

    /// High-risk permissions weigh more in review and are outside the
    /// auto-approval ceiling of low trust levels.
    pub const fn is_high_risk(self) -> bool {
        matches!(
            self,
            Self::NetworkHttp
                | Self::NetworkWs
                | Self::EventPublish
                | Self::DataDeviceWrite
                | Self::DataSensorWrite
                | Self::DataAlertWrite
                | Self::DataDiagnosisWrite
                | Self::SystemConfigRead
        )
    }

    /// Permissions that always need a human decision below `trusted`
    pub const fn requires_escalation(self) -> bool {
        matches!(self, Self::SystemConfigRead)
    }

    pub const fn is_network(self) -> bool {
        matches!(self, Self::NetworkHttp | Self::NetworkWs)
    }

    pub const fn category(self) -> PermissionCategory {
        match self {
            Self::StorageRead | Self::StorageWrite => PermissionCategory::Storage,
            Self::NetworkHttp | Self::NetworkWs => PermissionCategory::Network,
            Self::EventSubscribe | Self::EventPublish => PermissionCategory::Event,
            Self::DataDeviceRead
            | Self::DataDeviceWrite
            | Self::DataSensorRead
            | Self::DataSensorWrite
            | Self::DataAlertRead
            | Self::DataAlertWrite
            | Self::DataDiagnosisRead
            | Self::DataDiagnosisWrite => PermissionCategory::Data,
            Self::ModelInference | Self::ModelEmbed => PermissionCategory::Model,
            Self::UiNotification | Self::UiWidget => PermissionCategory::Ui,
            Self::SystemConfigRead | Self::SystemLog => PermissionCategory::System,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::StorageRead => "Read from the plugin's private key-value storage",
            Self::StorageWrite => "Write to the plugin's private key-value storage",
            Self::NetworkHttp => "Make outbound HTTP requests",
            Self::NetworkWs => "Open outbound WebSocket connections",
            Self::EventSubscribe => "Subscribe to platform events",
            Self::EventPublish => "Publish events onto the platform bus",
            Self::DataDeviceRead => "Read device records",
            Self::DataDeviceWrite => "Create or modify device records",
            Self::DataSensorRead => "Read sensor readings",
            Self::DataSensorWrite => "Write sensor readings",
            Self::DataAlertRead => "Read alerts",
            Self::DataAlertWrite => "Raise or modify alerts",
            Self::DataDiagnosisRead => "Read diagnostic results",
            Self::DataDiagnosisWrite => "Write diagnostic results",
            Self::ModelInference => "Run inference on hosted models",
            Self::ModelEmbed => "Compute embeddings with hosted models",
            Self::UiNotification => "Show notifications to operators",
            Self::UiWidget => "Render a dashboard widget",
            Self::SystemConfigRead => "Read host system configuration",
            Self::SystemLog => "Write to the host log",
        }
    }

    pub fn info(self) -> PermissionInfo {
        PermissionInfo {
            permission: self,
            category: self.category(),
            description: self.description().to_string(),
            high_risk: self.is_high_risk(),
            requires_escalation: self.requires_escalation(),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = UnknownPermission;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownPermission(s.to_string()))
    }
}

impl Serialize for Permission {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Permission {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Vocabulary entry as exposed by `getAvailablePermissions`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionInfo {
    pub permission: Permission,
    pub category: PermissionCategory,
    pub description: String,
    pub high_risk: bool,
    pub requires_escalation: bool,
}

/// Coarse classification of plugin origin trust
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Untrusted,
    Basic,
    Verified,
    Trusted,
    System,
}

impl TrustLevel {
    pub const ALL: [TrustLevel; 5] = [
        TrustLevel::Untrusted,
        TrustLevel::Basic,
        TrustLevel::Verified,
        TrustLevel::Trusted,
        TrustLevel::System,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Untrusted => "untrusted",
            Self::Basic => "basic",
            Self::Verified => "verified",
            Self::Trusted => "trusted",
            Self::System => "system",
        }
    }

    /// Fraction of the risk weight forgiven at this level
    pub const fn risk_discount(self) -> f64 {
        match self {
            Self::Untrusted => 0.0,
            Self::Basic => 0.25,
            Self::Verified => 0.5,
            Self::Trusted => 0.75,
            Self::System => 1.0,
        }
    }

    /// Whether `permission` falls inside the automatically granted scope
    pub const fn ceiling_allows(self, permission: Permission) -> bool {
        match self {
            Self::Untrusted | Self::Basic => !permission.is_high_risk(),
            Self::Verified => !permission.requires_escalation(),
            Self::Trusted | Self::System => true,
        }
    }

    pub const fn resource_ceiling(self) -> ResourcePreset {
        match self {
            Self::Untrusted => ResourcePreset::Minimal,
            Self::Basic | Self::Verified => ResourcePreset::Standard,
            Self::Trusted => ResourcePreset::Performance,
            Self::System => ResourcePreset::Unrestricted,
        }
    }

    /// Levels at or above `verified` must present a valid signature
    pub const fn requires_signature(self) -> bool {
        matches!(self, Self::Verified | Self::Trusted | Self::System)
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrustLevel::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown trust level '{}'", s))
    }
}

/// Why an authorization was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NotDeclared,
    NotGranted,
    Revoked,
    PluginNotActive,
}

impl DenialReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotDeclared => "not_declared",
            Self::NotGranted => "not_granted",
            Self::Revoked => "revoked",
            Self::PluginNotActive => "plugin_not_active",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_permissions() {
        assert_eq!(
            "data:alert:write".parse::<Permission>().unwrap(),
            Permission::DataAlertWrite
        );
        assert_eq!(
            "system:log".parse::<Permission>().unwrap(),
            Permission::SystemLog
        );
    }

    #[test]
    fn test_unknown_permission_fails_closed() {
        let err = "foo:bar".parse::<Permission>().unwrap_err();
        assert_eq!(err, UnknownPermission("foo:bar".to_string()));
        assert!("data:*:read".parse::<Permission>().is_err());
        assert!("".parse::<Permission>().is_err());
    }

    #[test]
    fn test_permission_serde_uses_wire_names() {
        let json = serde_json::to_string(&Permission::NetworkHttp).unwrap();
        assert_eq!(json, "\"network:http\"");

        let parsed: Permission = serde_json::from_str("\"model:embed\"").unwrap();
        assert_eq!(parsed, Permission::ModelEmbed);

        assert!(serde_json::from_str::<Permission>("\"network:ftp\"").is_err());
    }

    #[test]
    fn test_trust_levels_are_ordered() {
        assert!(TrustLevel::Untrusted < TrustLevel::Basic);
        assert!(TrustLevel::Verified < TrustLevel::Trusted);
        assert!(TrustLevel::Trusted < TrustLevel::System);
        assert_eq!(TrustLevel::System.risk_discount(), 1.0);
    }

    #[test]
    fn test_ceiling_by_trust() {
        assert!(TrustLevel::Basic.ceiling_allows(Permission::SystemLog));
        assert!(!TrustLevel::Basic.ceiling_allows(Permission::NetworkHttp));
        assert!(TrustLevel::Verified.ceiling_allows(Permission::NetworkHttp));
        assert!(!TrustLevel::Verified.ceiling_allows(Permission::SystemConfigRead));
        assert!(TrustLevel::Trusted.ceiling_allows(Permission::SystemConfigRead));
    }

    #[test]
    fn test_denial_reason_wire_names() {
        let json = serde_json::to_string(&DenialReason::PluginNotActive).unwrap();
        assert_eq!(json, "\"plugin_not_active\"");
    }
}
