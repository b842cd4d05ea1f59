//! Normalized plugin manifest
//!
//! A [`PluginManifest`] is what the validator produces from a raw document. It is
//! immutable once built: an upgrade or an administrative escalation produces a
//! new value that supersedes the previous one.

use crate::limits::{LimitsSpec, ResourceLimits};
use crate::permissions::Permission;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestVersion {
    #[serde(rename = "1.0")]
    V1_0,
    #[serde(rename = "1.1")]
    V1_1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Source,
    Processor,
    Sink,
    Analyzer,
    Visualizer,
    Integration,
    Utility,
}

impl PluginType {
    pub const ALL: [PluginType; 7] = [
        PluginType::Source,
        PluginType::Processor,
        PluginType::Sink,
        PluginType::Analyzer,
        PluginType::Visualizer,
        PluginType::Integration,
        PluginType::Utility,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Processor => "processor",
            Self::Sink => "sink",
            Self::Analyzer => "analyzer",
            Self::Visualizer => "visualizer",
            Self::Integration => "integration",
            Self::Utility => "utility",
        }
    }
}

impl FromStr for PluginType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PluginType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown plugin type '{}'", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Outbound network rules for plugins holding network permissions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicy {
    /// Exact hosts, `*.suffix` wildcards, or `*` for any public host
    pub allowed_hosts: Vec<String>,
    /// Empty means any port
    pub allowed_ports: Vec<u16>,
    pub allow_private_network: bool,
    pub allow_dns_resolution: bool,
}

impl NetworkPolicy {
    /// Any public host on any port, nothing private
    pub fn deny_private() -> Self {
        Self {
            allowed_hosts: vec!["*".to_string()],
            allowed_ports: Vec::new(),
            allow_private_network: false,
            allow_dns_resolution: true,
        }
    }

    /// Check an outbound target against the policy
    ///
    /// Returns a short description of the violated rule on refusal.
    pub fn check(&self, host: &str, port: u16) -> Result<(), String> {
        let host = host
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();

        if host.is_empty() {
            return Err("empty host".to_string());
        }

        let ip = host.parse::<IpAddr>().ok();

        if !self.allow_private_network && is_private_target(&host, ip) {
            return Err(format!("{} is a private network address", host));
        }

        if ip.is_none() && !self.allow_dns_resolution {
            return Err(format!("{} requires DNS resolution", host));
        }

        if !self.allowed_hosts.iter().any(|p| host_matches(p, &host)) {
            return Err(format!("{} is not an allowed host", host));
        }

        if !self.allowed_ports.is_empty() && !self.allowed_ports.contains(&port) {
            return Err(format!("port {} is not allowed", port));
        }

        Ok(())
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host.ends_with(&format!(".{}", suffix));
    }
    pattern == host
}

fn is_private_target(host: &str, ip: Option<IpAddr>) -> bool {
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }
    match ip {
        Some(IpAddr::V4(v4)) => is_private_v4(v4),
        Some(IpAddr::V6(v6)) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_v4(v4);
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
        None => false,
    }
}

fn is_private_v4(v4: Ipv4Addr) -> bool {
    let [a, b, ..] = v4.octets();
    v4.is_private()
        || v4.is_loopback()
        || v4.is_link_local()
        || v4.is_unspecified()
        || v4.is_broadcast()
        // 100.64.0.0/10 shared address space
        || (a == 100 && (b & 0xc0) == 64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    #[serde(rename = "sha256-rsa")]
    Sha256Rsa,
    #[serde(rename = "sha256-ecdsa")]
    Sha256Ecdsa,
    #[serde(rename = "ed25519")]
    Ed25519,
}

impl SignatureAlgorithm {
    pub const ALL: [SignatureAlgorithm; 3] = [
        SignatureAlgorithm::Sha256Rsa,
        SignatureAlgorithm::Sha256Ecdsa,
        SignatureAlgorithm::Ed25519,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sha256Rsa => "sha256-rsa",
            Self::Sha256Ecdsa => "sha256-ecdsa",
            Self::Ed25519 => "ed25519",
        }
    }

    /// Whether the signature value itself is checked, not just key and digest
    pub const fn has_signature_value(self) -> bool {
        matches!(self, Self::Ed25519)
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SignatureAlgorithm::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unsupported signature algorithm '{}'", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSignature {
    pub algorithm: SignatureAlgorithm,
    pub public_key: String,
    /// Hex SHA-256 of the canonical unsigned manifest
    pub digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_at: Option<DateTime<Utc>>,
    /// Hex signature over the raw digest bytes (ed25519)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub manifest_version: ManifestVersion,
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: Author,
    pub license: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    pub main: String,
    pub permissions: BTreeSet<Permission>,
    pub resource_limits: LimitsSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_policy: Option<NetworkPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<ManifestSignature>,
}

impl PluginManifest {
    pub fn declares(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn limits(&self) -> ResourceLimits {
        self.resource_limits.resolve()
    }

    /// Declared policy, or the deny-private default when none was given
    pub fn effective_network_policy(&self) -> NetworkPolicy {
        self.network_policy
            .clone()
            .unwrap_or_else(NetworkPolicy::deny_private)
    }

    /// Canonical JSON of every field except the signature
    ///
    /// Object keys are emitted in sorted order at every depth.
    pub fn canonical_json(&self) -> Result<String, serde_json::Error> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        let value = serde_json::to_value(&unsigned)?;
        let mut out = String::new();
        write_canonical(&value, &mut out);
        Ok(out)
    }

    /// Hex SHA-256 of [`canonical_json`](Self::canonical_json)
    pub fn canonical_digest(&self) -> Result<String, serde_json::Error> {
        let canonical = self.canonical_json()?;
        Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
    }

    /// Superseding manifest that additionally declares `permission`
    ///
    /// The signature is dropped because it no longer covers the content.
    pub fn with_permission(&self, permission: Permission) -> PluginManifest {
        let mut next = self.clone();
        next.permissions.insert(permission);
        next.signature = None;
        next
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
