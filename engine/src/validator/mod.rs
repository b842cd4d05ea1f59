//! Manifest validation
//!
//! Turns an untrusted manifest document into a normalized [`PluginManifest`].
//! Validation is pure and never stops at the first problem: every violation that
//! can be detected is collected so a plugin author sees the full list at once.
//!
//! Processing happens in three passes:
//!
//! 1. **Envelope**: the document must be an object with a supported
//!    `manifestVersion`; unknown top-level fields and wrongly typed scalar
//!    fields are reported and set aside.
//! 2. **Decode**: the remaining document is decoded into its versioned shape and
//!    upgraded to the latest layout.
//! 3. **Semantics**: identity, permissions, limits, network policy and signature
//!    rules are checked and the normalized manifest is built.

use crate::signer::{is_pem_public_key, PEM_HEADER};
use chrono::{DateTime, Utc};
use regex::Regex;
use sdk::document::{
    DocumentV1_1, ManifestDocument, RawCustomLimits, RawLimits, RawNetworkPolicy, RawSignature,
    FIELDS_V1_0, FIELDS_V1_1, SUPPORTED_MANIFEST_VERSIONS,
};
use sdk::errors::EngineError;
use sdk::limits::{LimitsSpec, ResourceLimits, ResourcePreset};
use sdk::manifest::{
    Author, ManifestSignature, ManifestVersion, NetworkPolicy, PluginManifest, PluginType,
    SignatureAlgorithm,
};
use sdk::permissions::Permission;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

const MAX_NAME_LEN: usize = 128;
const MAX_DESCRIPTION_LEN: usize = 4096;
const MAX_PERMISSIONS: usize = 64;
const SUPPORTED_LICENSES: [&str; 1] = ["MIT"];

/// Top-level fields that must be JSON strings when present
const STRING_FIELDS: [&str; 7] = [
    "id",
    "name",
    "version",
    "description",
    "license",
    "type",
    "main",
];

const OBJECT_FIELDS: [&str; 3] = ["author", "networkPolicy", "signature"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized: Option<PluginManifest>,
}

impl ValidationReport {
    fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
            normalized: None,
        }
    }

    /// Convert into the normalized manifest or a validation error
    pub fn into_result(self) -> Result<PluginManifest, EngineError> {
        match self.normalized {
            Some(manifest) if self.valid => Ok(manifest),
            _ => Err(EngineError::Validation(self.errors)),
        }
    }
}

pub struct ManifestValidator {
    id_pattern: Regex,
    email_pattern: Regex,
    host_pattern: Regex,
    digest_pattern: Regex,
}

impl ManifestValidator {
    pub fn new() -> Result<Self, EngineError> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| EngineError::Config(format!("invalid validator pattern: {}", e)))
        };

        Ok(Self {
            id_pattern: compile(r"^[a-z0-9][a-z0-9._-]{1,63}$")?,
            email_pattern: compile(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")?,
            host_pattern: compile(
                r"^(\*|(\*\.)?[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)*)$",
            )?,
            digest_pattern: compile(r"^[0-9a-fA-F]{64}$")?,
        })
    }

    /// Validate a manifest given as text: JSON, or TOML
    ///
    /// Text starting with `{` is read as JSON, anything else as TOML.
    pub fn validate_text(&self, text: &str) -> ValidationReport {
        let trimmed = text.trim_start();
        let parsed: Result<Value, String> = if trimmed.starts_with('{') {
            serde_json::from_str(trimmed).map_err(|e| format!("invalid JSON manifest: {}", e))
        } else {
            toml::from_str::<toml::Value>(text)
                .map_err(|e| format!("invalid TOML manifest: {}", e))
                .and_then(|v| {
                    serde_json::to_value(v).map_err(|e| format!("invalid TOML manifest: {}", e))
                })
        };

        match parsed {
            Ok(value) => self.validate(&value),
            Err(error) => ValidationReport::invalid(vec![error]),
        }
    }

    /// Validate a structured manifest document
    pub fn validate(&self, raw: &Value) -> ValidationReport {
        let Some(object) = raw.as_object() else {
            return ValidationReport::invalid(vec!["manifest must be an object".to_string()]);
        };

        let version = match object.get("manifestVersion") {
            None => {
                return ValidationReport::invalid(vec!["manifestVersion is required".to_string()])
            }
            Some(Value::String(v)) if SUPPORTED_MANIFEST_VERSIONS.contains(&v.as_str()) => {
                v.clone()
            }
            Some(Value::String(v)) => {
                return ValidationReport::invalid(vec![format!(
                    "unsupported manifestVersion '{}' (supported: {})",
                    v,
                    SUPPORTED_MANIFEST_VERSIONS.join(", ")
                )])
            }
            Some(_) => {
                return ValidationReport::invalid(vec![
                    "manifestVersion must be a string".to_string()
                ])
            }
        };

        let mut errors = Vec::new();
        let (cleaned, skipped) = self.check_envelope(object, &version, &mut errors);

        let document: ManifestDocument = match serde_json::from_value(Value::Object(cleaned)) {
            Ok(document) => document,
            Err(e) => {
                errors.push(format!("invalid manifest structure: {}", e));
                return ValidationReport::invalid(errors);
            }
        };

        let manifest_version = match document {
            ManifestDocument::V1_0(_) => ManifestVersion::V1_0,
            ManifestDocument::V1_1(_) => ManifestVersion::V1_1,
        };
        let document = document.upgrade();

        let manifest = self.check_semantics(manifest_version, document, &skipped, &mut errors);

        if errors.is_empty() {
            debug!(plugin_id = ?manifest.as_ref().map(|m| &m.id), "Manifest validated");
            ValidationReport {
                valid: true,
                errors,
                normalized: manifest,
            }
        } else {
            debug!(errors = errors.len(), "Manifest rejected");
            ValidationReport::invalid(errors)
        }
    }

    /// Report unknown and mistyped top-level fields and drop them from the
    /// document so decoding can proceed with the rest.
    fn check_envelope(
        &self,
        object: &Map<String, Value>,
        version: &str,
        errors: &mut Vec<String>,
    ) -> (Map<String, Value>, HashSet<String>) {
        let allowed: &[&str] = if version == "1.0" {
            FIELDS_V1_0
        } else {
            FIELDS_V1_1
        };

        let mut cleaned = Map::new();
        let mut skipped = HashSet::new();

        for (key, value) in object {
            if !allowed.contains(&key.as_str()) {
                errors.push(format!(
                    "unknown field '{}' for manifestVersion {}",
                    key, version
                ));
                continue;
            }

            let expected = if STRING_FIELDS.contains(&key.as_str()) {
                (!value.is_string()).then_some("a string")
            } else if OBJECT_FIELDS.contains(&key.as_str()) {
                (!value.is_object()).then_some("an object")
            } else if key == "permissions" {
                (!value.is_array()).then_some("an array of strings")
            } else if key == "resourceLimits" && version == "1.0" {
                (!value.is_string()).then_some("a preset name")
            } else if key == "resourceLimits" {
                (!value.is_string() && !value.is_object()).then_some("a preset name or an object")
            } else {
                None
            };

            if let Some(expected) = expected {
                errors.push(format!("{} must be {}", key, expected));
                skipped.insert(key.clone());
                continue;
            }

            if key == "permissions" {
                cleaned.insert(key.clone(), self.check_permission_items(value, errors));
            } else {
                cleaned.insert(key.clone(), value.clone());
            }
        }

        (cleaned, skipped)
    }

    fn check_permission_items(&self, value: &Value, errors: &mut Vec<String>) -> Value {
        let items = value.as_array().cloned().unwrap_or_default();
        let mut strings = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            match item {
                Value::String(_) => strings.push(item),
                _ => errors.push(format!("permissions[{}] must be a string", i)),
            }
        }
        Value::Array(strings)
    }

    fn check_semantics(
        &self,
        manifest_version: ManifestVersion,
        doc: DocumentV1_1,
        skipped: &HashSet<String>,
        errors: &mut Vec<String>,
    ) -> Option<PluginManifest> {
        let required = |field: &str, value: &str, errors: &mut Vec<String>| -> bool {
            if value.trim().is_empty() {
                if !skipped.contains(field) {
                    errors.push(format!("{} is required", field));
                }
                false
            } else {
                true
            }
        };

        if required("id", &doc.id, errors) && !self.id_pattern.is_match(&doc.id) {
            errors.push(format!(
                "id '{}' must be 2-64 characters of lowercase letters, digits, '.', '_' or '-', starting with a letter or digit",
                doc.id
            ));
        }

        if required("name", &doc.name, errors) && doc.name.chars().count() > MAX_NAME_LEN {
            errors.push(format!("name must be at most {} characters", MAX_NAME_LEN));
        }

        if required("version", &doc.version, errors) && semver::Version::parse(&doc.version).is_err()
        {
            errors.push(format!(
                "version '{}' is not a valid semantic version",
                doc.version
            ));
        }

        if doc.description.chars().count() > MAX_DESCRIPTION_LEN {
            errors.push(format!(
                "description must be at most {} characters",
                MAX_DESCRIPTION_LEN
            ));
        }

        let author = self.check_author(&doc, skipped, errors);

        if required("license", &doc.license, errors)
            && !SUPPORTED_LICENSES.contains(&doc.license.as_str())
        {
            errors.push(format!(
                "license '{}' is not supported (expected {})",
                doc.license,
                SUPPORTED_LICENSES.join(", ")
            ));
        }

        let plugin_type = if required("type", &doc.plugin_type, errors) {
            match doc.plugin_type.parse::<PluginType>() {
                Ok(t) => Some(t),
                Err(e) => {
                    errors.push(e);
                    None
                }
            }
        } else {
            None
        };

        if required("main", &doc.main, errors) && doc.main.contains("..") {
            errors.push("main must not contain '..'".to_string());
        }

        let permissions = check_permissions(&doc.permissions, errors);
        let limits = check_limits(&doc.resource_limits, skipped.contains("resourceLimits"), errors);
        let network_policy = doc
            .network_policy
            .as_ref()
            .and_then(|policy| self.check_network_policy(policy, errors));
        let signature = doc
            .signature
            .as_ref()
            .and_then(|sig| self.check_signature(sig, errors));

        if !errors.is_empty() {
            return None;
        }

        Some(PluginManifest {
            manifest_version,
            id: doc.id,
            name: doc.name.trim().to_string(),
            version: doc.version,
            description: doc.description,
            author: author?,
            license: doc.license,
            plugin_type: plugin_type?,
            main: doc.main,
            permissions,
            resource_limits: limits?,
            network_policy,
            signature,
        })
    }

    fn check_author(
        &self,
        doc: &DocumentV1_1,
        skipped: &HashSet<String>,
        errors: &mut Vec<String>,
    ) -> Option<Author> {
        if skipped.contains("author") {
            return None;
        }

        let raw = &doc.author;
        let before = errors.len();

        if raw.name.trim().is_empty() {
            errors.push("author.name is required".to_string());
        }
        if let Some(email) = raw.email.as_deref() {
            if !self.email_pattern.is_match(email) {
                errors.push(format!("author.email '{}' is not a valid email address", email));
            }
        }
        if let Some(url) = raw.url.as_deref() {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                errors.push(format!("author.url '{}' must be an http(s) URL", url));
            }
        }

        (errors.len() == before).then(|| Author {
            name: raw.name.trim().to_string(),
            email: raw.email.clone(),
            url: raw.url.clone(),
        })
    }

    fn check_network_policy(
        &self,
        raw: &RawNetworkPolicy,
        errors: &mut Vec<String>,
    ) -> Option<NetworkPolicy> {
        let before = errors.len();

        let mut hosts = Vec::with_capacity(raw.allowed_hosts.len());
        for host in &raw.allowed_hosts {
            let host = host.trim().to_ascii_lowercase();
            if self.host_pattern.is_match(&host) || host.parse::<std::net::IpAddr>().is_ok() {
                hosts.push(host);
            } else {
                errors.push(format!(
                    "networkPolicy.allowedHosts entry '{}' is not a valid host pattern",
                    host
                ));
            }
        }

        let mut ports = Vec::with_capacity(raw.allowed_ports.len());
        for port in &raw.allowed_ports {
            match u16::try_from(*port) {
                Ok(p) if p >= 1 => ports.push(p),
                _ => errors.push(format!(
                    "networkPolicy.allowedPorts entry {} must be between 1 and 65535",
                    port
                )),
            }
        }
        ports.sort_unstable();
        ports.dedup();

        (errors.len() == before).then(|| NetworkPolicy {
            allowed_hosts: hosts,
            allowed_ports: ports,
            allow_private_network: raw.allow_private_network,
            allow_dns_resolution: raw.allow_dns_resolution,
        })
    }

    fn check_signature(
        &self,
        raw: &RawSignature,
        errors: &mut Vec<String>,
    ) -> Option<ManifestSignature> {
        let before = errors.len();

        let algorithm = if raw.algorithm.is_empty() {
            errors.push("signature.algorithm is required".to_string());
            None
        } else {
            match raw.algorithm.parse::<SignatureAlgorithm>() {
                Ok(a) => Some(a),
                Err(e) => {
                    errors.push(format!("signature.algorithm: {}", e));
                    None
                }
            }
        };

        if raw.public_key.trim().is_empty() {
            errors.push("signature.publicKey is required".to_string());
        } else if !is_pem_public_key(&raw.public_key) {
            errors.push(format!(
                "signature.publicKey must be a PEM block starting with {}",
                PEM_HEADER
            ));
        }

        if raw.digest.is_empty() {
            errors.push("signature.digest is required".to_string());
        } else if !self.digest_pattern.is_match(&raw.digest) {
            errors.push("signature.digest must be 64 hexadecimal characters".to_string());
        }

        let needs_value = algorithm.is_some_and(SignatureAlgorithm::has_signature_value);
        if needs_value && raw.value.as_deref().map_or(true, |v| v.trim().is_empty()) {
            errors.push("signature.value is required for ed25519".to_string());
        }

        let signed_at = match raw.signed_at.as_deref() {
            None => None,
            Some(ts) => match DateTime::parse_from_rfc3339(ts) {
                Ok(t) => Some(t.with_timezone(&Utc)),
                Err(_) => {
                    errors.push(format!("signature.signedAt '{}' is not an RFC 3339 timestamp", ts));
                    None
                }
            },
        };

        if errors.len() != before {
            return None;
        }

        Some(ManifestSignature {
            algorithm: algorithm?,
            public_key: raw.public_key.trim().to_string(),
            digest: raw.digest.to_ascii_lowercase(),
            signed_at,
            value: raw.value.as_ref().map(|v| v.trim().to_ascii_lowercase()),
        })
    }
}

/// Every entry must be in the vocabulary; each unknown one is reported
fn check_permissions(raw: &[String], errors: &mut Vec<String>) -> BTreeSet<Permission> {
    if raw.len() > MAX_PERMISSIONS {
        errors.push(format!(
            "permissions must list at most {} entries",
            MAX_PERMISSIONS
        ));
    }

    let mut permissions = BTreeSet::new();
    for entry in raw {
        match entry.parse::<Permission>() {
            Ok(permission) => {
                permissions.insert(permission);
            }
            Err(e) => errors.push(e.to_string()),
        }
    }
    permissions
}

fn check_limits(raw: &RawLimits, skipped: bool, errors: &mut Vec<String>) -> Option<LimitsSpec> {
    if skipped {
        return None;
    }

    match raw {
        RawLimits::Preset(name) if name.is_empty() => {
            errors.push("resourceLimits is required".to_string());
            None
        }
        RawLimits::Preset(name) => match name.parse::<ResourcePreset>() {
            Ok(preset) => Some(LimitsSpec::Preset(preset)),
            Err(e) => {
                errors.push(format!(
                    "resourceLimits: {} (expected one of: {})",
                    e,
                    ResourcePreset::ALL.map(ResourcePreset::name).join(", ")
                ));
                None
            }
        },
        RawLimits::Custom(custom) => check_custom_limits(custom, errors).map(LimitsSpec::Custom),
    }
}

fn check_custom_limits(raw: &RawCustomLimits, errors: &mut Vec<String>) -> Option<ResourceLimits> {
    let base = ResourcePreset::Standard.limits();
    let before = errors.len();

    let mut whole = |field: &str, value: Option<f64>, fallback: u64| -> u64 {
        match value {
            None => fallback,
            Some(v) if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u64::MAX as f64 => {
                v as u64
            }
            Some(v) => {
                errors.push(format!(
                    "resourceLimits.{} must be a non-negative integer, got {}",
                    field, v
                ));
                fallback
            }
        }
    };

    let limits = ResourceLimits {
        max_memory_mb: whole("maxMemoryMb", raw.max_memory_mb, base.max_memory_mb),
        max_cpu_percent: whole("maxCpuPercent", raw.max_cpu_percent, base.max_cpu_percent),
        max_network_bytes: whole(
            "maxNetworkBytes",
            raw.max_network_bytes,
            base.max_network_bytes,
        ),
        max_execution_ms: whole("maxExecutionMs", raw.max_execution_ms, base.max_execution_ms),
        max_concurrent_calls: u32::try_from(whole(
            "maxConcurrentCalls",
            raw.max_concurrent_calls,
            u64::from(base.max_concurrent_calls),
        ))
        .unwrap_or(u32::MAX),
    };

    errors.extend(limits.bound_violations());
    (errors.len() == before).then_some(limits)
}
