//! Wire-level manifest documents
//!
//! Manifests arrive as loosely typed documents tagged by `manifestVersion`.
//! Each supported version has its own variant; [`ManifestDocument::upgrade`]
//! converts older shapes to the latest one so validation and normalization only
//! ever deal with a single layout.
//!
//! Every field is defaulted so that a missing field decodes to an empty value and
//! is reported by the validator together with all other problems, rather than
//! aborting decoding at the first gap.

use serde::{Deserialize, Serialize};

pub const SUPPORTED_MANIFEST_VERSIONS: [&str; 2] = ["1.0", "1.1"];

/// Top-level fields recognised in a 1.0 document
pub const FIELDS_V1_0: &[&str] = &[
    "manifestVersion",
    "id",
    "name",
    "version",
    "description",
    "author",
    "license",
    "type",
    "main",
    "permissions",
    "resourceLimits",
    "signature",
];

/// Top-level fields recognised in a 1.1 document
pub const FIELDS_V1_1: &[&str] = &[
    "manifestVersion",
    "id",
    "name",
    "version",
    "description",
    "author",
    "license",
    "type",
    "main",
    "permissions",
    "resourceLimits",
    "networkPolicy",
    "signature",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "manifestVersion")]
pub enum ManifestDocument {
    #[serde(rename = "1.0")]
    V1_0(DocumentV1_0),
    #[serde(rename = "1.1")]
    V1_1(DocumentV1_1),
}

impl ManifestDocument {
    pub fn version_tag(&self) -> &'static str {
        match self {
            Self::V1_0(_) => "1.0",
            Self::V1_1(_) => "1.1",
        }
    }

    /// Bring the document up to the latest layout
    pub fn upgrade(self) -> DocumentV1_1 {
        match self {
            Self::V1_0(doc) => doc.upgrade(),
            Self::V1_1(doc) => doc,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawAuthor {
    pub name: String,
    pub email: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawSignature {
    pub algorithm: String,
    pub public_key: String,
    pub digest: String,
    pub signed_at: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawNetworkPolicy {
    pub allowed_hosts: Vec<String>,
    pub allowed_ports: Vec<i64>,
    pub allow_private_network: bool,
    pub allow_dns_resolution: bool,
}

impl Default for RawNetworkPolicy {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            allowed_ports: Vec::new(),
            allow_private_network: false,
            allow_dns_resolution: true,
        }
    }
}

impl RawNetworkPolicy {
    /// Any public host, no private ranges
    pub fn deny_private() -> Self {
        Self {
            allowed_hosts: vec!["*".to_string()],
            ..Self::default()
        }
    }
}

/// Explicit numeric limits; missing fields fall back to the `standard` preset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawCustomLimits {
    pub max_memory_mb: Option<f64>,
    pub max_cpu_percent: Option<f64>,
    pub max_network_bytes: Option<f64>,
    pub max_execution_ms: Option<f64>,
    pub max_concurrent_calls: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawLimits {
    Preset(String),
    Custom(RawCustomLimits),
}

impl Default for RawLimits {
    fn default() -> Self {
        Self::Preset(String::new())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DocumentV1_0 {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: RawAuthor,
    pub license: String,
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub main: String,
    pub permissions: Vec<String>,
    /// 1.0 only knows preset names
    pub resource_limits: String,
    pub signature: Option<RawSignature>,
}

impl DocumentV1_0 {
    fn upgrade(self) -> DocumentV1_1 {
        let declares_network = self
            .permissions
            .iter()
            .any(|p| p.starts_with("network:"));

        DocumentV1_1 {
            id: self.id,
            name: self.name,
            version: self.version,
            description: self.description,
            author: self.author,
            license: self.license,
            plugin_type: self.plugin_type,
            main: self.main,
            permissions: self.permissions,
            resource_limits: RawLimits::Preset(self.resource_limits),
            network_policy: declares_network.then(RawNetworkPolicy::deny_private),
            signature: self.signature,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DocumentV1_1 {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: RawAuthor,
    pub license: String,
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub main: String,
    pub permissions: Vec<String>,
    pub resource_limits: RawLimits,
    pub network_policy: Option<RawNetworkPolicy>,
    pub signature: Option<RawSignature>,
}
