//! Trusted signer store and manifest signature verification
//!
//! A manifest signature binds a signer key to the SHA-256 digest of the
//! canonical, unsigned manifest. Verification checks, in order:
//!
//! 1. the manifest carries a signature block
//! 2. its public key belongs to a trusted signer
//! 3. the stated digest equals the recomputed canonical digest
//! 4. the signature value verifies over the raw digest bytes
//!
//! Only `ed25519` values can be checked. `sha256-rsa` and `sha256-ecdsa`
//! blocks are parsed but always fail as unsupported: a pinned key and a
//! matching digest are both public and prove nothing on their own.
//!
//! A failed check is a normal result, never an error.
//!
//! The signer set is copy-on-write: readers take an `Arc` snapshot and never
//! block writers for longer than a pointer swap.

use crate::sync::{read, write};
use chrono::{DateTime, Utc};
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SIGNATURE_LENGTH};
use sdk::errors::EngineError;
use sdk::manifest::{ManifestSignature, PluginManifest, SignatureAlgorithm};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

pub(crate) const PEM_HEADER: &str = "-----BEGIN PUBLIC KEY-----";
pub(crate) const PEM_FOOTER: &str = "-----END PUBLIC KEY-----";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedSigner {
    pub id: String,
    pub name: String,
    pub public_key_pem: String,
    pub added_by: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureFailure {
    Unsigned,
    UnknownSigner,
    DigestMismatch,
    BadSignature,
    UnsupportedAlgorithm,
}

impl SignatureFailure {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unsigned => "unsigned",
            Self::UnknownSigner => "unknown_signer",
            Self::DigestMismatch => "digest_mismatch",
            Self::BadSignature => "bad_signature",
            Self::UnsupportedAlgorithm => "unsupported_algorithm",
        }
    }
}

impl fmt::Display for SignatureFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureCheck {
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<SignatureFailure>,
}

impl SignatureCheck {
    fn ok(signer_id: &str) -> Self {
        Self {
            verified: true,
            signer_id: Some(signer_id.to_string()),
            failure: None,
        }
    }

    fn fail(failure: SignatureFailure, signer_id: Option<&str>) -> Self {
        Self {
            verified: false,
            signer_id: signer_id.map(str::to_string),
            failure: Some(failure),
        }
    }

    pub fn unsigned() -> Self {
        Self::fail(SignatureFailure::Unsigned, None)
    }
}

pub struct TrustedSignerStore {
    signers: RwLock<Arc<Vec<TrustedSigner>>>,
}

impl Default for TrustedSignerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustedSignerStore {
    pub fn new() -> Self {
        Self {
            signers: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Current signer set; cheap to take, never blocks on writers for long
    pub fn snapshot(&self) -> Arc<Vec<TrustedSigner>> {
        Arc::clone(&read(&self.signers))
    }

    pub fn list(&self) -> Vec<TrustedSigner> {
        self.snapshot().as_ref().clone()
    }

    /// Trust a new signing key
    pub fn add(
        &self,
        name: &str,
        public_key_pem: &str,
        added_by: &str,
    ) -> Result<TrustedSigner, EngineError> {
        let mut errors = Vec::new();
        if name.trim().is_empty() {
            errors.push("signer name is required".to_string());
        }
        if !is_pem_public_key(public_key_pem) {
            errors.push(format!(
                "signer public key must be a PEM block starting with {}",
                PEM_HEADER
            ));
        }
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }

        let normalized = normalize_pem(public_key_pem);
        let mut guard = write(&self.signers);
        if let Some(existing) = guard
            .iter()
            .find(|s| normalize_pem(&s.public_key_pem) == normalized)
        {
            return Err(EngineError::InvalidState(format!(
                "key is already trusted as signer {}",
                existing.id
            )));
        }

        let signer = TrustedSigner {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            public_key_pem: public_key_pem.trim().to_string(),
            added_by: added_by.to_string(),
            added_at: Utc::now(),
        };

        let mut next = guard.as_ref().clone();
        next.push(signer.clone());
        *guard = Arc::new(next);

        info!(signer_id = %signer.id, "Trusted signer '{}' added by {}", signer.name, added_by);
        Ok(signer)
    }

    pub fn remove(&self, signer_id: &str) -> Result<TrustedSigner, EngineError> {
        let mut guard = write(&self.signers);
        let position = guard
            .iter()
            .position(|s| s.id == signer_id)
            .ok_or_else(|| EngineError::NotFound(format!("trusted signer {}", signer_id)))?;

        let mut next = guard.as_ref().clone();
        let removed = next.remove(position);
        *guard = Arc::new(next);

        info!(signer_id, "Trusted signer '{}' removed", removed.name);
        Ok(removed)
    }

    /// Check the manifest's signature against the trusted signer set
    pub fn verify(&self, manifest: &PluginManifest) -> SignatureCheck {
        let Some(signature) = manifest.signature.as_ref() else {
            return SignatureCheck::unsigned();
        };

        let signers = self.snapshot();
        let key = normalize_pem(&signature.public_key);
        let Some(signer) = signers
            .iter()
            .find(|s| normalize_pem(&s.public_key_pem) == key)
        else {
            warn!(plugin_id = %manifest.id, "Manifest signed by an unknown key");
            return SignatureCheck::fail(SignatureFailure::UnknownSigner, None);
        };

        let digest = match manifest.canonical_digest() {
            Ok(digest) => digest,
            Err(e) => {
                warn!(plugin_id = %manifest.id, "Could not canonicalize manifest: {}", e);
                return SignatureCheck::fail(SignatureFailure::DigestMismatch, Some(&signer.id));
            }
        };

        if !digest.eq_ignore_ascii_case(signature.digest.trim()) {
            warn!(plugin_id = %manifest.id, "Manifest digest mismatch");
            return SignatureCheck::fail(SignatureFailure::DigestMismatch, Some(&signer.id));
        }

        let outcome = match signature.algorithm {
            SignatureAlgorithm::Ed25519 => verify_ed25519(signer, signature, &digest),
            SignatureAlgorithm::Sha256Rsa | SignatureAlgorithm::Sha256Ecdsa => {
                Err(SignatureFailure::UnsupportedAlgorithm)
            }
        };

        match outcome {
            Ok(()) => {
                info!(
                    plugin_id = %manifest.id,
                    signer_id = %signer.id,
                    "Manifest signature verified"
                );
                SignatureCheck::ok(&signer.id)
            }
            Err(failure) => {
                warn!(
                    plugin_id = %manifest.id,
                    signer_id = %signer.id,
                    "Manifest signature rejected: {}",
                    failure
                );
                SignatureCheck::fail(failure, Some(&signer.id))
            }
        }
    }
}

fn verify_ed25519(
    signer: &TrustedSigner,
    signature: &ManifestSignature,
    digest: &str,
) -> Result<(), SignatureFailure> {
    let key = VerifyingKey::from_public_key_pem(signer.public_key_pem.trim())
        .map_err(|_| SignatureFailure::BadSignature)?;

    let value = signature
        .value
        .as_deref()
        .ok_or(SignatureFailure::BadSignature)?;
    let bytes = hex::decode(value.trim()).map_err(|_| SignatureFailure::BadSignature)?;
    if bytes.len() != SIGNATURE_LENGTH {
        return Err(SignatureFailure::BadSignature);
    }
    let sig = Signature::from_slice(&bytes).map_err(|_| SignatureFailure::BadSignature)?;

    let message = hex::decode(digest).map_err(|_| SignatureFailure::DigestMismatch)?;
    key.verify(&message, &sig)
        .map_err(|_| SignatureFailure::BadSignature)
}

/// Attach an ed25519 signature block to `manifest`
///
/// Used by packaging tooling and tests; the key never leaves the caller.
pub fn sign_ed25519(
    manifest: &PluginManifest,
    key: &SigningKey,
    public_key_pem: &str,
) -> Result<PluginManifest, EngineError> {
    let digest = manifest
        .canonical_digest()
        .map_err(|e| EngineError::Signature(format!("cannot canonicalize manifest: {}", e)))?;
    let message = hex::decode(&digest)
        .map_err(|e| EngineError::Signature(format!("invalid digest: {}", e)))?;
    let value = key.sign(&message);

    let mut signed = manifest.clone();
    signed.signature = Some(ManifestSignature {
        algorithm: SignatureAlgorithm::Ed25519,
        public_key: public_key_pem.trim().to_string(),
        digest,
        signed_at: Some(Utc::now()),
        value: Some(hex::encode(value.to_bytes())),
    });
    Ok(signed)
}

pub(crate) fn is_pem_public_key(pem: &str) -> bool {
    let trimmed = pem.trim();
    trimmed.starts_with(PEM_HEADER) && trimmed.ends_with(PEM_FOOTER)
}

/// Key identity independent of line wrapping and surrounding whitespace
pub(crate) fn normalize_pem(pem: &str) -> String {
    pem.split_whitespace().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
    use ed25519_dalek::pkcs8::EncodePublicKey;
    use sdk::limits::{LimitsSpec, ResourcePreset};
    use sdk::manifest::{Author, ManifestVersion, PluginType};
    use sdk::permissions::Permission;

    fn key_pair(seed: u8) -> (SigningKey, String) {
        let key = SigningKey::from_bytes(&[seed; 32]);
        let pem = key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        (key, pem)
    }

    fn manifest() -> PluginManifest {
        PluginManifest {
            manifest_version: ManifestVersion::V1_1,
            id: "alert-forwarder".to_string(),
            name: "Alert Forwarder".to_string(),
            version: "0.3.1".to_string(),
            description: String::new(),
            author: Author {
                name: "Ops".to_string(),
                email: None,
                url: None,
            },
            license: "MIT".to_string(),
            plugin_type: PluginType::Sink,
            main: "main.wasm".to_string(),
            permissions: [Permission::DataAlertRead].into_iter().collect(),
            resource_limits: LimitsSpec::Preset(ResourcePreset::Minimal),
            network_policy: None,
            signature: None,
        }
    }

    #[test]
    fn test_verify_correct_ed25519_signature() {
        let (key, pem) = key_pair(7);
        let store = TrustedSignerStore::new();
        let signer = store.add("release", &pem, "admin").unwrap();

        let signed = sign_ed25519(&manifest(), &key, &pem).unwrap();
        let check = store.verify(&signed);
        assert!(check.verified);
        assert_eq!(check.signer_id, Some(signer.id));
    }

    #[test]
    fn test_tampered_manifest_fails_digest() {
        let (key, pem) = key_pair(7);
        let store = TrustedSignerStore::new();
        store.add("release", &pem, "admin").unwrap();

        let mut signed = sign_ed25519(&manifest(), &key, &pem).unwrap();
        signed.permissions.insert(Permission::NetworkHttp);

        let check = store.verify(&signed);
        assert!(!check.verified);
        assert_eq!(check.failure, Some(SignatureFailure::DigestMismatch));
    }

    #[test]
    fn test_forged_value_fails() {
        let (_, pem) = key_pair(7);
        let (other, _) = key_pair(9);
        let store = TrustedSignerStore::new();
        store.add("release", &pem, "admin").unwrap();

        // Signed by a different key but claiming the trusted one
        let forged = sign_ed25519(&manifest(), &other, &pem).unwrap();
        let check = store.verify(&forged);
        assert_eq!(check.failure, Some(SignatureFailure::BadSignature));
    }

    #[test]
    fn test_unknown_signer_and_unsigned() {
        let (key, pem) = key_pair(3);
        let store = TrustedSignerStore::new();

        assert_eq!(
            store.verify(&manifest()).failure,
            Some(SignatureFailure::Unsigned)
        );

        let signed = sign_ed25519(&manifest(), &key, &pem).unwrap();
        assert_eq!(
            store.verify(&signed).failure,
            Some(SignatureFailure::UnknownSigner)
        );
    }

    #[test]
    fn test_pinned_key_and_digest_alone_do_not_verify() {
        let (_, pem) = key_pair(5);
        let store = TrustedSignerStore::new();
        store.add("legacy", &pem, "admin").unwrap();

        for algorithm in [SignatureAlgorithm::Sha256Rsa, SignatureAlgorithm::Sha256Ecdsa] {
            for value in [None, Some("00".repeat(64))] {
                let mut forged = manifest();
                forged.signature = Some(ManifestSignature {
                    algorithm,
                    public_key: pem.clone(),
                    digest: manifest().canonical_digest().unwrap(),
                    signed_at: None,
                    value,
                });

                let check = store.verify(&forged);
                assert!(!check.verified);
                assert_eq!(check.failure, Some(SignatureFailure::UnsupportedAlgorithm));
            }
        }
    }

    #[test]
    fn test_add_and_remove_signers() {
        let (_, pem) = key_pair(1);
        let store = TrustedSignerStore::new();

        assert!(matches!(
            store.add("bad", "not a key", "admin"),
            Err(EngineError::Validation(_))
        ));

        let signer = store.add("ci", &pem, "admin").unwrap();
        let rewrapped = pem.replace('\n', "\n\n");
        assert!(matches!(
            store.add("dup", &rewrapped, "admin"),
            Err(EngineError::InvalidState(_))
        ));

        let before = store.snapshot();
        store.remove(&signer.id).unwrap();
        assert_eq!(before.len(), 1);
        assert!(store.list().is_empty());
        assert!(store.remove(&signer.id).is_err());
    }
}
