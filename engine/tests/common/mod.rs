//! Shared fixtures for the engine integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bastion_engine::config::Config;
use bastion_engine::orchestrator::SecurityOrchestrator;
use bastion_engine::signer::sign_ed25519;
use bastion_engine::validator::ManifestValidator;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::EncodePublicKey;
use ed25519_dalek::SigningKey;
use sdk::errors::EngineError;
use sdk::limits::ResourceSample;
use sdk::manifest::{ManifestSignature, PluginManifest};
use sdk::method::PluginMethod;
use sdk::runtime::{PluginResponse, PluginRuntime};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Runtime double whose behaviour the test switches at will
#[derive(Default)]
pub struct MockRuntime {
    pub fail: AtomicBool,
    pub fail_load: AtomicBool,
    pub delay: Mutex<Duration>,
    pub usage: Mutex<Option<ResourceSample>>,
    pub calls: AtomicUsize,
    pub loaded: Mutex<Vec<String>>,
    pub unloaded: Mutex<Vec<String>>,
}

impl MockRuntime {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_load_failing(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_usage(&self, usage: ResourceSample) {
        *self.usage.lock().unwrap() = Some(usage);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PluginRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn load(&self, manifest: &PluginManifest, _code: &[u8]) -> Result<(), EngineError> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(EngineError::Plugin(format!("{} failed to load", manifest.id)));
        }
        self.loaded.lock().unwrap().push(manifest.id.clone());
        Ok(())
    }

    async fn invoke(
        &self,
        plugin_id: &str,
        method: PluginMethod,
        _args: Value,
    ) -> Result<PluginResponse, EngineError> {
        // Behaviour is fixed when the call starts, so overlapping calls can differ
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        let fail = self.fail.load(Ordering::SeqCst);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(EngineError::Plugin(format!("{} crashed", plugin_id)));
        }
        let response = PluginResponse::new(json!({ "method": method.as_str() }));
        Ok(match *self.usage.lock().unwrap() {
            Some(usage) => response.with_usage(usage),
            None => response,
        })
    }

    async fn unload(&self, plugin_id: &str) -> Result<(), EngineError> {
        self.unloaded.lock().unwrap().push(plugin_id.to_string());
        Ok(())
    }
}

pub fn orchestrator_with(config: Config) -> (SecurityOrchestrator, Arc<MockRuntime>) {
    let runtime = Arc::new(MockRuntime::default());
    let shared: Arc<dyn PluginRuntime> = Arc::clone(&runtime) as Arc<dyn PluginRuntime>;
    let orchestrator = SecurityOrchestrator::new(config, shared).unwrap();
    (orchestrator, runtime)
}

pub fn orchestrator() -> (SecurityOrchestrator, Arc<MockRuntime>) {
    orchestrator_with(Config::default())
}

pub fn manifest_json(id: &str, permissions: &[&str]) -> Value {
    json!({
        "manifestVersion": "1.1",
        "id": id,
        "name": format!("Plugin {}", id),
        "version": "1.0.0",
        "description": "integration fixture",
        "author": { "name": "Fixture Co", "email": "dev@fixture.io" },
        "license": "MIT",
        "type": "processor",
        "main": "dist/plugin.wasm",
        "permissions": permissions,
        "resourceLimits": "standard"
    })
}

/// Deterministic key pair and its PEM public key
pub fn key_pair(seed: u8) -> (SigningKey, String) {
    let key = SigningKey::from_bytes(&[seed; 32]);
    let pem = key
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap();
    (key, pem)
}

/// Detached signature over the normalized form of `raw`
pub fn sign(raw: &Value, key: &SigningKey, pem: &str) -> ManifestSignature {
    let manifest = ManifestValidator::new()
        .unwrap()
        .validate(raw)
        .into_result()
        .unwrap();
    sign_ed25519(&manifest, key, pem)
        .unwrap()
        .signature
        .unwrap()
}
