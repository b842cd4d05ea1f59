//! Security orchestrator
//!
//! The single entry point hosts use. It owns every security component and
//! runs the install, execute and uninstall flows across them:
//!
//! ```text
//! install:  validate → verify signature → review → sandbox → runtime load
//! execute:  breaker → permission → authorize → network policy → admission
//!           → concurrency slot → runtime call under deadline → record
//! ```
//!
//! Read-only queries live in [`dashboard`].

pub mod dashboard;

use crate::circuit_breaker::{BreakerTransition, CircuitBreaker};
use crate::config::Config;
use crate::events::{SecurityEvent, SecurityEventStore, SecurityEventType, Severity};
use crate::gateway::{InitialPermissions, PermissionGateway};
use crate::message_bus::{Event, MessageBus, PermissionChange};
use crate::monitor::ResourceMonitor;
use crate::review::{PendingSubmission, ReviewDecision, ReviewRecord, SecurityReviewEngine};
use crate::sandbox::{PluginInstance, PluginStatus, SandboxManager};
use crate::signer::{SignatureCheck, TrustedSigner, TrustedSignerStore};
use crate::validator::ManifestValidator;
use sdk::errors::EngineError;
use sdk::limits::{ResourceDimension, ResourceSample};
use sdk::manifest::{ManifestSignature, PluginManifest};
use sdk::method::PluginMethod;
use sdk::permissions::{DenialReason, Permission, TrustLevel};
use sdk::runtime::PluginRuntime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Result of an install attempt that passed validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallOutcome {
    pub review: ReviewRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<PluginInstance>,
}

/// Result of one mediated call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub plugin_id: String,
    pub method: PluginMethod,
    pub output: Value,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResourceSample>,
}

/// Releases a half-open trial call slot unless the call's outcome was recorded
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    plugin_id: &'a str,
    armed: bool,
}

impl TrialGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_trial(self.plugin_id);
        }
    }
}

pub struct SecurityOrchestrator {
    config: Config,
    validator: ManifestValidator,
    signers: TrustedSignerStore,
    review: SecurityReviewEngine,
    gateway: Arc<PermissionGateway>,
    monitor: Arc<ResourceMonitor>,
    breaker: Arc<CircuitBreaker>,
    events: Arc<SecurityEventStore>,
    sandbox: SandboxManager,
    runtime: Arc<dyn PluginRuntime>,
    bus: Arc<MessageBus>,
}

impl SecurityOrchestrator {
    pub fn new(config: Config, runtime: Arc<dyn PluginRuntime>) -> Result<Self, EngineError> {
        Self::with_message_bus(config, runtime, Arc::new(MessageBus::new()))
    }

    pub fn with_message_bus(
        config: Config,
        runtime: Arc<dyn PluginRuntime>,
        bus: Arc<MessageBus>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let events = Arc::new(SecurityEventStore::new(config.audit.max_events));
        let gateway = Arc::new(PermissionGateway::new(config.audit.max_entries));
        let monitor = Arc::new(ResourceMonitor::new(
            config.monitor.snapshot_capacity,
            Duration::from_millis(config.monitor.throttle_window_ms),
            Arc::clone(&events),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker.failure_threshold,
            Duration::from_millis(config.circuit_breaker.cooldown_ms),
        ));
        let sandbox = SandboxManager::new(
            Arc::clone(&gateway),
            Arc::clone(&monitor),
            Arc::clone(&breaker),
            Arc::clone(&events),
        );

        info!(runtime = runtime.name(), "Security orchestrator ready");

        Ok(Self {
            validator: ManifestValidator::new()?,
            signers: TrustedSignerStore::new(),
            review: SecurityReviewEngine::new(config.review.clone()),
            gateway,
            monitor,
            breaker,
            events,
            sandbox,
            runtime,
            bus,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn message_bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    /// Validate, verify, review and (when approved) start a plugin
    ///
    /// Validation errors abort with no side effects. A pending or rejected
    /// review is a normal outcome without an instance.
    pub async fn secure_install(
        &self,
        raw: &Value,
        code: &[u8],
        signature: Option<ManifestSignature>,
        trust: TrustLevel,
    ) -> Result<InstallOutcome, EngineError> {
        let mut manifest = self.validator.validate(raw).into_result()?;
        if signature.is_some() {
            manifest.signature = signature;
        }

        if self.sandbox.contains(&manifest.id) {
            return Err(EngineError::AlreadyInstalled(manifest.id));
        }

        let (check, trust) = self.verify_origin(&manifest, trust).await?;

        let record = self.review.submit(PendingSubmission {
            manifest: manifest.clone(),
            code: code.to_vec(),
            trust_level: trust,
            signature: check,
        });

        self.settle_review(record, manifest, code, trust, None).await
    }

    /// Verify the manifest signature and settle the effective trust level
    async fn verify_origin(
        &self,
        manifest: &PluginManifest,
        trust: TrustLevel,
    ) -> Result<(SignatureCheck, TrustLevel), EngineError> {
        if manifest.signature.is_none() && !trust.requires_signature() {
            return Ok((SignatureCheck::unsigned(), trust));
        }

        let check = self.signers.verify(manifest);
        if check.verified || !trust.requires_signature() {
            if !check.verified {
                debug!(
                    plugin_id = %manifest.id,
                    failure = ?check.failure,
                    "Signature not verified, trust unchanged"
                );
            }
            return Ok((check, trust));
        }

        let failure = check
            .failure
            .map_or("unverified", |f| f.as_str())
            .to_string();

        if trust >= self.config.signature.mandatory_at {
            self.raise(
                &manifest.id,
                SecurityEventType::SignatureFailed,
                Severity::High,
                format!("install at {} refused: {}", trust, failure),
            )
            .await;
            return Err(EngineError::Signature(failure));
        }

        self.raise(
            &manifest.id,
            SecurityEventType::SignatureFailed,
            Severity::Medium,
            format!("{}; trust lowered from {} to basic", failure, trust),
        )
        .await;
        warn!(
            plugin_id = %manifest.id,
            requested = %trust,
            "Signature failed ({}), installing as basic",
            failure
        );
        Ok((check, TrustLevel::Basic))
    }

    /// Act on a review outcome: install on approval, announce otherwise
    async fn settle_review(
        &self,
        record: ReviewRecord,
        manifest: PluginManifest,
        code: &[u8],
        trust: TrustLevel,
        approved: Option<&BTreeSet<Permission>>,
    ) -> Result<InstallOutcome, EngineError> {
        let plugin_id = record.plugin_id.clone();

        match record.decision {
            ReviewDecision::Pending => {
                self.bus
                    .publish(Event::ReviewPending {
                        plugin_id,
                        risk_score: record.risk_score,
                    })
                    .await;
                Ok(InstallOutcome {
                    review: record,
                    instance: None,
                })
            }
            ReviewDecision::Rejected => {
                self.raise(
                    &plugin_id,
                    SecurityEventType::ReviewRejected,
                    Severity::Medium,
                    record.reason.clone().unwrap_or_default(),
                )
                .await;
                self.publish_decision(&record).await;
                Ok(InstallOutcome {
                    review: record,
                    instance: None,
                })
            }
            ReviewDecision::AutoApproved | ReviewDecision::ApprovedByAdmin => {
                let initial = match approved {
                    Some(approved) => {
                        InitialPermissions::administrative(&manifest.permissions, trust, approved)
                    }
                    None => InitialPermissions::automatic(&manifest.permissions, trust),
                };
                self.publish_decision(&record).await;
                let instance = self.start_instance(manifest, code, trust, initial).await?;
                Ok(InstallOutcome {
                    review: record,
                    instance: Some(instance),
                })
            }
        }
    }

    async fn start_instance(
        &self,
        manifest: PluginManifest,
        code: &[u8],
        trust: TrustLevel,
        initial: InitialPermissions,
    ) -> Result<PluginInstance, EngineError> {
        let plugin_id = manifest.id.clone();
        let version = manifest.version.clone();
        self.sandbox.create(manifest.clone(), trust, initial)?;

        if let Err(e) = self.runtime.load(&manifest, code).await {
            error!(plugin_id = %plugin_id, "Runtime failed to load plugin: {}", e);
            self.sandbox.destroy(&plugin_id)?;
            return Err(e);
        }

        let instance = self.sandbox.activate(&plugin_id)?;
        info!(
            plugin_id = %plugin_id,
            version = %version,
            trust = %trust,
            "Plugin installed"
        );
        self.bus
            .publish(Event::PluginInstalled { plugin_id, version })
            .await;
        Ok(instance)
    }

    /// Run one plugin call through every security check
    pub async fn secure_execute(
        &self,
        plugin_id: &str,
        method: PluginMethod,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, EngineError> {
        let is_trial = self.breaker.check(plugin_id)?;
        let mut trial = TrialGuard {
            breaker: &self.breaker,
            plugin_id,
            armed: is_trial,
        };

        let permission = method.required_permission();
        let decision = self.gateway.authorize(plugin_id, permission);
        if !decision.allowed {
            let reason = decision.reason.unwrap_or(DenialReason::NotGranted);
            self.raise(
                plugin_id,
                SecurityEventType::PermissionDenied,
                Severity::Low,
                format!("{} needs {} ({})", method, permission, reason),
            )
            .await;
            return Err(EngineError::PermissionDenied {
                plugin_id: plugin_id.to_string(),
                permission,
                reason,
            });
        }

        let instance = self
            .sandbox
            .get(plugin_id)
            .ok_or_else(|| EngineError::NotFound(format!("plugin {}", plugin_id)))?;
        if instance.status == PluginStatus::Installing {
            return Err(EngineError::InvalidState(format!(
                "plugin {} is still installing",
                plugin_id
            )));
        }

        if permission.is_network() {
            self.check_network(&instance, &args).await?;
        }

        let admission = self.monitor.admit(plugin_id);
        if !admission.admit {
            return Err(EngineError::ResourceLimitExceeded {
                plugin_id: plugin_id.to_string(),
                dimension: admission
                    .exceeded
                    .first()
                    .copied()
                    .unwrap_or(ResourceDimension::Memory),
            });
        }

        let permit = self.sandbox.acquire_call(plugin_id).await?;

        let default_timeout = Duration::from_millis(self.config.execution.default_timeout_ms);
        let ceiling = Duration::from_millis(instance.resource_limits.max_execution_ms);
        let deadline = timeout.unwrap_or(default_timeout).min(ceiling);

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            deadline,
            self.runtime.invoke(plugin_id, method, args),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;
        drop(permit);
        trial.disarm();

        match outcome {
            Ok(Ok(response)) => {
                if let Some(usage) = response.usage {
                    match self.monitor.record(plugin_id, usage) {
                        Ok(admission) => {
                            if let Some(event) = admission.raised {
                                self.announce(&event).await;
                            }
                        }
                        Err(e) => debug!(plugin_id, "Usage not recorded: {}", e),
                    }
                }
                self.record_outcome(plugin_id, true, is_trial).await;
                debug!(plugin_id, method = %method, duration_ms, "Call completed");
                Ok(ExecutionResult {
                    plugin_id: plugin_id.to_string(),
                    method,
                    output: response.output,
                    duration_ms,
                    usage: response.usage,
                })
            }
            Ok(Err(e)) => {
                warn!(plugin_id, method = %method, "Call failed: {}", e);
                self.record_outcome(plugin_id, false, is_trial).await;
                Err(e)
            }
            Err(_) => {
                let timeout_ms = deadline.as_millis() as u64;
                self.raise(
                    plugin_id,
                    SecurityEventType::ExecutionTimeout,
                    Severity::Medium,
                    format!("{} exceeded {} ms", method, timeout_ms),
                )
                .await;
                self.record_outcome(plugin_id, false, is_trial).await;
                Err(EngineError::Timeout {
                    plugin_id: plugin_id.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    async fn check_network(
        &self,
        instance: &PluginInstance,
        args: &Value,
    ) -> Result<(), EngineError> {
        let plugin_id = instance.plugin_id.as_str();
        let policy = instance.manifest.effective_network_policy();

        let verdict = match network_target(args) {
            Some((host, port)) => policy
                .check(&host, port)
                .map_err(|rule| (format!("{}:{}", host, port), rule)),
            None => Err((
                "(unknown)".to_string(),
                "call names no url or host".to_string(),
            )),
        };

        let Err((target, rule)) = verdict else {
            return Ok(());
        };

        self.raise(
            plugin_id,
            SecurityEventType::NetworkPolicyViolation,
            Severity::Medium,
            format!("{}: {}", target, rule),
        )
        .await;
        Err(EngineError::NetworkPolicyViolation {
            plugin_id: plugin_id.to_string(),
            target,
        })
    }

    async fn record_outcome(&self, plugin_id: &str, success: bool, is_trial: bool) {
        match self.breaker.record(plugin_id, success, is_trial) {
            Some(transition @ (BreakerTransition::Opened | BreakerTransition::Reopened)) => {
                if let Err(e) = self.sandbox.mark_error(plugin_id) {
                    debug!(plugin_id, "Could not mark plugin as failed: {}", e);
                }
                self.raise(
                    plugin_id,
                    SecurityEventType::CircuitOpen,
                    Severity::High,
                    "repeated failures opened the circuit breaker",
                )
                .await;
                self.bus
                    .publish(Event::CircuitOpened {
                        plugin_id: plugin_id.to_string(),
                        transition,
                    })
                    .await;
            }
            Some(BreakerTransition::Closed) => self.recovered(plugin_id).await,
            None => {}
        }
    }

    async fn recovered(&self, plugin_id: &str) {
        if let Err(e) = self.sandbox.mark_recovered(plugin_id) {
            debug!(plugin_id, "Could not restore plugin: {}", e);
        }
        self.bus
            .publish(Event::CircuitClosed {
                plugin_id: plugin_id.to_string(),
            })
            .await;
    }

    /// Stop a plugin and discard its sandbox, breaker and monitor
    pub async fn secure_uninstall(&self, plugin_id: &str) -> Result<PluginInstance, EngineError> {
        if let Err(e) = self.breaker.reset(plugin_id) {
            debug!(plugin_id, "No breaker to reset: {}", e);
        }
        let instance = self.sandbox.destroy(plugin_id)?;

        if let Err(e) = self.runtime.unload(plugin_id).await {
            warn!(plugin_id, "Runtime failed to unload plugin: {}", e);
        }

        info!(plugin_id, "Plugin uninstalled");
        self.bus
            .publish(Event::PluginUninstalled {
                plugin_id: plugin_id.to_string(),
            })
            .await;
        Ok(instance)
    }

    /// Approve a pending review and start the plugin
    ///
    /// `approved` narrows the grant to a subset of what was requested. If the
    /// plugin fails to start, the submission goes back to the pending queue.
    pub async fn approve_plugin(
        &self,
        plugin_id: &str,
        approved_by: &str,
        approved: Option<BTreeSet<Permission>>,
    ) -> Result<InstallOutcome, EngineError> {
        let (record, submission) = self
            .review
            .approve_plugin(plugin_id, approved_by, approved)?;
        let granted = record.granted_permissions.clone();
        self.settle_released(record, submission, Some(&granted)).await
    }

    /// Finish an install released from the review queue
    async fn settle_released(
        &self,
        record: ReviewRecord,
        submission: PendingSubmission,
        approved: Option<&BTreeSet<Permission>>,
    ) -> Result<InstallOutcome, EngineError> {
        let result = self
            .settle_review(
                record,
                submission.manifest.clone(),
                &submission.code,
                submission.trust_level,
                approved,
            )
            .await;

        if let Err(e) = &result {
            let plugin_id = submission.manifest.id.clone();
            match self
                .review
                .reopen(submission, &format!("install failed: {}", e))
            {
                Ok(record) => {
                    self.bus
                        .publish(Event::ReviewPending {
                            plugin_id,
                            risk_score: record.risk_score,
                        })
                        .await;
                }
                Err(reopen) => debug!(plugin_id = %plugin_id, "Review not reopened: {}", reopen),
            }
        }
        result
    }

    pub async fn reject_plugin(
        &self,
        plugin_id: &str,
        rejected_by: &str,
        reason: &str,
    ) -> Result<ReviewRecord, EngineError> {
        let record = self.review.reject_plugin(plugin_id, rejected_by, reason)?;
        self.publish_decision(&record).await;
        Ok(record)
    }

    /// Re-score a pending submission under the current policy
    pub async fn review_plugin(&self, plugin_id: &str) -> Result<InstallOutcome, EngineError> {
        let (record, released) = self.review.re_review(plugin_id)?;
        match released {
            Some(submission) => self.settle_released(record, submission, None).await,
            None => Ok(InstallOutcome {
                review: record,
                instance: None,
            }),
        }
    }

    pub async fn grant_permission(
        &self,
        plugin_id: &str,
        permission: Permission,
        actor: &str,
    ) -> Result<BTreeSet<Permission>, EngineError> {
        let effective = self.gateway.grant_permission(plugin_id, permission, actor)?;
        self.permission_changed(plugin_id, permission, PermissionChange::Granted, actor)
            .await?;
        Ok(effective)
    }

    pub async fn revoke_permission(
        &self,
        plugin_id: &str,
        permission: Permission,
        actor: &str,
    ) -> Result<BTreeSet<Permission>, EngineError> {
        let effective = self.gateway.revoke_permission(plugin_id, permission, actor)?;
        self.permission_changed(plugin_id, permission, PermissionChange::Revoked, actor)
            .await?;
        Ok(effective)
    }

    /// Administrative path that adds a permission the manifest never declared
    ///
    /// The instance's manifest is superseded by one that declares it.
    pub async fn escalate_permission(
        &self,
        plugin_id: &str,
        permission: Permission,
        actor: &str,
        justification: &str,
    ) -> Result<BTreeSet<Permission>, EngineError> {
        let instance = self
            .sandbox
            .get(plugin_id)
            .ok_or_else(|| EngineError::NotFound(format!("plugin {}", plugin_id)))?;

        let effective =
            self.gateway
                .escalate_permission(plugin_id, permission, actor, justification)?;
        self.sandbox
            .supersede_manifest(plugin_id, instance.manifest.with_permission(permission))?;

        self.raise(
            plugin_id,
            SecurityEventType::PermissionEscalated,
            Severity::Medium,
            format!("{} escalated by {}: {}", permission, actor, justification),
        )
        .await;
        self.permission_changed(plugin_id, permission, PermissionChange::Escalated, actor)
            .await?;
        Ok(effective)
    }

    async fn permission_changed(
        &self,
        plugin_id: &str,
        permission: Permission,
        change: PermissionChange,
        actor: &str,
    ) -> Result<(), EngineError> {
        self.sandbox.sync_permissions(plugin_id)?;
        self.bus
            .publish(Event::PermissionChanged {
                plugin_id: plugin_id.to_string(),
                permission,
                change,
                actor: actor.to_string(),
            })
            .await;
        Ok(())
    }

    pub fn pause_plugin(&self, plugin_id: &str) -> Result<PluginInstance, EngineError> {
        let instance = self.sandbox.pause(plugin_id)?;
        info!(plugin_id, "Plugin paused");
        Ok(instance)
    }

    pub fn resume_plugin(&self, plugin_id: &str) -> Result<PluginInstance, EngineError> {
        let instance = self.sandbox.resume(plugin_id)?;
        info!(plugin_id, "Plugin resumed");
        Ok(instance)
    }

    pub fn resolve_security_event(
        &self,
        event_id: &str,
        resolved_by: &str,
    ) -> Result<SecurityEvent, EngineError> {
        self.events.resolve(event_id, resolved_by)
    }

    /// Force a plugin's breaker closed and restore the instance
    pub async fn reset_circuit_breaker(&self, plugin_id: &str) -> Result<(), EngineError> {
        if self.breaker.reset(plugin_id)?.is_some() {
            self.recovered(plugin_id).await;
        }
        Ok(())
    }

    pub fn add_trusted_signer(
        &self,
        name: &str,
        public_key_pem: &str,
        added_by: &str,
    ) -> Result<TrustedSigner, EngineError> {
        self.signers.add(name, public_key_pem, added_by)
    }

    pub fn remove_trusted_signer(&self, signer_id: &str) -> Result<TrustedSigner, EngineError> {
        self.signers.remove(signer_id)
    }

    async fn raise(
        &self,
        plugin_id: &str,
        event_type: SecurityEventType,
        severity: Severity,
        detail: impl Into<String>,
    ) -> SecurityEvent {
        let event = self.events.raise(plugin_id, event_type, severity, detail);
        self.announce(&event).await;
        event
    }

    /// Publish an event that is already in the store
    async fn announce(&self, event: &SecurityEvent) {
        self.bus
            .publish(Event::SecurityEventRaised {
                event_id: event.id.clone(),
                plugin_id: event.plugin_id.clone(),
                event_type: event.event_type,
                severity: event.severity,
            })
            .await;
    }

    async fn publish_decision(&self, record: &ReviewRecord) {
        self.bus
            .publish(Event::ReviewDecided {
                plugin_id: record.plugin_id.clone(),
                decision: record.decision,
                reviewer: record.reviewer.clone(),
            })
            .await;
    }
}

/// Outbound target named by a network call's arguments
///
/// Accepts `{"url": "scheme://host[:port]/..."}` or `{"host": ..., "port": ...}`.
fn network_target(args: &Value) -> Option<(String, u16)> {
    if let Some(url) = args.get("url").and_then(Value::as_str) {
        return parse_url_target(url);
    }
    let host = args.get("host").and_then(Value::as_str)?;
    let port = match args.get("port") {
        Some(port) => u16::try_from(port.as_u64()?).ok()?,
        None => 443,
    };
    Some((host.to_string(), port))
}

fn parse_url_target(url: &str) -> Option<(String, u16)> {
    let (scheme, rest) = url.trim().split_once("://")?;
    let default_port = match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => 80,
        "https" | "wss" => 443,
        _ => return None,
    };

    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host);

    let (host, port) = if authority.starts_with('[') {
        let end = authority.find(']')?;
        let port = match authority[end + 1..].strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None => default_port,
        };
        (&authority[..=end], port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (authority, default_port),
        }
    };

    (!host.is_empty()).then(|| (host.to_string(), port))
}
