//! Security review engine
//!
//! Scores the permissions a plugin requests and decides whether it can be
//! installed automatically, needs a human decision, or is refused.
//!
//! # Scoring
//!
//! `score = Σ weight(p) × (1 − discount(trust))` over requested permissions,
//! where high-risk permissions weigh more. Weights and thresholds come from
//! [`ReviewConfig`].
//!
//! # Decisions
//!
//! | Condition                                                     | Decision        |
//! |---------------------------------------------------------------|-----------------|
//! | trust is `trusted`/`system`, or score is 0                    | `auto_approved` |
//! | `untrusted` asks for an escalation-only permission            | `rejected`      |
//! | score above the reject threshold                              | `rejected`      |
//! | score above the pending threshold, or escalation-only request | `pending`       |
//! | every permission is low-risk                                  | `auto_approved` |
//! | otherwise                                                     | `pending`       |
//!
//! Pending submissions are held here with their code until an administrator
//! approves or rejects them. Rejected and approved records are terminal.

use crate::config::ReviewConfig;
use crate::gateway::join_permissions;
use crate::signer::SignatureCheck;
use crate::sync::lock;
use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use sdk::manifest::PluginManifest;
use sdk::permissions::{Permission, TrustLevel};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    AutoApproved,
    Pending,
    Rejected,
    ApprovedByAdmin,
}

impl ReviewDecision {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AutoApproved => "auto_approved",
            Self::Pending => "pending",
            Self::Rejected => "rejected",
            Self::ApprovedByAdmin => "approved_by_admin",
        }
    }

    pub const fn is_approved(self) -> bool {
        matches!(self, Self::AutoApproved | Self::ApprovedByAdmin)
    }
}

impl fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRecord {
    pub plugin_id: String,
    pub plugin_version: String,
    pub requested_permissions: BTreeSet<Permission>,
    pub granted_permissions: BTreeSet<Permission>,
    pub risk_score: f64,
    pub trust_level: TrustLevel,
    pub signature_verified: bool,
    pub decision: ReviewDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Everything needed to finish an install once a pending review is decided
#[derive(Debug, Clone)]
pub struct PendingSubmission {
    pub manifest: PluginManifest,
    pub code: Vec<u8>,
    pub trust_level: TrustLevel,
    pub signature: SignatureCheck,
}

#[derive(Default)]
struct ReviewState {
    latest: HashMap<String, ReviewRecord>,
    pending: HashMap<String, PendingSubmission>,
    history: Vec<ReviewRecord>,
}

pub struct SecurityReviewEngine {
    config: ReviewConfig,
    state: Mutex<ReviewState>,
}

impl SecurityReviewEngine {
    pub fn new(config: ReviewConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ReviewState::default()),
        }
    }

    pub fn score(&self, permissions: &BTreeSet<Permission>, trust: TrustLevel) -> f64 {
        let discount = 1.0 - trust.risk_discount();
        permissions
            .iter()
            .map(|p| {
                if p.is_high_risk() {
                    self.config.high_risk_weight
                } else {
                    self.config.low_risk_weight
                }
            })
            .sum::<f64>()
            * discount
    }

    /// Score and decide without recording anything
    pub fn assess(
        &self,
        manifest: &PluginManifest,
        signature: &SignatureCheck,
        trust: TrustLevel,
    ) -> ReviewRecord {
        let requested = manifest.permissions.clone();
        let score = self.score(&requested, trust);
        let escalations: BTreeSet<Permission> = requested
            .iter()
            .copied()
            .filter(|p| p.requires_escalation())
            .collect();
        let high_risk: BTreeSet<Permission> = requested
            .iter()
            .copied()
            .filter(|p| p.is_high_risk())
            .collect();

        let (decision, reason) = if trust >= TrustLevel::Trusted {
            (ReviewDecision::AutoApproved, format!("{} origin", trust))
        } else if score == 0.0 {
            (ReviewDecision::AutoApproved, "no risk".to_string())
        } else if trust == TrustLevel::Untrusted && !escalations.is_empty() {
            (
                ReviewDecision::Rejected,
                format!(
                    "untrusted plugin requests {}",
                    join_permissions(&escalations)
                ),
            )
        } else if score > self.config.reject_threshold {
            (
                ReviewDecision::Rejected,
                format!(
                    "risk score {:.2} exceeds reject threshold {:.2}",
                    score, self.config.reject_threshold
                ),
            )
        } else if !escalations.is_empty() {
            (
                ReviewDecision::Pending,
                format!("requires escalation: {}", join_permissions(&escalations)),
            )
        } else if score > self.config.pending_threshold {
            (
                ReviewDecision::Pending,
                format!(
                    "risk score {:.2} exceeds pending threshold {:.2}",
                    score, self.config.pending_threshold
                ),
            )
        } else if high_risk.is_empty() {
            (
                ReviewDecision::AutoApproved,
                "all permissions are low-risk".to_string(),
            )
        } else {
            (
                ReviewDecision::Pending,
                format!(
                    "high-risk permissions need review: {}",
                    join_permissions(&high_risk)
                ),
            )
        };

        let granted = if decision == ReviewDecision::AutoApproved {
            requested
                .iter()
                .copied()
                .filter(|p| trust.ceiling_allows(*p))
                .collect()
        } else {
            BTreeSet::new()
        };

        ReviewRecord {
            plugin_id: manifest.id.clone(),
            plugin_version: manifest.version.clone(),
            requested_permissions: requested,
            granted_permissions: granted,
            risk_score: score,
            trust_level: trust,
            signature_verified: signature.verified,
            decision,
            reviewer: None,
            reason: Some(reason),
            timestamp: Utc::now(),
        }
    }

    /// Assess a manifest and append the outcome to the review history
    ///
    /// Nothing is held for a later decision; use [`submit`](Self::submit) for
    /// installs.
    pub fn review_plugin(
        &self,
        manifest: &PluginManifest,
        signature: &SignatureCheck,
        trust: TrustLevel,
    ) -> ReviewRecord {
        let record = self.assess(manifest, signature, trust);
        self.log_decision(&record);
        lock(&self.state).history.push(record.clone());
        record
    }

    /// Review a full submission, holding it if a human decision is needed
    ///
    /// A new submission for the same plugin supersedes any older pending one.
    pub fn submit(&self, submission: PendingSubmission) -> ReviewRecord {
        let record = self.assess(
            &submission.manifest,
            &submission.signature,
            submission.trust_level,
        );
        self.log_decision(&record);

        let mut state = lock(&self.state);
        if record.decision == ReviewDecision::Pending {
            state
                .pending
                .insert(record.plugin_id.clone(), submission);
        } else {
            state.pending.remove(&record.plugin_id);
        }
        Self::store(&mut state, record.clone());
        record
    }

    /// Re-score a pending submission under the current policy
    ///
    /// If the decision is no longer `pending` the submission is released to the
    /// caller, who completes the install for an approval.
    pub fn re_review(
        &self,
        plugin_id: &str,
    ) -> Result<(ReviewRecord, Option<PendingSubmission>), EngineError> {
        let mut state = lock(&self.state);
        Self::ensure_pending(&state, plugin_id)?;
        let submission = state
            .pending
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("pending review for {}", plugin_id)))?;

        let record = self.assess(
            &submission.manifest,
            &submission.signature,
            submission.trust_level,
        );
        self.log_decision(&record);

        let released = if record.decision == ReviewDecision::Pending {
            None
        } else {
            state.pending.remove(plugin_id)
        };
        Self::store(&mut state, record.clone());
        Ok((record, released))
    }

    /// Approve a pending submission, optionally narrowing what is granted
    pub fn approve_plugin(
        &self,
        plugin_id: &str,
        approved_by: &str,
        approved_permissions: Option<BTreeSet<Permission>>,
    ) -> Result<(ReviewRecord, PendingSubmission), EngineError> {
        let mut state = lock(&self.state);
        let current = Self::ensure_pending(&state, plugin_id)?.clone();

        let granted = match approved_permissions {
            Some(approved) => {
                let extra: BTreeSet<Permission> = approved
                    .difference(&current.requested_permissions)
                    .copied()
                    .collect();
                if !extra.is_empty() {
                    return Err(EngineError::Validation(
                        extra
                            .iter()
                            .map(|p| format!("cannot approve '{}': it was not requested", p))
                            .collect(),
                    ));
                }
                approved
            }
            None => current.requested_permissions.clone(),
        };

        let submission = state
            .pending
            .remove(plugin_id)
            .ok_or_else(|| EngineError::NotFound(format!("pending review for {}", plugin_id)))?;

        let record = ReviewRecord {
            granted_permissions: granted,
            decision: ReviewDecision::ApprovedByAdmin,
            reviewer: Some(approved_by.to_string()),
            reason: Some("approved by administrator".to_string()),
            timestamp: Utc::now(),
            ..current
        };
        info!(
            plugin_id,
            reviewer = approved_by,
            "Review approved, granted: {}",
            join_permissions(&record.granted_permissions)
        );
        Self::store(&mut state, record.clone());
        Ok((record, submission))
    }

    /// Refuse a pending submission. Terminal.
    pub fn reject_plugin(
        &self,
        plugin_id: &str,
        rejected_by: &str,
        reason: &str,
    ) -> Result<ReviewRecord, EngineError> {
        let mut state = lock(&self.state);
        let current = Self::ensure_pending(&state, plugin_id)?.clone();
        state.pending.remove(plugin_id);

        let record = ReviewRecord {
            granted_permissions: BTreeSet::new(),
            decision: ReviewDecision::Rejected,
            reviewer: Some(rejected_by.to_string()),
            reason: Some(reason.to_string()),
            timestamp: Utc::now(),
            ..current
        };
        warn!(plugin_id, reviewer = rejected_by, "Review rejected: {}", reason);
        Self::store(&mut state, record.clone());
        Ok(record)
    }

    /// Put an approved submission back in the queue after its install failed
    ///
    /// The pending record it was approved from is restored with `reason`
    /// noting the failure, so the administrator can approve it again.
    pub fn reopen(
        &self,
        submission: PendingSubmission,
        reason: &str,
    ) -> Result<ReviewRecord, EngineError> {
        let plugin_id = submission.manifest.id.clone();
        let mut state = lock(&self.state);

        let approved = state
            .latest
            .get(&plugin_id)
            .is_some_and(|r| r.decision.is_approved());
        if !approved {
            return Err(EngineError::InvalidState(format!(
                "review for {} is not an approval",
                plugin_id
            )));
        }

        let previous = state
            .history
            .iter()
            .rev()
            .find(|r| r.plugin_id == plugin_id && r.decision == ReviewDecision::Pending)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("pending review for {}", plugin_id)))?;

        let record = ReviewRecord {
            reason: Some(reason.to_string()),
            timestamp: Utc::now(),
            ..previous
        };
        warn!(plugin_id = %plugin_id, "Review reopened: {}", reason);
        state.pending.insert(plugin_id, submission);
        Self::store(&mut state, record.clone());
        Ok(record)
    }

    pub fn latest(&self, plugin_id: &str) -> Option<ReviewRecord> {
        lock(&self.state).latest.get(plugin_id).cloned()
    }

    /// Records currently awaiting a decision, oldest first
    pub fn pending(&self) -> Vec<ReviewRecord> {
        let state = lock(&self.state);
        let mut records: Vec<ReviewRecord> = state
            .pending
            .keys()
            .filter_map(|id| state.latest.get(id).cloned())
            .collect();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        records
    }

    pub fn is_pending(&self, plugin_id: &str) -> bool {
        lock(&self.state).pending.contains_key(plugin_id)
    }

    /// Review history, newest first
    pub fn history(&self, plugin_id: Option<&str>) -> Vec<ReviewRecord> {
        lock(&self.state)
            .history
            .iter()
            .rev()
            .filter(|r| plugin_id.map_or(true, |id| id == r.plugin_id))
            .cloned()
            .collect()
    }

    fn ensure_pending<'a>(
        state: &'a ReviewState,
        plugin_id: &str,
    ) -> Result<&'a ReviewRecord, EngineError> {
        let record = state
            .latest
            .get(plugin_id)
            .ok_or_else(|| EngineError::NotFound(format!("review for {}", plugin_id)))?;

        match record.decision {
            ReviewDecision::Pending => Ok(record),
            ReviewDecision::Rejected => Err(EngineError::ReviewRejected {
                plugin_id: plugin_id.to_string(),
                reason: record
                    .reason
                    .clone()
                    .unwrap_or_else(|| "rejected".to_string()),
            }),
            decision => Err(EngineError::InvalidState(format!(
                "review for {} is already {}",
                plugin_id, decision
            ))),
        }
    }

    fn store(state: &mut ReviewState, record: ReviewRecord) {
        state.history.push(record.clone());
        state.latest.insert(record.plugin_id.clone(), record);
    }

    fn log_decision(&self, record: &ReviewRecord) {
        let plugin_id = record.plugin_id.as_str();
        let reason = record.reason.as_deref().unwrap_or_default();
        match record.decision {
            ReviewDecision::Rejected => warn!(
                plugin_id,
                score = record.risk_score,
                trust = %record.trust_level,
                "Review rejected: {}",
                reason
            ),
            decision => info!(
                plugin_id,
                score = record.risk_score,
                trust = %record.trust_level,
                "Review {}: {}",
                decision,
                reason
            ),
        }
    }
}
