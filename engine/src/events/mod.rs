//! Security event store
//!
//! Append-only log of security incidents raised by the other components:
//! denied calls, resource breaches, open circuits, failed signatures. Events are
//! never deleted by callers; the only mutation is a one-way transition to
//! `resolved`. Retention is bounded, oldest events are dropped first.

use crate::sync::lock;
use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    PermissionDenied,
    ResourceLimitExceeded,
    CircuitOpen,
    SignatureFailed,
    ExecutionTimeout,
    NetworkPolicyViolation,
    ReviewRejected,
    PermissionEscalated,
}

impl SecurityEventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission_denied",
            Self::ResourceLimitExceeded => "resource_limit_exceeded",
            Self::CircuitOpen => "circuit_open",
            Self::SignatureFailed => "signature_failed",
            Self::ExecutionTimeout => "execution_timeout",
            Self::NetworkPolicyViolation => "network_policy_violation",
            Self::ReviewRejected => "review_rejected",
            Self::PermissionEscalated => "permission_escalated",
        }
    }
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub id: String,
    pub plugin_id: String,
    #[serde(rename = "type")]
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// Query over the event log. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventFilter {
    pub plugin_id: Option<String>,
    pub event_type: Option<SecurityEventType>,
    pub min_severity: Option<Severity>,
    pub unresolved_only: bool,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn for_plugin(plugin_id: &str) -> Self {
        Self {
            plugin_id: Some(plugin_id.to_string()),
            ..Self::default()
        }
    }

    fn matches(&self, event: &SecurityEvent) -> bool {
        if let Some(plugin_id) = &self.plugin_id {
            if &event.plugin_id != plugin_id {
                return false;
            }
        }
        if let Some(event_type) = self.event_type {
            if event.event_type != event_type {
                return false;
            }
        }
        if let Some(min) = self.min_severity {
            if event.severity < min {
                return false;
            }
        }
        !(self.unresolved_only && event.resolved)
    }
}

/// Unresolved event counts by severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeverityCounts {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub critical: usize,
}

impl SeverityCounts {
    fn add(&mut self, severity: Severity) {
        match severity {
            Severity::Low => self.low += 1,
            Severity::Medium => self.medium += 1,
            Severity::High => self.high += 1,
            Severity::Critical => self.critical += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.low + self.medium + self.high + self.critical
    }
}

pub struct SecurityEventStore {
    events: Mutex<VecDeque<SecurityEvent>>,
    max_events: usize,
}

impl SecurityEventStore {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_events: max_events.max(1),
        }
    }

    /// Append a new unresolved event and return it
    pub fn raise(
        &self,
        plugin_id: &str,
        event_type: SecurityEventType,
        severity: Severity,
        detail: impl Into<String>,
    ) -> SecurityEvent {
        let event = SecurityEvent {
            id: Uuid::new_v4().to_string(),
            plugin_id: plugin_id.to_string(),
            event_type,
            severity,
            resolved: false,
            resolved_by: None,
            resolved_at: None,
            detail: detail.into(),
            timestamp: Utc::now(),
        };

        match severity {
            Severity::Low => info!(
                plugin_id,
                event_id = %event.id,
                "Security event {}: {}",
                event_type,
                event.detail
            ),
            Severity::Medium => warn!(
                plugin_id,
                event_id = %event.id,
                "Security event {}: {}",
                event_type,
                event.detail
            ),
            Severity::High | Severity::Critical => error!(
                plugin_id,
                event_id = %event.id,
                severity = %severity,
                "Security event {}: {}",
                event_type,
                event.detail
            ),
        }

        let mut events = lock(&self.events);
        events.push_back(event.clone());
        while events.len() > self.max_events {
            events.pop_front();
        }

        event
    }

    /// Mark an event resolved
    ///
    /// Resolving is one-way. Resolving an already resolved event returns it
    /// unchanged, keeping the original resolver and time.
    pub fn resolve(&self, event_id: &str, resolved_by: &str) -> Result<SecurityEvent, EngineError> {
        let mut events = lock(&self.events);
        let event = events
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| EngineError::NotFound(format!("security event {}", event_id)))?;

        if !event.resolved {
            event.resolved = true;
            event.resolved_by = Some(resolved_by.to_string());
            event.resolved_at = Some(Utc::now());
            info!(
                event_id,
                plugin_id = %event.plugin_id,
                "Security event resolved by {}",
                resolved_by
            );
        }

        Ok(event.clone())
    }

    pub fn get(&self, event_id: &str) -> Option<SecurityEvent> {
        lock(&self.events).iter().find(|e| e.id == event_id).cloned()
    }

    /// Matching events, newest first
    pub fn list(&self, filter: &EventFilter) -> Vec<SecurityEvent> {
        let events = lock(&self.events);
        let limit = filter.limit.unwrap_or(usize::MAX);
        events
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn unresolved_counts(&self, plugin_id: Option<&str>) -> SeverityCounts {
        let events = lock(&self.events);
        let mut counts = SeverityCounts::default();
        for event in events.iter().filter(|e| !e.resolved) {
            if plugin_id.map_or(true, |id| id == event.plugin_id) {
                counts.add(event.severity);
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_and_list_newest_first() {
        let store = SecurityEventStore::new(100);
        store.raise("p1", SecurityEventType::PermissionDenied, Severity::Low, "a");
        store.raise("p2", SecurityEventType::CircuitOpen, Severity::High, "b");
        store.raise("p1", SecurityEventType::ExecutionTimeout, Severity::Medium, "c");

        let all = store.list(&EventFilter::default());
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].detail, "c");

        let p1 = store.list(&EventFilter::for_plugin("p1"));
        assert_eq!(p1.len(), 2);

        let severe = store.list(&EventFilter {
            min_severity: Some(Severity::Medium),
            ..EventFilter::default()
        });
        assert_eq!(severe.len(), 2);
    }

    #[test]
    fn test_resolve_is_one_way() {
        let store = SecurityEventStore::new(100);
        let event = store.raise("p1", SecurityEventType::CircuitOpen, Severity::High, "open");

        let first = store.resolve(&event.id, "alice").unwrap();
        assert!(first.resolved);
        assert_eq!(first.resolved_by.as_deref(), Some("alice"));

        let second = store.resolve(&event.id, "bob").unwrap();
        assert_eq!(second.resolved_by.as_deref(), Some("alice"));
        assert_eq!(second.resolved_at, first.resolved_at);

        assert!(matches!(
            store.resolve("missing", "alice"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_retention_drops_oldest() {
        let store = SecurityEventStore::new(2);
        let oldest = store.raise("p1", SecurityEventType::PermissionDenied, Severity::Low, "1");
        store.raise("p1", SecurityEventType::PermissionDenied, Severity::Low, "2");
        store.raise("p1", SecurityEventType::PermissionDenied, Severity::Low, "3");

        assert_eq!(store.len(), 2);
        assert!(store.get(&oldest.id).is_none());
    }

    #[test]
    fn test_unresolved_counts() {
        let store = SecurityEventStore::new(10);
        let e = store.raise("p1", SecurityEventType::CircuitOpen, Severity::High, "x");
        store.raise("p1", SecurityEventType::PermissionDenied, Severity::Low, "y");
        store.raise("p2", SecurityEventType::PermissionDenied, Severity::Low, "z");

        assert_eq!(store.unresolved_counts(None).total(), 3);
        assert_eq!(store.unresolved_counts(Some("p1")).high, 1);

        store.resolve(&e.id, "ops").unwrap();
        assert_eq!(store.unresolved_counts(Some("p1")).high, 0);
    }
}
