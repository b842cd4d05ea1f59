//! Append-only permission audit log
//!
//! Every authorization decision and every grant, revoke or escalation attempt
//! lands here, including no-ops and refusals. Entries carry a monotonically
//! increasing sequence number so that order survives retention trimming.

use crate::sync::lock;
use chrono::{DateTime, Utc};
use sdk::permissions::Permission;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Authorize,
    Grant,
    Revoke,
    Escalate,
}

impl AuditAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authorize => "authorize",
            Self::Grant => "grant",
            Self::Revoke => "revoke",
            Self::Escalate => "escalate",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub sequence: u64,
    pub plugin_id: String,
    pub permission: Permission,
    pub action: AuditAction,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuditFilter {
    pub plugin_id: Option<String>,
    pub permission: Option<Permission>,
    pub action: Option<AuditAction>,
    pub allowed: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn for_plugin(plugin_id: &str) -> Self {
        Self {
            plugin_id: Some(plugin_id.to_string()),
            ..Self::default()
        }
    }

    fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.plugin_id
            .as_deref()
            .map_or(true, |id| id == entry.plugin_id)
            && self.permission.map_or(true, |p| p == entry.permission)
            && self.action.map_or(true, |a| a == entry.action)
            && self.allowed.map_or(true, |a| a == entry.allowed)
            && self.since.map_or(true, |t| entry.timestamp >= t)
    }
}

/// One record about to be appended
pub(crate) struct AuditRecord<'a> {
    pub plugin_id: &'a str,
    pub permission: Permission,
    pub action: AuditAction,
    pub allowed: bool,
    pub reason: Option<String>,
    pub actor: Option<&'a str>,
}

struct Entries {
    next_sequence: u64,
    entries: VecDeque<AuditLogEntry>,
}

pub struct AuditLog {
    inner: Mutex<Entries>,
    max_entries: usize,
}

impl AuditLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Entries {
                next_sequence: 1,
                entries: VecDeque::new(),
            }),
            max_entries: max_entries.max(1),
        }
    }

    pub(crate) fn append(&self, record: AuditRecord<'_>) -> AuditLogEntry {
        let mut inner = lock(&self.inner);
        let entry = AuditLogEntry {
            sequence: inner.next_sequence,
            plugin_id: record.plugin_id.to_string(),
            permission: record.permission,
            action: record.action,
            allowed: record.allowed,
            reason: record.reason,
            actor: record.actor.map(str::to_string),
            timestamp: Utc::now(),
        };
        inner.next_sequence += 1;
        inner.entries.push_back(entry.clone());
        while inner.entries.len() > self.max_entries {
            inner.entries.pop_front();
        }
        entry
    }

    /// Matching entries, newest first
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        let inner = lock(&self.inner);
        inner
            .entries
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(plugin_id: &str, allowed: bool) -> AuditRecord<'_> {
        AuditRecord {
            plugin_id,
            permission: Permission::SystemLog,
            action: AuditAction::Authorize,
            allowed,
            reason: None,
            actor: None,
        }
    }

    #[test]
    fn test_sequence_is_monotonic_across_trimming() {
        let log = AuditLog::new(2);
        log.append(record("p1", true));
        log.append(record("p1", true));
        let last = log.append(record("p1", false));

        assert_eq!(last.sequence, 3);
        let entries = log.query(&AuditFilter::default());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 3);
        assert_eq!(entries[1].sequence, 2);
    }

    #[test]
    fn test_filter_by_plugin_and_outcome() {
        let log = AuditLog::new(100);
        log.append(record("p1", true));
        log.append(record("p1", false));
        log.append(record("p2", false));

        let denied_p1 = log.query(&AuditFilter {
            plugin_id: Some("p1".into()),
            allowed: Some(false),
            ..AuditFilter::default()
        });
        assert_eq!(denied_p1.len(), 1);

        let limited = log.query(&AuditFilter {
            limit: Some(1),
            ..AuditFilter::default()
        });
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].plugin_id, "p2");
    }
}
