//! Bounded append-only audit trail of security events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Registration,
    Sign,
    Verify,
    Encrypt,
    Decrypt,
    Revoke,
    Rotate,
    Challenge,
    Authentication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub severity: Severity,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    pub detail: String,
}

impl AuditEntry {
    pub fn new(action: AuditAction, severity: Severity, success: bool, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            severity,
            success,
            agent_id: None,
            key_id: None,
            detail: detail.into(),
        }
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn key(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }
}

/// Oldest entries are dropped once `capacity` is reached.
#[derive(Debug)]
pub struct AuditLog {
    entries: VecDeque<AuditEntry>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, entry: AuditEntry) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Up to `limit` most recent entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn filter(&self, action: AuditAction) -> Vec<AuditEntry> {
        self.entries.iter().filter(|e| e.action == action).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_entries_are_dropped() {
        let mut log = AuditLog::new(2);
        log.record(AuditEntry::new(AuditAction::Sign, Severity::Info, true, "one"));
        log.record(AuditEntry::new(AuditAction::Verify, Severity::Info, true, "two"));
        log.record(AuditEntry::new(AuditAction::Revoke, Severity::Warning, true, "three"));

        assert_eq!(log.len(), 2);
        let details: Vec<_> = log.recent(10).into_iter().map(|e| e.detail).collect();
        assert_eq!(details, vec!["two", "three"]);
    }

    #[test]
    fn test_filter_by_action() {
        let mut log = AuditLog::new(10);
        log.record(AuditEntry::new(AuditAction::Sign, Severity::Info, true, "a").agent("queen"));
        log.record(AuditEntry::new(AuditAction::Verify, Severity::Warning, false, "b"));

        let signs = log.filter(AuditAction::Sign);
        assert_eq!(signs.len(), 1);
        assert_eq!(signs[0].agent_id.as_deref(), Some("queen"));
    }
}
