//! AuditLog - Append-only log of security-relevant decisions

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared::{duration_days, saturating_sub, AuditConfig, Clock, GatewayError};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::info;

/// What kind of operation an entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Register,
    Unregister,
    Execute,
    PermissionChange,
    QuotaChange,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Register => "register",
            AuditAction::Unregister => "unregister",
            AuditAction::Execute => "execute",
            AuditAction::PermissionChange => "permission_change",
            AuditAction::QuotaChange => "quota_change",
        }
    }
}

/// Stored audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub action: AuditAction,
    pub resource: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// An event to be appended; id and timestamp are assigned by the log
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub user_id: String,
    pub action: AuditAction,
    pub resource: String,
    pub success: bool,
    pub error: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl AuditEvent {
    /// A successful event
    pub fn success(user_id: impl Into<String>, action: AuditAction, resource: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            action,
            resource: resource.into(),
            success: true,
            error: None,
            details: None,
        }
    }

    /// A failed event with its error message
    pub fn failure(
        user_id: impl Into<String>,
        action: AuditAction,
        resource: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::success(user_id, action, resource)
        }
    }

    /// Builder: attach details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Query filter; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditFilter {
    pub user_id: Option<String>,
    pub action: Option<AuditAction>,
    /// Matches the entry's `resource`
    pub tool_name: Option<String>,
    pub success: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.user_id.as_ref().map_or(true, |u| &entry.user_id == u)
            && self.action.map_or(true, |a| entry.action == a)
            && self.tool_name.as_ref().map_or(true, |t| &entry.resource == t)
            && self.success.map_or(true, |s| entry.success == s)
            && self.since.map_or(true, |since| entry.timestamp >= since)
    }
}

/// Audit statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStats {
    pub total_entries: usize,
    pub failure_count: usize,
    pub by_action: BTreeMap<AuditAction, usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Append-only audit log, bounded in size and age
#[derive(Debug)]
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditLogEntry>>,
    max_entries: usize,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    /// Create a new AuditLog
    pub fn new(config: &AuditConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(config.max_entries.min(1024))),
            max_entries: config.max_entries.max(1),
            retention: duration_days(u64::from(config.retention_days)),
            clock,
        }
    }

    /// Append an event and return the new entry's id.
    ///
    /// Never fails; when full, the oldest entry is dropped.
    pub fn record(&self, event: AuditEvent) -> String {
        let entry = AuditLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: self.clock.now(),
            user_id: event.user_id,
            action: event.action,
            resource: event.resource,
            success: event.success,
            error: event.error,
            details: event.details,
        };

        info!(
            target: "audit",
            id = %entry.id,
            user = %entry.user_id,
            action = entry.action.as_str(),
            resource = %entry.resource,
            success = entry.success,
            error = entry.error.as_deref().unwrap_or(""),
            "audit"
        );

        let id = entry.id.clone();
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
        id
    }

    /// Record the outcome of a tool execution; failures keep their error kind
    pub fn log_execution(&self, user_id: &str, tool_name: &str, error: Option<&GatewayError>) -> String {
        let event = match error {
            None => AuditEvent::success(user_id, AuditAction::Execute, tool_name),
            Some(err) => AuditEvent::failure(user_id, AuditAction::Execute, tool_name, err.to_string())
                .with_details(serde_json::json!({ "kind": err.kind() })),
        };
        self.record(event)
    }

    /// Entries matching `filter`, newest first
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        let entries = self.entries.lock();
        entries
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Most recent entries, newest first
    pub fn get_recent(&self, limit: usize) -> Vec<AuditLogEntry> {
        self.query(&AuditFilter::new().limit(limit))
    }

    /// Most recent failures, newest first
    pub fn get_recent_failures(&self, limit: usize) -> Vec<AuditLogEntry> {
        self.query(&AuditFilter::new().success(false).limit(limit))
    }

    /// Drop entries older than the retention cutoff
    pub fn prune_expired(&self) -> usize {
        let cutoff = saturating_sub(self.clock.now(), self.retention);
        let mut entries = self.entries.lock();
        let before = entries.len();
        // Entries are appended in time order, so expired ones sit at the front.
        while entries.front().is_some_and(|e| e.timestamp < cutoff) {
            entries.pop_front();
        }
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Get statistics
    pub fn stats(&self) -> AuditStats {
        let entries = self.entries.lock();
        let mut by_action = BTreeMap::new();
        for entry in entries.iter() {
            *by_action.entry(entry.action).or_insert(0) += 1;
        }

        AuditStats {
            total_entries: entries.len(),
            failure_count: entries.iter().filter(|e| !e.success).count(),
            by_action,
            oldest: entries.front().map(|e| e.timestamp),
            newest: entries.back().map(|e| e.timestamp),
        }
    }

    /// Export every entry as a JSON array, oldest first
    pub fn export_json(&self) -> serde_json::Value {
        let entries = self.entries.lock();
        serde_json::to_value(entries.iter().collect::<Vec<_>>()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ManualClock;

    fn log_with(max_entries: usize, retention_days: u32) -> (AuditLog, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let config = AuditConfig {
            retention_days,
            max_entries,
            ..Default::default()
        };
        (AuditLog::new(&config, clock.clone()), clock)
    }

    fn failure(message: &str) -> GatewayError {
        GatewayError::Config(message.to_string())
    }

    fn log() -> AuditLog {
        log_with(100, 30).0
    }

    // ============== Record Tests ==============

    #[test]
    fn test_record_assigns_id_and_timestamp() {
        let (log, clock) = log_with(100, 30);

        let id = log.record(AuditEvent::success("alice", AuditAction::Register, "search"));

        let recent = log.get_recent(1);
        assert_eq!(recent[0].id, id);
        assert_eq!(recent[0].timestamp, clock.now());
        assert!(recent[0].success);
    }

    #[test]
    fn test_log_execution_failure() {
        let log = log();

        log.log_execution("bob", "delete_all", Some(&failure("Permission denied")));

        let failures = log.get_recent_failures(10);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].resource, "delete_all");
        assert_eq!(failures[0].error.as_deref(), Some("Configuration error: Permission denied"));
        assert_eq!(failures[0].action, AuditAction::Execute);
        assert_eq!(failures[0].details, Some(serde_json::json!({"kind": "configuration"})));
    }

    #[test]
    fn test_ids_are_unique() {
        let log = log();
        let a = log.log_execution("u", "t", None);
        let b = log.log_execution("u", "t", None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_max_entries_limit() {
        let (log, _) = log_with(3, 30);

        for tool in ["tool1", "tool2", "tool3", "tool4"] {
            log.log_execution("admin", tool, None);
        }

        assert_eq!(log.len(), 3);
        let resources: Vec<_> = log.get_recent(10).into_iter().map(|e| e.resource).collect();
        assert!(!resources.contains(&"tool1".to_string()));
    }

    #[test]
    fn test_details_are_kept() {
        let log = log();
        log.record(
            AuditEvent::success("admin", AuditAction::QuotaChange, "alice")
                .with_details(serde_json::json!({"limit": 10})),
        );

        assert_eq!(log.get_recent(1)[0].details, Some(serde_json::json!({"limit": 10})));
    }

    // ============== Query Tests ==============

    #[test]
    fn test_query_newest_first() {
        let log = log();
        log.log_execution("admin", "tool1", None);
        log.log_execution("admin", "tool2", None);
        log.log_execution("admin", "tool3", None);

        let recent = log.get_recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].resource, "tool3");
        assert_eq!(recent[1].resource, "tool2");
    }

    #[test]
    fn test_query_filters_combine() {
        let log = log();
        log.log_execution("alice", "search", None);
        log.log_execution("alice", "search", Some(&failure("Rate limit exceeded")));
        log.log_execution("bob", "search", None);
        log.record(AuditEvent::success("alice", AuditAction::Register, "search"));

        let alice_exec = log.query(&AuditFilter::new().user("alice").action(AuditAction::Execute));
        assert_eq!(alice_exec.len(), 2);

        let alice_ok = log.query(
            &AuditFilter::new()
                .user("alice")
                .tool("search")
                .action(AuditAction::Execute)
                .success(true),
        );
        assert_eq!(alice_ok.len(), 1);

        let failures = log.query(&AuditFilter::new().success(false));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].user_id, "alice");
    }

    #[test]
    fn test_query_since() {
        let (log, clock) = log_with(100, 30);
        log.log_execution("u", "old", None);
        clock.advance(Duration::minutes(5));
        let cutoff = clock.now();
        log.log_execution("u", "new", None);

        let recent = log.query(&AuditFilter::new().since(cutoff));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].resource, "new");
    }

    #[test]
    fn test_filter_deserializes_from_json() {
        let filter: AuditFilter =
            serde_json::from_str(r#"{"userId":"alice","action":"execute","success":false}"#).unwrap();
        assert_eq!(filter.user_id.as_deref(), Some("alice"));
        assert_eq!(filter.action, Some(AuditAction::Execute));
        assert_eq!(filter.success, Some(false));
    }

    // ============== Retention Tests ==============

    #[test]
    fn test_prune_expired() {
        let (log, clock) = log_with(100, 1);
        log.log_execution("u", "day1", None);
        clock.advance(Duration::hours(20));
        log.log_execution("u", "day1-late", None);
        clock.advance(Duration::hours(5));

        assert_eq!(log.prune_expired(), 1);
        assert_eq!(log.len(), 1);
        assert_eq!(log.get_recent(1)[0].resource, "day1-late");
    }

    #[test]
    fn test_prune_nothing_expired() {
        let log = log();
        log.log_execution("u", "t", None);
        assert_eq!(log.prune_expired(), 0);
    }

    #[test]
    fn test_prune_with_longest_accepted_retention() {
        let (log, clock) = log_with(100, shared::MAX_RETENTION_DAYS);
        log.log_execution("u", "t", None);

        clock.advance(Duration::days(365));
        assert_eq!(log.prune_expired(), 0);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_prune_with_unbounded_retention_keeps_everything() {
        let (log, clock) = log_with(100, u32::MAX);
        log.log_execution("u", "t", None);

        clock.advance(Duration::days(365));
        assert_eq!(log.prune_expired(), 0);
        assert_eq!(log.len(), 1);
    }

    // ============== Stats & Export Tests ==============

    #[test]
    fn test_stats() {
        let log = log();
        assert!(log.is_empty());

        log.log_execution("u", "t", None);
        log.log_execution("u", "t", Some(&failure("boom")));
        log.record(AuditEvent::success("admin", AuditAction::Register, "t"));

        let stats = log.stats();
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.by_action.get(&AuditAction::Execute), Some(&2));
        assert_eq!(stats.by_action.get(&AuditAction::Register), Some(&1));
        assert!(stats.oldest <= stats.newest);
    }

    #[test]
    fn test_export_json() {
        let log = log();
        log.log_execution("admin", "tool1", None);
        log.log_execution("guest", "tool2", Some(&failure("Denied")));

        let json = log.export_json();
        let array = json.as_array().unwrap();
        assert_eq!(array.len(), 2);
        assert_eq!(array[0]["resource"], "tool1");
        assert_eq!(array[1]["action"], "execute");
        assert_eq!(array[1]["userId"], "guest");
    }
}
