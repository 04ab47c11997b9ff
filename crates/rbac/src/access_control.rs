//! AccessController - Tool permissions and usage quotas
//!
//! Permissions are evaluated first-match-wins:
//! 1. No permission record for the tool: allow
//! 2. `allow_anonymous`: allow
//! 3. User listed in `allowed_users`: allow
//! 4. Any role in `allowed_roles`: allow
//! 5. Otherwise deny
//!
//! Quotas reset lazily: every read or write path first checks `reset_at`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shared::{Clock, QuotaConfig, QuotaPeriod};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Access policy for one tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub tool_name: String,

    #[serde(default)]
    pub allowed_roles: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_users: Option<BTreeSet<String>>,

    #[serde(default)]
    pub allow_anonymous: bool,
}

impl Permission {
    /// A policy that denies everyone until roles or users are added
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            allowed_roles: BTreeSet::new(),
            allowed_users: None,
            allow_anonymous: false,
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn with_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_users
            .get_or_insert_with(BTreeSet::new)
            .extend(users.into_iter().map(Into::into));
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.allow_anonymous = true;
        self
    }
}

/// Usage quota for a subject (`user` or `user:tool`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    pub subject_key: String,
    pub limit: u64,
    pub used: u64,
    pub reset_at: DateTime<Utc>,
    pub period: QuotaPeriod,
}

impl Quota {
    pub fn new(subject_key: impl Into<String>, limit: u64, period: QuotaPeriod, now: DateTime<Utc>) -> Self {
        Self {
            subject_key: subject_key.into(),
            limit,
            used: 0,
            reset_at: period.next_reset(now),
            period,
        }
    }

    /// Start a new period if the current one has ended
    pub fn reset_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if now > self.reset_at {
            self.used = 0;
            self.reset_at = self.period.next_reset(now);
            true
        } else {
            false
        }
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }
}

/// Which rule admitted a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessReason {
    NoPolicy,
    Anonymous,
    User,
    Role,
}

/// Outcome of a permission evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed(AccessReason),
    Denied,
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allowed(_))
    }
}

/// Subject key of a tool-specific quota
pub fn tool_subject(user_id: &str, tool_name: &str) -> String {
    format!("{user_id}:{tool_name}")
}

/// Permission and quota bookkeeping
#[derive(Debug)]
pub struct AccessController {
    permissions: RwLock<HashMap<String, Permission>>,
    quotas: RwLock<HashMap<String, Quota>>,
    config: QuotaConfig,
    clock: Arc<dyn Clock>,
}

impl AccessController {
    pub fn new(config: QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            permissions: RwLock::new(HashMap::new()),
            quotas: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    // ---------- permissions ----------

    /// Evaluate the permission rules for a caller
    pub fn evaluate<S: AsRef<str>>(&self, tool_name: &str, user_id: &str, roles: &[S]) -> AccessDecision {
        let permissions = self.permissions.read();
        let Some(permission) = permissions.get(tool_name) else {
            return AccessDecision::Allowed(AccessReason::NoPolicy);
        };

        if permission.allow_anonymous {
            return AccessDecision::Allowed(AccessReason::Anonymous);
        }
        if permission
            .allowed_users
            .as_ref()
            .is_some_and(|users| users.contains(user_id))
        {
            return AccessDecision::Allowed(AccessReason::User);
        }
        if roles
            .iter()
            .any(|role| permission.allowed_roles.contains(role.as_ref()))
        {
            return AccessDecision::Allowed(AccessReason::Role);
        }

        debug!(tool = tool_name, user = user_id, "access denied by policy");
        AccessDecision::Denied
    }

    pub fn can_access<S: AsRef<str>>(&self, tool_name: &str, user_id: &str, roles: &[S]) -> bool {
        self.evaluate(tool_name, user_id, roles).is_allowed()
    }

    /// Install or replace a tool's permission; returns the previous record
    pub fn set_permission(&self, permission: Permission) -> Option<Permission> {
        info!(
            tool = %permission.tool_name,
            roles = ?permission.allowed_roles,
            anonymous = permission.allow_anonymous,
            "permission set"
        );
        self.permissions
            .write()
            .insert(permission.tool_name.clone(), permission)
    }

    /// Drop a tool's permission, returning it to default allow
    pub fn remove_permission(&self, tool_name: &str) -> Option<Permission> {
        self.permissions.write().remove(tool_name)
    }

    pub fn permission(&self, tool_name: &str) -> Option<Permission> {
        self.permissions.read().get(tool_name).cloned()
    }

    pub fn permissions(&self) -> Vec<Permission> {
        let mut all: Vec<_> = self.permissions.read().values().cloned().collect();
        all.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
        all
    }

    // ---------- quotas ----------

    /// Install or replace a quota for a subject key, starting a fresh period
    pub fn set_quota(&self, subject_key: impl Into<String>, limit: u64, period: QuotaPeriod) -> Quota {
        let quota = Quota::new(subject_key, limit, period, self.clock.now());
        info!(subject = %quota.subject_key, limit, ?period, "quota set");
        self.quotas
            .write()
            .insert(quota.subject_key.clone(), quota.clone());
        quota
    }

    pub fn remove_quota(&self, subject_key: &str) -> Option<Quota> {
        self.quotas.write().remove(subject_key)
    }

    /// Snapshot of a quota, after any due reset
    pub fn quota(&self, subject_key: &str) -> Option<Quota> {
        let now = self.clock.now();
        let mut quotas = self.quotas.write();
        let quota = quotas.get_mut(subject_key)?;
        quota.reset_if_due(now);
        Some(quota.clone())
    }

    /// The quota that governs a call, creating the default one if configured
    pub fn quota_status(&self, user_id: &str, tool_name: &str) -> Option<Quota> {
        let now = self.clock.now();
        let mut quotas = self.quotas.write();
        self.governing(&mut quotas, user_id, tool_name, now)
            .map(|quota| quota.clone())
    }

    /// `true` if the caller has quota left (or no quota applies)
    pub fn check_quota(&self, user_id: &str, tool_name: &str) -> bool {
        self.quota_status(user_id, tool_name)
            .map_or(true, |quota| !quota.is_exhausted())
    }

    /// Count one use against the governing quota
    pub fn increment_quota(&self, user_id: &str, tool_name: &str) {
        let now = self.clock.now();
        let mut quotas = self.quotas.write();
        if let Some(quota) = self.governing(&mut quotas, user_id, tool_name, now) {
            quota.used += 1;
            debug!(subject = %quota.subject_key, used = quota.used, limit = quota.limit, "quota used");
        }
    }

    fn governing<'a>(
        &self,
        quotas: &'a mut HashMap<String, Quota>,
        user_id: &str,
        tool_name: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a mut Quota> {
        let tool_key = tool_subject(user_id, tool_name);
        let key = if quotas.contains_key(&tool_key) {
            tool_key
        } else if quotas.contains_key(user_id) {
            user_id.to_string()
        } else {
            let limit = self.config.default_limit?;
            let quota = Quota::new(user_id, limit, self.config.default_period, now);
            debug!(subject = user_id, limit, "default quota created");
            quotas.insert(user_id.to_string(), quota);
            user_id.to_string()
        };

        let quota = quotas.get_mut(&key)?;
        quota.reset_if_due(now);
        Some(quota)
    }
}
