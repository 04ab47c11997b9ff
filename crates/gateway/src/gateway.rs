//! Gateway - composition root of the tool execution pipeline
//!
//! Every call runs authenticate → authorize → rate-limit → quota → lookup →
//! execute, and exactly one audit entry is written before the response
//! is returned. No gateway lock is held while a tool runs.

use crate::connections::{ConnectionInfo, ConnectionRegistry};
use crate::handler::ToolHandler;
use crate::response::{ExecuteResponse, GatewayMetrics, HealthReport, HealthStatus};
use audit::{
    AuditAction, AuditEvent, AuditFilter, AuditLog, AuditLogEntry, RateLimitDecision, TokenBucketLimiter,
};
use auth::{Authenticator, ClientKeyStrategy};
use channel::{close_code, ChannelState, EncryptedChannel, Role, SessionInfo, Transport};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rbac::{tool_subject, AccessController, Permission, Quota, RegistrationOutcome, RegistryError, ToolRegistry};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::{
    system_clock, Clock, ErrorKind, GatewayConfig, GatewayError, Identity, QuotaPeriod, Result, ToolDefinition,
    ToolStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// User id recorded when a credential could not be authenticated
pub const ANONYMOUS_USER: &str = "anonymous";
/// User id recorded for trusted in-process registrations
pub const SYSTEM_USER: &str = "system";

/// Caller context beyond the credential
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub remote_addr: Option<String>,
    /// Connection the call arrived on
    pub connection_id: Option<String>,
}

impl CallContext {
    pub fn from_addr(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: Some(remote_addr.into()),
            connection_id: None,
        }
    }
}

/// A call received over an encrypted channel
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelRequest {
    /// Echoed back on the response
    #[serde(default)]
    pub id: Option<Value>,
    pub tool: String,
    #[serde(default)]
    pub params: Value,
    pub credential: String,
}

/// What one maintenance pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub buckets_evicted: usize,
    pub audit_entries_pruned: usize,
}

struct Outcome {
    user_id: String,
    result: Result<Value>,
    rate_limit: Option<RateLimitDecision>,
}

impl Outcome {
    fn failed(user_id: String, err: GatewayError, rate_limit: Option<RateLimitDecision>) -> Self {
        Self {
            user_id,
            result: Err(err),
            rate_limit,
        }
    }
}

/// The gateway
pub struct Gateway {
    /// Effective configuration
    config: GatewayConfig,
    /// Time source shared by every component
    clock: Arc<dyn Clock>,
    /// Credential verification
    authenticator: Arc<dyn Authenticator>,
    /// Maps an identity to its rate-limit key
    client_keys: ClientKeyStrategy,
    /// Tool definitions and usage
    registry: ToolRegistry,
    /// Execution functions by tool name
    handlers: RwLock<HashMap<String, Arc<dyn ToolHandler>>>,
    /// Permissions and quotas
    access: AccessController,
    /// Audit log (shared with the maintenance task)
    audit: Arc<AuditLog>,
    /// Rate limiter (shared with the maintenance task)
    limiter: Arc<TokenBucketLimiter>,
    /// Open client connections
    connections: ConnectionRegistry,
    started_at: DateTime<Utc>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Create a gateway on the system clock
    pub fn new(config: GatewayConfig, authenticator: Arc<dyn Authenticator>) -> Result<Self> {
        Self::with_clock(config, authenticator, system_clock())
    }

    pub fn with_clock(
        config: GatewayConfig,
        authenticator: Arc<dyn Authenticator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            client_keys: ClientKeyStrategy::from(config.rate_limit.client_key),
            registry: ToolRegistry::new(config.registry.clone(), clock.clone()),
            handlers: RwLock::new(HashMap::new()),
            access: AccessController::new(config.quota.clone(), clock.clone()),
            audit: Arc::new(AuditLog::new(&config.audit, clock.clone())),
            limiter: Arc::new(TokenBucketLimiter::new(&config.rate_limit, clock.clone())),
            connections: ConnectionRegistry::new(clock.clone()),
            started_at: clock.now(),
            maintenance: Mutex::new(None),
            authenticator,
            config,
            clock,
        })
    }

    /// Builder: override the configured client key mode
    pub fn with_client_key_strategy(mut self, strategy: ClientKeyStrategy) -> Self {
        self.client_keys = strategy;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn access(&self) -> &AccessController {
        &self.access
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn limiter(&self) -> &TokenBucketLimiter {
        &self.limiter
    }

    // ============== Lifecycle ==============

    /// Start the periodic maintenance task (idle bucket eviction and audit
    /// retention). Calling it again while the task runs is a no-op.
    pub fn initialize(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| GatewayError::Config("initialize must run inside a Tokio runtime".to_string()))?;

        let mut maintenance = self.maintenance.lock();
        if maintenance.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }

        let interval = Duration::from_secs(self.config.audit.cleanup_interval_secs.max(1));
        let limiter = self.limiter.clone();
        let audit = self.audit.clone();
        *maintenance = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                maintain(&limiter, &audit);
            }
        }));

        info!(
            tools = self.registry.len(),
            cleanup_interval_secs = interval.as_secs(),
            "gateway initialized"
        );
        Ok(())
    }

    /// Run one maintenance pass now
    pub fn run_maintenance(&self) -> MaintenanceReport {
        maintain(&self.limiter, &self.audit)
    }

    /// Stop maintenance and tear down every connection
    pub async fn destroy(&self) {
        let task = self.maintenance.lock().take();
        if let Some(task) = task {
            task.abort();
        }

        let connections = self.connections.drain();
        let count = connections.len();
        for (info, channel) in connections {
            if let Some(channel) = channel {
                if channel.state() != ChannelState::Closed {
                    channel.close(close_code::GOING_AWAY, "gateway shutting down").await;
                }
            }
            debug!(client = %info.client_id, "connection torn down");
        }
        info!(connections = count, "gateway destroyed");
    }

    fn maintenance_running(&self) -> bool {
        self.maintenance
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    // ============== Execution ==============

    /// Execute a tool on behalf of `credential`
    pub async fn execute(&self, tool_name: &str, params: Value, credential: &str) -> ExecuteResponse {
        self.execute_with_context(tool_name, params, credential, &CallContext::default())
            .await
    }

    pub async fn execute_with_context(
        &self,
        tool_name: &str,
        params: Value,
        credential: &str,
        ctx: &CallContext,
    ) -> ExecuteResponse {
        let outcome = self.run_pipeline(tool_name, params, credential, ctx).await;

        self.audit
            .log_execution(&outcome.user_id, tool_name, outcome.result.as_ref().err());

        let rate_limit = if self.config.rate_limit.include_headers && self.limiter.is_enabled() {
            outcome.rate_limit
        } else {
            None
        };
        ExecuteResponse {
            result: outcome.result,
            rate_limit,
        }
    }

    async fn run_pipeline(&self, tool_name: &str, params: Value, credential: &str, ctx: &CallContext) -> Outcome {
        let identity = match self.authenticator.authenticate(credential).await {
            Ok(identity) => identity,
            Err(err) => {
                debug!(tool = tool_name, error = %err, "authentication failed");
                return Outcome::failed(ANONYMOUS_USER.to_string(), err.into(), None);
            }
        };
        let user_id = identity.user_id.clone();
        let client_key = self.client_keys.client_key(&identity, ctx.remote_addr.as_deref());
        if let Some(connection_id) = &ctx.connection_id {
            self.connections.bind_client_key(connection_id, &client_key);
        }

        if !self.access.can_access(tool_name, &user_id, identity.roles.as_slice()) {
            let err = GatewayError::PermissionDenied {
                user_id: user_id.clone(),
                action: "execute".to_string(),
                resource: tool_name.to_string(),
            };
            return Outcome::failed(user_id, err, Some(self.limiter.peek(&client_key)));
        }

        let decision = self.limiter.check(&client_key);
        if !decision.allowed {
            let err = GatewayError::RateLimitExceeded {
                client_key,
                limit: decision.limit,
                retry_after_secs: decision.retry_after_secs.unwrap_or(1),
            };
            return Outcome::failed(user_id, err, Some(decision));
        }

        if !self.access.check_quota(&user_id, tool_name) {
            let err = match self.access.quota_status(&user_id, tool_name) {
                Some(quota) => GatewayError::QuotaExceeded {
                    subject_key: quota.subject_key,
                    limit: quota.limit,
                    used: quota.used,
                    reset_at: quota.reset_at,
                },
                None => GatewayError::QuotaExceeded {
                    subject_key: tool_subject(&user_id, tool_name),
                    limit: 0,
                    used: 0,
                    reset_at: self.clock.now(),
                },
            };
            return Outcome::failed(user_id, err, Some(decision));
        }

        let handler = match self.resolve(tool_name, &params) {
            Ok(handler) => handler,
            Err(err) => return Outcome::failed(user_id, err, Some(decision)),
        };

        debug!(tool = tool_name, user = %user_id, "executing tool");
        match handler.call(params).await {
            Ok(data) => {
                self.access.increment_quota(&user_id, tool_name);
                self.registry.mark_used(tool_name);
                Outcome {
                    user_id,
                    result: Ok(data),
                    rate_limit: Some(decision),
                }
            }
            Err(tool_err) => {
                warn!(tool = tool_name, user = %user_id, error = %tool_err, "tool failed");
                let rate_limit = if self.config.rate_limit.skip_failed_requests {
                    self.limiter.refund(&client_key);
                    self.limiter.peek(&client_key)
                } else {
                    decision
                };
                Outcome::failed(user_id, GatewayError::Tool(tool_err), Some(rate_limit))
            }
        }
    }

    /// Look up an executable tool and check its parameters
    fn resolve(&self, tool_name: &str, params: &Value) -> Result<Arc<dyn ToolHandler>> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| GatewayError::tool_not_found(tool_name))?;

        match tool.status {
            ToolStatus::Inactive => {
                return Err(GatewayError::ToolNotFound {
                    name: tool_name.to_string(),
                    reason: Some("tool is inactive".to_string()),
                })
            }
            ToolStatus::Deprecated => warn!(tool = tool_name, "executing deprecated tool"),
            ToolStatus::Active => {}
        }

        let issues = tool.definition.check_params(params);
        if !issues.is_empty() {
            return Err(GatewayError::ValidationFailed { issues });
        }

        self.handlers
            .read()
            .get(tool_name)
            .cloned()
            .ok_or_else(|| GatewayError::ToolNotFound {
                name: tool_name.to_string(),
                reason: Some("no handler attached".to_string()),
            })
    }

    // ============== Administration ==============

    /// Authenticate an admin call; failures are audited here
    async fn authorize_admin(&self, credential: &str, action: AuditAction, resource: &str) -> Result<Identity> {
        let identity = match self.authenticator.authenticate(credential).await {
            Ok(identity) => identity,
            Err(err) => {
                let err = GatewayError::from(err);
                self.audit
                    .record(AuditEvent::failure(ANONYMOUS_USER, action, resource, err.to_string()));
                return Err(err);
            }
        };

        if !identity.has_any_role(&self.config.admin_roles) {
            let err = GatewayError::PermissionDenied {
                user_id: identity.user_id.clone(),
                action: action.as_str().to_string(),
                resource: resource.to_string(),
            };
            self.audit
                .record(AuditEvent::failure(&identity.user_id, action, resource, err.to_string()));
            return Err(err);
        }
        Ok(identity)
    }

    /// Register (or, with versioning, update) a tool. Admin only.
    ///
    /// Returns `Ok(false)` when the registry refuses the tool (duplicate
    /// name or capacity) and `ValidationFailed` listing every violated rule
    /// for a malformed definition.
    pub async fn register(
        &self,
        tool: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
        credential: &str,
    ) -> Result<bool> {
        let identity = self
            .authorize_admin(credential, AuditAction::Register, &tool.name)
            .await?;
        self.install(&identity.user_id, tool, handler)
    }

    /// Trusted in-process registration, audited as [`SYSTEM_USER`]
    pub fn register_builtin(&self, tool: ToolDefinition, handler: Arc<dyn ToolHandler>) -> Result<bool> {
        self.install(SYSTEM_USER, tool, handler)
    }

    fn install(&self, user_id: &str, tool: ToolDefinition, handler: Arc<dyn ToolHandler>) -> Result<bool> {
        let name = tool.name.clone();
        // The handler goes in first so a call never sees the tool without it.
        let previous = self.handlers.write().insert(name.clone(), handler);
        let registered = self.registry.try_register(tool);
        if registered.is_err() {
            let mut handlers = self.handlers.write();
            match previous {
                Some(previous) => handlers.insert(name.clone(), previous),
                None => handlers.remove(&name),
            };
        }

        match registered {
            Ok(outcome) => {
                let details = match outcome {
                    RegistrationOutcome::Registered => json!({ "outcome": "registered" }),
                    RegistrationOutcome::Updated { previous_version } => {
                        json!({ "outcome": "updated", "previousVersion": previous_version })
                    }
                };
                self.audit
                    .record(AuditEvent::success(user_id, AuditAction::Register, &name).with_details(details));
                Ok(true)
            }
            Err(RegistryError::Validation(issues)) => {
                let err = GatewayError::ValidationFailed { issues };
                self.audit
                    .record(AuditEvent::failure(user_id, AuditAction::Register, &name, err.to_string()));
                Err(err)
            }
            Err(refused) => {
                self.audit.record(AuditEvent::failure(
                    user_id,
                    AuditAction::Register,
                    &name,
                    refused.to_string(),
                ));
                Ok(false)
            }
        }
    }

    /// Remove a tool and its handler. Admin only.
    pub async fn unregister(&self, tool_name: &str, credential: &str) -> Result<bool> {
        let identity = self
            .authorize_admin(credential, AuditAction::Unregister, tool_name)
            .await?;

        let removed = self.registry.unregister(tool_name);
        if removed {
            self.handlers.write().remove(tool_name);
            self.audit
                .record(AuditEvent::success(&identity.user_id, AuditAction::Unregister, tool_name));
        } else {
            self.audit.record(AuditEvent::failure(
                &identity.user_id,
                AuditAction::Unregister,
                tool_name,
                "tool is not registered",
            ));
        }
        Ok(removed)
    }

    /// Install a permission record, returning the one it replaced. Admin only.
    pub async fn set_permission(&self, permission: Permission, credential: &str) -> Result<Option<Permission>> {
        let identity = self
            .authorize_admin(credential, AuditAction::PermissionChange, &permission.tool_name)
            .await?;

        let details = serde_json::to_value(&permission)?;
        let resource = permission.tool_name.clone();
        let previous = self.access.set_permission(permission);
        self.audit.record(
            AuditEvent::success(&identity.user_id, AuditAction::PermissionChange, resource).with_details(details),
        );
        Ok(previous)
    }

    /// Drop a tool's permission record (back to default allow). Admin only.
    pub async fn remove_permission(&self, tool_name: &str, credential: &str) -> Result<bool> {
        let identity = self
            .authorize_admin(credential, AuditAction::PermissionChange, tool_name)
            .await?;

        let removed = self.access.remove_permission(tool_name).is_some();
        self.audit.record(
            AuditEvent::success(&identity.user_id, AuditAction::PermissionChange, tool_name)
                .with_details(json!({ "removed": removed })),
        );
        Ok(removed)
    }

    /// Set a quota for a user (`user`) or a user on one tool (`user:tool`). Admin only.
    pub async fn set_quota(
        &self,
        subject_key: &str,
        limit: u64,
        period: QuotaPeriod,
        credential: &str,
    ) -> Result<Quota> {
        let identity = self
            .authorize_admin(credential, AuditAction::QuotaChange, subject_key)
            .await?;

        let quota = self.access.set_quota(subject_key, limit, period);
        self.audit.record(
            AuditEvent::success(&identity.user_id, AuditAction::QuotaChange, subject_key)
                .with_details(json!({ "limit": limit, "period": period, "resetAt": quota.reset_at })),
        );
        Ok(quota)
    }

    /// Read-only audit export
    pub fn query_audit(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        self.audit.query(filter)
    }

    // ============== Connections ==============

    pub fn open_connection(&self, client_id: &str, remote_addr: Option<String>) -> ConnectionInfo {
        debug!(client = client_id, "connection opened");
        self.connections.open(client_id, remote_addr)
    }

    pub fn attach_session(&self, client_id: &str, session: SessionInfo) -> bool {
        self.connections.attach_session(client_id, session)
    }

    /// Close a connection's channel and forget it.
    ///
    /// The client's rate-limit bucket is dropped only if it is full.
    pub async fn disconnect(&self, client_id: &str) -> bool {
        let Some((info, channel)) = self.connections.remove(client_id) else {
            return false;
        };

        if let Some(channel) = channel {
            if channel.state() != ChannelState::Closed {
                channel.close(close_code::NORMAL, "disconnected").await;
            }
        }
        let key = info.client_key.as_deref().unwrap_or(client_id);
        let evicted = self.limiter.evict_if_full(key);
        debug!(client = client_id, bucket_evicted = evicted, "connection closed");
        true
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections.list()
    }

    /// Secure `transport` as the responder and serve calls over it in the
    /// background until the peer goes away.
    pub async fn accept(
        self: &Arc<Self>,
        client_id: &str,
        transport: Arc<dyn Transport>,
        remote_addr: Option<String>,
    ) -> Result<JoinHandle<()>> {
        let channel = EncryptedChannel::open(
            transport,
            Role::Responder,
            self.config.encryption.clone(),
            self.clock.clone(),
        )
        .await?;

        self.open_connection(client_id, remote_addr);
        let gateway = Arc::clone(self);
        let client_id = client_id.to_string();
        Ok(tokio::spawn(async move {
            gateway.serve_channel(&client_id, channel).await;
        }))
    }

    /// Answer [`ChannelRequest`]s arriving on `channel` until it closes
    pub async fn serve_channel(&self, client_id: &str, channel: Arc<EncryptedChannel>) {
        let remote_addr = match self.connections.get(client_id) {
            Some(info) => info.remote_addr,
            None => self.open_connection(client_id, None).remote_addr,
        };
        self.connections.attach_channel(client_id, channel.clone());
        let ctx = CallContext {
            remote_addr,
            connection_id: Some(client_id.to_string()),
        };

        while let Some(message) = channel.recv().await {
            let reply = match serde_json::from_slice::<ChannelRequest>(&message) {
                Ok(request) => {
                    let response = self
                        .execute_with_context(&request.tool, request.params, &request.credential, &ctx)
                        .await;
                    let mut body = response.to_json();
                    if let Some(id) = request.id {
                        body["id"] = id;
                    }
                    body
                }
                Err(err) => json!({
                    "success": false,
                    "error": {
                        "kind": ErrorKind::ValidationFailed,
                        "message": format!("malformed request: {err}"),
                    },
                }),
            };

            if let Err(err) = channel.send_json(&reply).await {
                warn!(client = client_id, error = %err, "failed to send response");
                break;
            }
        }

        self.disconnect(client_id).await;
    }

    // ============== Health & Metrics ==============

    fn uptime_secs(&self) -> i64 {
        (self.clock.now() - self.started_at).num_seconds()
    }

    pub fn health(&self) -> HealthReport {
        let registry = self.registry.stats();
        HealthReport {
            status: if self.maintenance_running() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            uptime_secs: self.uptime_secs(),
            tools: registry.total_tools,
            active_tools: registry.active_tools,
            connections: self.connections.len(),
            rate_limiting: self.limiter.is_enabled(),
            maintenance_running: self.maintenance_running(),
        }
    }

    pub fn metrics(&self) -> GatewayMetrics {
        let connections = self.connections.list();
        GatewayMetrics {
            uptime_secs: self.uptime_secs(),
            registry: self.registry.stats(),
            rate_limiter: self.limiter.metrics(),
            audit: self.audit.stats(),
            connections: connections.len(),
            secured_connections: connections.iter().filter(|c| c.session.is_some()).count(),
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Some(task) = self.maintenance.get_mut().take() {
            task.abort();
        }
    }
}

fn maintain(limiter: &TokenBucketLimiter, audit: &AuditLog) -> MaintenanceReport {
    let report = MaintenanceReport {
        buckets_evicted: limiter.evict_idle(),
        audit_entries_pruned: audit.prune_expired(),
    };
    if report != MaintenanceReport::default() {
        debug!(
            buckets_evicted = report.buckets_evicted,
            audit_entries_pruned = report.audit_entries_pruned,
            "maintenance pass"
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnTool;
    use auth::ApiKeyAuthenticator;
    use channel::memory_pair;
    use chrono::TimeZone;
    use shared::{ManualClock, ParameterSpec, RateLimitConfig, RegistryConfig, ToolError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ADMIN: &str = "admin-key";
    const ALICE: &str = "alice-key";
    const BOB: &str = "bob-key";

    fn authenticator() -> Arc<dyn Authenticator> {
        Arc::new(
            ApiKeyAuthenticator::new()
                .with_key(ADMIN, "root", ["admin"])
                .with_key(ALICE, "alice", ["viewer"])
                .with_key(BOB, "bob", ["editor"]),
        )
    }

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            rate_limit: RateLimitConfig {
                window_secs: 5,
                max_requests: 5,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn create_gateway(config: GatewayConfig) -> (Gateway, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
        let gateway = Gateway::with_clock(config, authenticator(), clock.clone()).unwrap();
        (gateway, clock)
    }

    fn echo() -> Arc<dyn ToolHandler> {
        Arc::new(FnTool::new(|params: Value| async move { Ok(json!({ "echo": params })) }))
    }

    fn counting(calls: Arc<AtomicUsize>) -> Arc<dyn ToolHandler> {
        Arc::new(FnTool::new(move |params: Value| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(params)
            }
        }))
    }

    fn failing() -> Arc<dyn ToolHandler> {
        Arc::new(FnTool::new(|_params: Value| async move {
            Err::<Value, _>(ToolError::new("backend unavailable").with_code("E_BACKEND"))
        }))
    }

    fn echo_definition() -> ToolDefinition {
        ToolDefinition::new("echo", "Echo parameters back").with_category("util")
    }

    fn gateway_with_echo() -> (Gateway, Arc<ManualClock>) {
        let (gateway, clock) = create_gateway(test_config());
        assert!(gateway.register_builtin(echo_definition(), echo()).unwrap());
        (gateway, clock)
    }

    fn execute_entries(gateway: &Gateway) -> Vec<AuditLogEntry> {
        gateway.query_audit(&AuditFilter::new().action(AuditAction::Execute))
    }

    // ============== Execute Tests ==============

    #[tokio::test]
    async fn test_execute_success() {
        let (gateway, _) = gateway_with_echo();

        let response = gateway.execute("echo", json!({"msg": "hi"}), ALICE).await;

        assert_eq!(response.result.as_ref().unwrap(), &json!({"echo": {"msg": "hi"}}));
        let rate_limit = response.rate_limit.as_ref().unwrap();
        assert_eq!(rate_limit.limit, 5);
        assert_eq!(rate_limit.remaining, 4);

        let tool = gateway.registry().get("echo").unwrap();
        assert_eq!(tool.usage_count, 1);
        assert!(tool.last_used_at.is_some());

        let entries = execute_entries(&gateway);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].success);
        assert_eq!(entries[0].user_id, "alice");
        assert_eq!(entries[0].resource, "echo");
    }

    #[tokio::test]
    async fn test_authentication_failure_is_audited_as_anonymous() {
        let (gateway, _) = gateway_with_echo();

        let response = gateway.execute("echo", json!({}), "wrong-key").await;

        assert_eq!(response.error().unwrap().kind(), ErrorKind::AuthenticationFailed);
        assert!(response.rate_limit.is_none());

        let entries = execute_entries(&gateway);
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].success);
        assert_eq!(entries[0].user_id, ANONYMOUS_USER);
        assert!(entries[0].error.as_deref().unwrap().contains("Authentication failed"));
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let (gateway, _) = gateway_with_echo();
        gateway
            .set_permission(Permission::new("echo").with_roles(["admin"]), ADMIN)
            .await
            .unwrap();

        let response = gateway.execute("echo", json!({}), ALICE).await;

        match response.error() {
            Some(GatewayError::PermissionDenied { user_id, action, resource }) => {
                assert_eq!(user_id, "alice");
                assert_eq!(action, "execute");
                assert_eq!(resource, "echo");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // Rejections still report the caller's rate-limit standing
        assert!(response.rate_limit.is_some());
        assert!(gateway.execute("echo", json!({}), ADMIN).await.is_success());
    }

    #[tokio::test]
    async fn test_allowed_user_bypasses_roles() {
        let (gateway, _) = gateway_with_echo();
        gateway
            .set_permission(
                Permission::new("echo").with_roles(["admin"]).with_users(["bob"]),
                ADMIN,
            )
            .await
            .unwrap();

        assert!(gateway.execute("echo", json!({}), BOB).await.is_success());
        assert!(!gateway.execute("echo", json!({}), ALICE).await.is_success());
    }

    #[tokio::test]
    async fn test_rate_limit_burst_then_refill() {
        let (gateway, clock) = gateway_with_echo();

        for _ in 0..5 {
            assert!(gateway.execute("echo", json!({}), ALICE).await.is_success());
        }

        let rejected = gateway.execute("echo", json!({}), ALICE).await;
        assert_eq!(rejected.error().unwrap().retry_after_secs(), Some(1));
        assert_eq!(rejected.rate_limit.as_ref().unwrap().retry_after_secs, Some(1));
        assert_eq!(rejected.rate_limit.as_ref().unwrap().remaining, 0);

        // Other callers have their own bucket
        assert!(gateway.execute("echo", json!({}), BOB).await.is_success());

        clock.advance(chrono::Duration::seconds(1));
        assert!(gateway.execute("echo", json!({}), ALICE).await.is_success());
    }

    #[tokio::test]
    async fn test_quota_exhaustion_and_reset() {
        let (gateway, clock) = gateway_with_echo();
        gateway.set_quota("alice:echo", 2, QuotaPeriod::Day, ADMIN).await.unwrap();

        assert!(gateway.execute("echo", json!({}), ALICE).await.is_success());
        assert!(gateway.execute("echo", json!({}), ALICE).await.is_success());

        let third = gateway.execute("echo", json!({}), ALICE).await;
        match third.error() {
            Some(GatewayError::QuotaExceeded { subject_key, limit, used, .. }) => {
                assert_eq!(subject_key, "alice:echo");
                assert_eq!(*limit, 2);
                assert_eq!(*used, 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        clock.advance(chrono::Duration::days(1));
        assert!(gateway.execute("echo", json!({}), ALICE).await.is_success());
    }

    #[tokio::test]
    async fn test_global_quota_counts_every_tool() {
        let (gateway, _) = gateway_with_echo();
        gateway
            .register_builtin(ToolDefinition::new("ping", "Ping"), echo())
            .unwrap();
        gateway.set_quota("alice", 2, QuotaPeriod::Hour, ADMIN).await.unwrap();

        assert!(gateway.execute("echo", json!({}), ALICE).await.is_success());
        assert!(gateway.execute("ping", json!({}), ALICE).await.is_success());
        let third = gateway.execute("echo", json!({}), ALICE).await;
        assert_eq!(third.error().unwrap().kind(), ErrorKind::QuotaExceeded);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (gateway, _) = gateway_with_echo();

        let response = gateway.execute("missing", json!({}), ALICE).await;

        assert!(matches!(
            response.error(),
            Some(GatewayError::ToolNotFound { name, reason: None }) if name == "missing"
        ));
        assert_eq!(execute_entries(&gateway).len(), 1);
    }

    #[tokio::test]
    async fn test_inactive_tool_is_refused() {
        let (gateway, _) = gateway_with_echo();
        gateway.registry().set_status("echo", ToolStatus::Inactive);

        let response = gateway.execute("echo", json!({}), ALICE).await;

        match response.error() {
            Some(GatewayError::ToolNotFound { reason, .. }) => {
                assert_eq!(reason.as_deref(), Some("tool is inactive"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deprecated_tool_still_runs() {
        let (gateway, _) = gateway_with_echo();
        gateway.registry().set_status("echo", ToolStatus::Deprecated);

        assert!(gateway.execute("echo", json!({}), ALICE).await.is_success());
    }

    #[tokio::test]
    async fn test_parameters_are_checked_before_execution() {
        let (gateway, _) = create_gateway(test_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let definition = ToolDefinition::new("add", "Add two numbers")
            .with_parameter("a", ParameterSpec::new("number", "left").required())
            .with_parameter("b", ParameterSpec::new("number", "right").required());
        gateway.register_builtin(definition, counting(calls.clone())).unwrap();

        let response = gateway.execute("add", json!({"a": "one"}), ALICE).await;

        match response.error() {
            Some(GatewayError::ValidationFailed { issues }) => assert_eq!(issues.len(), 2),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tool_error_propagates_unchanged() {
        let (gateway, _) = create_gateway(test_config());
        gateway
            .register_builtin(ToolDefinition::new("flaky", "Always fails"), failing())
            .unwrap();

        let response = gateway.execute("flaky", json!({}), ALICE).await;

        match response.error() {
            Some(GatewayError::Tool(err)) => {
                assert_eq!(err, &ToolError::new("backend unavailable").with_code("E_BACKEND"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let entries = execute_entries(&gateway);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error.as_deref(), Some("backend unavailable"));
        assert_eq!(entries[0].details.as_ref().unwrap()["kind"], json!("tool-failed"));
        // Failed calls neither count against quota nor mark usage
        assert_eq!(gateway.registry().get("flaky").unwrap().usage_count, 0);
    }

    #[tokio::test]
    async fn test_skip_failed_requests_refunds_token() {
        let mut config = test_config();
        config.rate_limit.skip_failed_requests = true;
        let (gateway, _) = create_gateway(config);
        gateway
            .register_builtin(ToolDefinition::new("flaky", "Always fails"), failing())
            .unwrap();

        for _ in 0..10 {
            let response = gateway.execute("flaky", json!({}), ALICE).await;
            assert_eq!(response.error().unwrap().kind(), ErrorKind::ToolFailed);
            assert_eq!(response.rate_limit.as_ref().unwrap().remaining, 5);
        }
    }

    #[tokio::test]
    async fn test_failed_requests_count_by_default() {
        let (gateway, _) = create_gateway(test_config());
        gateway
            .register_builtin(ToolDefinition::new("flaky", "Always fails"), failing())
            .unwrap();

        for _ in 0..5 {
            gateway.execute("flaky", json!({}), ALICE).await;
        }
        let response = gateway.execute("flaky", json!({}), ALICE).await;
        assert_eq!(response.error().unwrap().kind(), ErrorKind::RateLimitExceeded);
    }

    #[tokio::test]
    async fn test_remote_addr_client_key() {
        let (gateway, _) = gateway_with_echo();
        let gateway = gateway.with_client_key_strategy(ClientKeyStrategy::RemoteAddr);
        let ctx = CallContext::from_addr("10.0.0.7");

        for _ in 0..3 {
            gateway.execute_with_context("echo", json!({}), ALICE, &ctx).await;
        }
        for _ in 0..2 {
            gateway.execute_with_context("echo", json!({}), BOB, &ctx).await;
        }

        // Both users share the address bucket
        let response = gateway.execute_with_context("echo", json!({}), ALICE, &ctx).await;
        assert_eq!(response.error().unwrap().kind(), ErrorKind::RateLimitExceeded);
        assert!(gateway.limiter().bucket("10.0.0.7").is_some());
    }

    #[tokio::test]
    async fn test_every_execute_writes_exactly_one_audit_entry() {
        let (gateway, _) = gateway_with_echo();
        gateway
            .register_builtin(ToolDefinition::new("flaky", "Always fails"), failing())
            .unwrap();
        gateway
            .set_permission(Permission::new("flaky").with_roles(["editor"]), ADMIN)
            .await
            .unwrap();

        let calls = [
            ("echo", ALICE, true),
            ("echo", "nope", false),
            ("flaky", ALICE, false),
            ("flaky", BOB, false),
            ("missing", BOB, false),
        ];
        for (index, (tool, credential, expect_success)) in calls.iter().enumerate() {
            let response = gateway.execute(tool, json!({}), credential).await;
            assert_eq!(response.is_success(), *expect_success);

            let entries = execute_entries(&gateway);
            assert_eq!(entries.len(), index + 1);
            assert_eq!(entries[0].success, *expect_success);
        }
    }

    // ============== Registration Tests ==============

    #[tokio::test]
    async fn test_admin_can_register() {
        let (gateway, _) = create_gateway(test_config());

        assert!(gateway.register(echo_definition(), echo(), ADMIN).await.unwrap());
        assert!(gateway.execute("echo", json!({}), ALICE).await.is_success());

        let entries = gateway.query_audit(&AuditFilter::new().action(AuditAction::Register));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].user_id, "root");
        assert_eq!(entries[0].details.as_ref().unwrap()["outcome"], json!("registered"));
    }

    #[tokio::test]
    async fn test_non_admin_cannot_register() {
        let (gateway, _) = create_gateway(test_config());

        let err = gateway.register(echo_definition(), echo(), ALICE).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(!gateway.registry().contains("echo"));
        let entries = gateway.query_audit(&AuditFilter::new().action(AuditAction::Register));
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].success);
        assert_eq!(entries[0].user_id, "alice");
    }

    #[tokio::test]
    async fn test_register_with_bad_credential() {
        let (gateway, _) = create_gateway(test_config());

        let err = gateway.register(echo_definition(), echo(), "").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        let entries = gateway.query_audit(&AuditFilter::new().user(ANONYMOUS_USER));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::Register);
    }

    #[tokio::test]
    async fn test_malformed_definition_lists_every_issue() {
        let (gateway, _) = create_gateway(test_config());
        let definition =
            ToolDefinition::new("bad name!", "").with_parameter("p", ParameterSpec::default());

        let err = gateway.register(definition, echo(), ADMIN).await.unwrap_err();

        match err {
            GatewayError::ValidationFailed { issues } => {
                let fields: Vec<_> = issues.iter().map(|i| i.field.as_str()).collect();
                assert!(fields.contains(&"name"));
                assert!(fields.contains(&"description"));
                assert!(fields.iter().any(|f| f.starts_with("parameters.p")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_registration_returns_false() {
        let (gateway, _) = create_gateway(test_config());

        assert!(gateway.register(echo_definition(), echo(), ADMIN).await.unwrap());
        assert!(!gateway.register(echo_definition(), echo(), ADMIN).await.unwrap());
        assert!(!gateway.register(echo_definition(), echo(), ADMIN).await.unwrap());

        let failures = gateway.query_audit(&AuditFilter::new().action(AuditAction::Register).success(false));
        assert_eq!(failures.len(), 2);
    }

    #[tokio::test]
    async fn test_refused_registration_keeps_existing_handler() {
        let (gateway, _) = gateway_with_echo();

        assert!(!gateway.register(echo_definition(), failing(), ADMIN).await.unwrap());

        let response = gateway.execute("echo", json!({"n": 1}), ALICE).await;
        assert_eq!(response.into_result().unwrap(), json!({"echo": {"n": 1}}));
    }

    #[tokio::test]
    async fn test_invalid_registration_leaves_no_handler() {
        let (gateway, _) = create_gateway(test_config());

        assert!(gateway.register(ToolDefinition::new("bad name!", ""), echo(), ADMIN).await.is_err());

        assert!(gateway.handlers.read().is_empty());
        assert!(gateway.registry().get("bad name!").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tool_never_visible_without_handler() {
        let mut config = test_config();
        config.rate_limit.enabled = false;
        let (gateway, _) = create_gateway(config);
        let gateway = Arc::new(gateway);

        let caller = {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                loop {
                    match gateway.execute("late", json!({}), ALICE).await.into_result() {
                        Ok(_) => return,
                        Err(GatewayError::ToolNotFound { reason: None, .. }) => tokio::task::yield_now().await,
                        Err(other) => panic!("tool was visible without its handler: {other}"),
                    }
                }
            })
        };

        tokio::task::yield_now().await;
        gateway
            .register_builtin(ToolDefinition::new("late", "Registered while being called"), echo())
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), caller).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_versioned_update_keeps_usage_and_swaps_handler() {
        let mut config = test_config();
        config.registry = RegistryConfig {
            allow_versioning: true,
            ..Default::default()
        };
        let (gateway, _) = create_gateway(config);
        gateway
            .register(echo_definition().with_version("1.0.0"), echo(), ADMIN)
            .await
            .unwrap();
        gateway.execute("echo", json!({}), ALICE).await;

        let updated = gateway
            .register(echo_definition().with_version("2.0.0"), failing(), ADMIN)
            .await
            .unwrap();

        assert!(updated);
        let tool = gateway.registry().get("echo").unwrap();
        assert_eq!(tool.usage_count, 1);
        assert_eq!(tool.definition.version.as_deref(), Some("2.0.0"));
        let response = gateway.execute("echo", json!({}), ALICE).await;
        assert_eq!(response.error().unwrap().kind(), ErrorKind::ToolFailed);

        let entries = gateway.query_audit(&AuditFilter::new().action(AuditAction::Register).limit(1));
        assert_eq!(entries[0].details.as_ref().unwrap()["previousVersion"], json!("1.0.0"));
    }

    #[tokio::test]
    async fn test_unregister_removes_handler() {
        let (gateway, _) = gateway_with_echo();

        assert!(gateway.unregister("echo", ADMIN).await.unwrap());
        assert!(!gateway.unregister("echo", ADMIN).await.unwrap());

        let response = gateway.execute("echo", json!({}), ALICE).await;
        assert_eq!(response.error().unwrap().kind(), ErrorKind::ToolNotFound);
    }

    // ============== Administration Tests ==============

    #[tokio::test]
    async fn test_permission_changes_are_audited() {
        let (gateway, _) = gateway_with_echo();

        let previous = gateway
            .set_permission(Permission::new("echo").with_roles(["admin"]), ADMIN)
            .await
            .unwrap();
        assert!(previous.is_none());
        assert!(gateway.remove_permission("echo", ADMIN).await.unwrap());

        let entries = gateway.query_audit(&AuditFilter::new().action(AuditAction::PermissionChange));
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.success && e.resource == "echo"));
        assert!(gateway.execute("echo", json!({}), ALICE).await.is_success());
    }

    #[tokio::test]
    async fn test_quota_changes_require_admin() {
        let (gateway, _) = gateway_with_echo();

        let err = gateway.set_quota("alice", 1000, QuotaPeriod::Month, ALICE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(gateway.access().quota("alice").is_none());

        let quota = gateway.set_quota("alice", 10, QuotaPeriod::Month, ADMIN).await.unwrap();
        assert_eq!(quota.limit, 10);
        assert_eq!(quota.reset_at, Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());

        let entries = gateway.query_audit(&AuditFilter::new().action(AuditAction::QuotaChange));
        assert_eq!(entries.len(), 2);
        assert!(entries[0].success);
        assert!(!entries[1].success);
    }

    // ============== Lifecycle Tests ==============

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = test_config();
        config.rate_limit.max_requests = 0;

        let result = Gateway::new(config, authenticator());
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_initialize_requires_runtime() {
        let (gateway, _) = create_gateway(test_config());
        assert!(matches!(gateway.initialize(), Err(GatewayError::Config(_))));
    }

    #[tokio::test]
    async fn test_initialize_and_destroy() {
        let (gateway, _) = gateway_with_echo();
        assert_eq!(gateway.health().status, HealthStatus::Degraded);

        gateway.initialize().unwrap();
        gateway.initialize().unwrap();
        let health = gateway.health();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.tools, 1);

        gateway.open_connection("c1", None);
        gateway.destroy().await;

        assert_eq!(gateway.health().status, HealthStatus::Degraded);
        assert!(gateway.connections().is_empty());
    }

    #[tokio::test]
    async fn test_maintenance_prunes_audit_and_idle_buckets() {
        let (gateway, clock) = gateway_with_echo();
        gateway.execute("echo", json!({}), ALICE).await;

        clock.advance(chrono::Duration::days(31));
        let report = gateway.run_maintenance();

        assert_eq!(report.buckets_evicted, 1);
        // The builtin registration and the call are both past retention
        assert_eq!(report.audit_entries_pruned, 2);
        assert!(gateway.audit().is_empty());
    }

    #[tokio::test]
    async fn test_metrics_aggregate_components() {
        let (gateway, clock) = gateway_with_echo();
        gateway.execute("echo", json!({}), ALICE).await;
        gateway.execute("echo", json!({}), "bad").await;
        clock.advance(chrono::Duration::seconds(42));

        let metrics = gateway.metrics();
        assert_eq!(metrics.uptime_secs, 42);
        assert_eq!(metrics.registry.total_usage, 1);
        assert_eq!(metrics.rate_limiter.total_checks, 1);
        assert_eq!(metrics.audit.failure_count, 1);
        assert_eq!(metrics.connections, 0);

        let json = serde_json::to_value(&metrics).unwrap();
        assert!(json.get("rateLimiter").is_some());
    }

    // ============== Connection Tests ==============

    #[tokio::test]
    async fn test_disconnect_evicts_full_bucket_only() {
        let (gateway, clock) = gateway_with_echo();
        let ctx = CallContext {
            remote_addr: None,
            connection_id: Some("c1".to_string()),
        };
        gateway.open_connection("c1", None);
        gateway.execute_with_context("echo", json!({}), ALICE, &ctx).await;

        // One token short of full: bucket survives
        gateway.open_connection("c2", None);
        assert!(gateway.disconnect("c1").await);
        assert!(gateway.limiter().bucket("alice").is_some());

        // Refilled: bucket goes with the connection
        gateway.open_connection("c1", None);
        gateway.execute_with_context("echo", json!({}), ALICE, &ctx).await;
        clock.advance(chrono::Duration::seconds(5));
        assert!(gateway.disconnect("c1").await);
        assert!(gateway.limiter().bucket("alice").is_none());

        assert!(!gateway.disconnect("c1").await);
        assert_eq!(gateway.connections().len(), 1);
    }

    #[tokio::test]
    async fn test_calls_over_encrypted_channel() {
        let (gateway, _) = gateway_with_echo();
        let gateway = Arc::new(gateway);
        let mut config = gateway.config().encryption.clone();
        config.rotation_interval_secs = 0;

        let (client_side, server_side) = memory_pair();
        let (client, served) = tokio::join!(
            EncryptedChannel::open(client_side, Role::Initiator, config, system_clock()),
            gateway.accept("c1", server_side, Some("127.0.0.1".to_string())),
        );
        let client = client.unwrap();
        let served = served.unwrap();

        client
            .send_json(&json!({"id": 7, "tool": "echo", "params": {"x": 1}, "credential": ALICE}))
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap()
            .unwrap();
        let reply: Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["id"], json!(7));
        assert_eq!(reply["success"], json!(true));
        assert_eq!(reply["data"], json!({"echo": {"x": 1}}));

        let connections = gateway.connections();
        let connection = &connections[0];
        assert_eq!(connection.client_key.as_deref(), Some("alice"));
        assert!(connection.session.is_some());
        assert_eq!(gateway.metrics().secured_connections, 1);

        client.send(b"not json").await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap()
            .unwrap();
        let reply: Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["error"]["kind"], json!("validation-failed"));

        client.close(close_code::NORMAL, "done").await;
        tokio::time::timeout(Duration::from_secs(5), served).await.unwrap().unwrap();
        assert!(gateway.connections().is_empty());
    }

    mod red_team {
        use super::*;

        #[tokio::test]
        async fn red_team_rate_limited_calls_never_reach_the_tool() {
            let (gateway, _) = create_gateway(test_config());
            let calls = Arc::new(AtomicUsize::new(0));
            gateway
                .register_builtin(ToolDefinition::new("count", "Counts calls"), counting(calls.clone()))
                .unwrap();

            for _ in 0..20 {
                gateway.execute("count", json!({}), ALICE).await;
            }

            assert_eq!(calls.load(Ordering::SeqCst), 5);
        }

        #[tokio::test]
        async fn red_team_denied_calls_consume_neither_tokens_nor_quota() {
            let (gateway, _) = gateway_with_echo();
            gateway
                .set_permission(Permission::new("echo").with_roles(["admin"]), ADMIN)
                .await
                .unwrap();
            gateway.set_quota("alice", 1, QuotaPeriod::Day, ADMIN).await.unwrap();

            for _ in 0..10 {
                gateway.execute("echo", json!({}), ALICE).await;
            }

            assert!(gateway.limiter().bucket("alice").is_none());
            assert_eq!(gateway.access().quota("alice").unwrap().used, 0);
        }

        #[tokio::test]
        async fn red_team_non_admin_cannot_replace_tool_via_versioning() {
            let mut config = test_config();
            config.registry.allow_versioning = true;
            let (gateway, _) = create_gateway(config);
            gateway
                .register(echo_definition().with_version("1"), echo(), ADMIN)
                .await
                .unwrap();

            let result = gateway
                .register(echo_definition().with_version("2"), failing(), BOB)
                .await;

            assert!(result.is_err());
            assert!(gateway.execute("echo", json!({}), ALICE).await.is_success());
        }

        #[tokio::test]
        async fn red_team_credentials_never_reach_the_audit_log() {
            let (gateway, _) = gateway_with_echo();
            let guess = "sk-live-guessed-secret";

            gateway.execute("echo", json!({}), guess).await;
            gateway.execute("echo", json!({}), ALICE).await;
            gateway.register(echo_definition(), echo(), guess).await.ok();

            let exported = gateway.audit().export_json().to_string();
            assert!(!exported.contains(guess));
            assert!(!exported.contains(ALICE));
        }

        #[tokio::test]
        async fn red_team_unknown_tool_scan_is_rate_limited() {
            let (gateway, _) = create_gateway(test_config());

            for i in 0..5 {
                let response = gateway.execute(&format!("scan_{i}"), json!({}), ALICE).await;
                assert_eq!(response.error().unwrap().kind(), ErrorKind::ToolNotFound);
            }
            let response = gateway.execute("scan_5", json!({}), ALICE).await;
            assert_eq!(response.error().unwrap().kind(), ErrorKind::RateLimitExceeded);
        }
    }

    mod edge_cases {
        use super::*;

        #[tokio::test]
        async fn test_disabled_rate_limit_omits_fields() {
            let mut config = test_config();
            config.rate_limit.enabled = false;
            let (gateway, _) = create_gateway(config);
            gateway.register_builtin(echo_definition(), echo()).unwrap();

            for _ in 0..20 {
                let response = gateway.execute("echo", json!({}), ALICE).await;
                assert!(response.is_success());
                assert!(response.rate_limit.is_none());
            }
        }

        #[tokio::test]
        async fn test_headers_can_be_turned_off() {
            let mut config = test_config();
            config.rate_limit.include_headers = false;
            let (gateway, _) = create_gateway(config);
            gateway.register_builtin(echo_definition(), echo()).unwrap();

            let response = gateway.execute("echo", json!({}), ALICE).await;
            assert!(response.to_json().get("rateLimit").is_none());
        }

        #[tokio::test]
        async fn test_null_params_for_tool_without_parameters() {
            let (gateway, _) = gateway_with_echo();

            let response = gateway.execute("echo", Value::Null, ALICE).await;
            assert_eq!(response.into_result().unwrap(), json!({"echo": null}));
        }

        #[tokio::test]
        async fn test_bearer_prefix_is_accepted() {
            let (gateway, _) = gateway_with_echo();

            let response = gateway.execute("echo", json!({}), &format!("Bearer {ALICE}")).await;
            assert!(response.is_success());
        }

        #[tokio::test]
        async fn test_default_quota_applies_without_explicit_record() {
            let mut config = test_config();
            config.quota.default_limit = Some(1);
            let (gateway, _) = create_gateway(config);
            gateway.register_builtin(echo_definition(), echo()).unwrap();

            assert!(gateway.execute("echo", json!({}), ALICE).await.is_success());
            let response = gateway.execute("echo", json!({}), ALICE).await;
            assert_eq!(response.error().unwrap().kind(), ErrorKind::QuotaExceeded);
        }

        #[tokio::test]
        async fn test_concurrent_calls_each_audited_once() {
            let mut config = test_config();
            config.rate_limit.max_requests = 1000;
            let (gateway, _) = create_gateway(config);
            gateway.register_builtin(echo_definition(), echo()).unwrap();
            let gateway = Arc::new(gateway);

            let tasks: Vec<_> = (0..50)
                .map(|i| {
                    let gateway = gateway.clone();
                    tokio::spawn(async move { gateway.execute("echo", json!({ "i": i }), ALICE).await.is_success() })
                })
                .collect();
            for task in tasks {
                assert!(task.await.unwrap());
            }

            assert_eq!(execute_entries(&gateway).len(), 50);
            assert_eq!(gateway.registry().get("echo").unwrap().usage_count, 50);
        }

        #[tokio::test]
        async fn test_attach_session_without_channel() {
            let (gateway, clock) = gateway_with_echo();
            gateway.open_connection("c1", Some("10.1.1.1".to_string()));

            let session = SessionInfo {
                session_id: "s-1".to_string(),
                established_at: clock.now(),
                algorithm: "AES-256-GCM".to_string(),
                key_id: "k-1".to_string(),
                certificate_valid: true,
                perfect_forward_secrecy: true,
                rotations: 0,
                rotated_at: None,
            };
            assert!(gateway.attach_session("c1", session));
            assert!(!gateway.attach_session("c2", gateway.connections()[0].session.clone().unwrap()));
            assert_eq!(gateway.metrics().secured_connections, 1);
        }
    }
}
