//! Responses and reports produced by the gateway

use audit::{AuditStats, LimiterMetrics, RateLimitDecision};
use rbac::RegistryStats;
use serde::Serialize;
use serde_json::{json, Map, Value};
use shared::{GatewayError, Result};

/// Outcome of one `execute` call
#[derive(Debug)]
pub struct ExecuteResponse {
    pub result: Result<Value>,
    /// Rate-limit standing of the caller, when known and enabled
    pub rate_limit: Option<RateLimitDecision>,
}

impl ExecuteResponse {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<&GatewayError> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<Value> {
        self.result
    }

    /// Wire form: `{success, data?, error?, rateLimit?}`
    pub fn to_json(&self) -> Value {
        let mut body = Map::new();
        body.insert("success".to_string(), Value::Bool(self.is_success()));

        match &self.result {
            Ok(data) => {
                body.insert("data".to_string(), data.clone());
            }
            Err(err) => {
                body.insert("error".to_string(), error_json(err));
            }
        }

        if let Some(decision) = &self.rate_limit {
            body.insert("rateLimit".to_string(), rate_limit_json(decision));
        }
        Value::Object(body)
    }
}

fn error_json(err: &GatewayError) -> Value {
    let mut error = json!({
        "kind": err.kind(),
        "message": err.to_string(),
    });

    if let Some(retry_after) = err.retry_after_secs() {
        error["retryAfter"] = json!(retry_after);
    }
    match err {
        GatewayError::ValidationFailed { issues } => {
            error["issues"] = json!(issues);
        }
        GatewayError::QuotaExceeded { limit, used, reset_at, .. } => {
            error["limit"] = json!(limit);
            error["used"] = json!(used);
            error["resetAt"] = json!(reset_at.to_rfc3339());
        }
        GatewayError::Tool(tool_err) => {
            if let Some(code) = &tool_err.code {
                error["code"] = json!(code);
            }
            if let Some(details) = &tool_err.details {
                error["details"] = details.clone();
            }
        }
        _ => {}
    }
    error
}

fn rate_limit_json(decision: &RateLimitDecision) -> Value {
    let mut value = json!({
        "limit": decision.limit,
        "remaining": decision.remaining,
        "resetAt": decision.reset_at.to_rfc3339(),
    });
    if let Some(retry_after) = decision.retry_after_secs {
        value["retryAfter"] = json!(retry_after);
    }
    value
}

/// Liveness summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub uptime_secs: i64,
    pub tools: usize,
    pub active_tools: usize,
    pub connections: usize,
    pub rate_limiting: bool,
    pub maintenance_running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Initialized and serving
    Healthy,
    /// Serving, but `initialize` has not been called (or `destroy` has)
    Degraded,
}

/// Aggregated metrics from every component
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayMetrics {
    pub uptime_secs: i64,
    pub registry: RegistryStats,
    pub rate_limiter: LimiterMetrics,
    pub audit: AuditStats,
    pub connections: usize,
    pub secured_connections: usize,
}
