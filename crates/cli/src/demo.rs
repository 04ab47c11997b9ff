//! In-process demo gateway used by `call`, `channel demo` and the REPL

use gateway::{ApiKeyAuthenticator, Authenticator, ChainAuthenticator, FnTool, Gateway, JwtAuthenticator, JwtSettings};
use serde_json::{json, Value};
use shared::{GatewayConfig, ParameterSpec, ToolDefinition, ToolError};
use std::path::Path;
use std::sync::Arc;

/// API key of the demo administrator (`root`, role `admin`)
pub const ADMIN_KEY: &str = "demo-admin-key";
/// API key of the demo user (`demo`, role `user`)
pub const USER_KEY: &str = "demo-user-key";
/// When set, HS256 tokens signed with this secret are accepted too
pub const JWT_SECRET_ENV: &str = "TOOLGATE_JWT_SECRET";

/// Load `path` if given, otherwise the defaults
pub fn load_config(path: Option<&Path>) -> anyhow::Result<GatewayConfig> {
    match path {
        Some(path) => Ok(GatewayConfig::from_file(path)?),
        None => Ok(GatewayConfig::default()),
    }
}

fn demo_authenticator() -> Arc<dyn Authenticator> {
    let keys = ApiKeyAuthenticator::new()
        .with_key(ADMIN_KEY, "root", ["admin"])
        .with_key(USER_KEY, "demo", ["user"]);

    match std::env::var(JWT_SECRET_ENV) {
        Ok(secret) if !secret.is_empty() => Arc::new(
            ChainAuthenticator::new()
                .with(keys)
                .with(JwtAuthenticator::new(JwtSettings::new(secret))),
        ),
        _ => Arc::new(keys),
    }
}

/// Gateway preloaded with the demo tools
pub fn demo_gateway(config: GatewayConfig) -> anyhow::Result<Gateway> {
    let gateway = Gateway::new(config, demo_authenticator())?;

    gateway.register_builtin(
        ToolDefinition::new("echo", "Return the parameters unchanged").with_category("util"),
        Arc::new(FnTool::new(|params: Value| async move { Ok(params) })),
    )?;

    gateway.register_builtin(
        ToolDefinition::new("add", "Add two numbers")
            .with_category("math")
            .with_parameter("a", ParameterSpec::new("number", "First addend").required())
            .with_parameter("b", ParameterSpec::new("number", "Second addend").required()),
        Arc::new(FnTool::new(|params: Value| async move {
            let a = params["a"].as_f64().unwrap_or_default();
            let b = params["b"].as_f64().unwrap_or_default();
            Ok(json!({ "sum": a + b }))
        })),
    )?;

    gateway.register_builtin(
        ToolDefinition::new("time", "Current UTC time").with_category("util"),
        Arc::new(FnTool::new(|_params: Value| async move {
            Ok(json!({ "now": chrono::Utc::now().to_rfc3339() }))
        })),
    )?;

    gateway.register_builtin(
        ToolDefinition::new("fail", "Always fails with the given message")
            .with_category("util")
            .with_parameter("message", ParameterSpec::new("string", "Error message")),
        Arc::new(FnTool::new(|params: Value| async move {
            let message = params["message"].as_str().unwrap_or("requested failure").to_string();
            Err::<Value, _>(ToolError::new(message).with_code("DEMO_FAILURE"))
        })),
    )?;

    Ok(gateway)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_tools_are_registered() {
        let gateway = demo_gateway(GatewayConfig::default()).unwrap();

        let names: Vec<_> = gateway.registry().list().into_iter().map(|t| t.definition.name).collect();
        assert_eq!(names, vec!["add", "echo", "fail", "time"]);
    }

    #[tokio::test]
    async fn test_demo_add() {
        let gateway = demo_gateway(GatewayConfig::default()).unwrap();

        let response = gateway.execute("add", json!({"a": 2, "b": 3.5}), USER_KEY).await;
        assert_eq!(response.into_result().unwrap(), json!({"sum": 5.5}));
    }

    #[tokio::test]
    async fn test_demo_fail_keeps_message() {
        let gateway = demo_gateway(GatewayConfig::default()).unwrap();

        let response = gateway.execute("fail", json!({"message": "boom"}), USER_KEY).await;
        let body = response.to_json();
        assert_eq!(body["error"]["message"], json!("boom"));
        assert_eq!(body["error"]["code"], json!("DEMO_FAILURE"));
    }

    #[test]
    fn test_load_config_defaults_without_path() {
        assert_eq!(load_config(None).unwrap(), GatewayConfig::default());
    }
}
