//! toolgate call command

use crate::demo::{demo_gateway, load_config};
use clap::Args;
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct CallCommand {
    /// Tool to execute
    pub tool: String,

    /// Parameters as a JSON object
    #[arg(short, long, default_value = "{}")]
    pub params: String,

    /// API key or bearer token
    #[arg(short = 'k', long)]
    pub credential: String,

    /// Config file (defaults apply when omitted)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl CallCommand {
    /// Run the call and return the response body
    pub async fn execute(&self) -> anyhow::Result<Value> {
        let params: Value = serde_json::from_str(&self.params)
            .map_err(|e| anyhow::anyhow!("--params is not valid JSON: {e}"))?;
        let gateway = demo_gateway(load_config(self.config.as_deref())?)?;

        let response = gateway.execute(&self.tool, params, &self.credential).await;
        Ok(response.to_json())
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let body = self.execute().await?;
        println!("{}", serde_json::to_string_pretty(&body)?);
        if body["success"] != Value::Bool(true) {
            anyhow::bail!("call failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::USER_KEY;
    use serde_json::json;

    fn call(tool: &str, params: &str, credential: &str) -> CallCommand {
        CallCommand {
            tool: tool.to_string(),
            params: params.to_string(),
            credential: credential.to_string(),
            config: None,
        }
    }

    #[tokio::test]
    async fn test_call_success() {
        let body = call("add", r#"{"a": 1, "b": 2}"#, USER_KEY).execute().await.unwrap();

        assert_eq!(body["success"], json!(true));
        assert_eq!(body["data"]["sum"], json!(3.0));
        assert_eq!(body["rateLimit"]["limit"], json!(60));
    }

    #[tokio::test]
    async fn test_call_with_bad_credential() {
        let body = call("echo", "{}", "nope").execute().await.unwrap();

        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"]["kind"], json!("authentication-failed"));
    }

    #[tokio::test]
    async fn test_invalid_params_json() {
        let err = call("echo", "{not json", USER_KEY).execute().await.unwrap_err();
        assert!(err.to_string().contains("--params"));
    }
}
