//! toolgate channel command

use crate::demo::{demo_gateway, load_config, USER_KEY};
use channel::{close_code, memory_pair, EncryptedChannel, MetricsSnapshot, Role, SessionInfo};
use clap::{Args, Subcommand};
use console::style;
use serde_json::{json, Value};
use shared::system_clock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Args)]
pub struct ChannelCommand {
    #[command(subcommand)]
    pub command: ChannelSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum ChannelSubcommand {
    /// Call the demo gateway over a loopback encrypted channel
    Demo {
        /// Number of calls to make
        #[arg(short, long, default_value_t = 3)]
        messages: usize,

        /// Rotate the session key after every call
        #[arg(long)]
        rotate: bool,

        /// Config file (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// What a demo run observed
#[derive(Debug)]
pub struct DemoReport {
    pub session: Option<Arc<SessionInfo>>,
    pub replies: Vec<Value>,
    pub client_metrics: MetricsSnapshot,
}

impl ChannelCommand {
    pub async fn run(&self) -> anyhow::Result<()> {
        let ChannelSubcommand::Demo {
            messages,
            rotate,
            config,
        } = &self.command;

        let report = run_demo(config.clone(), *messages, *rotate).await?;

        if let Some(session) = &report.session {
            println!("{}", style("Session").bold());
            println!("{}", serde_json::to_string_pretty(session.as_ref())?);
        }
        println!("{}", style("Replies").bold());
        for reply in &report.replies {
            println!("  {reply}");
        }
        println!("{}", style("Client metrics").bold());
        println!("{}", serde_json::to_string_pretty(&report.client_metrics)?);
        Ok(())
    }
}

/// Serve the demo gateway over an in-memory transport and drive it from a client channel
pub async fn run_demo(config: Option<PathBuf>, messages: usize, rotate: bool) -> anyhow::Result<DemoReport> {
    let config = load_config(config.as_deref())?;
    let mut client_config = config.encryption.clone();
    // Rotation is driven manually in the demo
    client_config.rotation_interval_secs = 0;

    let gateway = Arc::new(demo_gateway(config)?);
    let (client_side, server_side) = memory_pair();
    let (client, served) = tokio::join!(
        EncryptedChannel::open(client_side, Role::Initiator, client_config, system_clock()),
        gateway.accept("demo-client", server_side, Some("loopback".to_string())),
    );
    let client = client?;
    let served = served?;
    let session = client.session_info();

    let mut replies = Vec::with_capacity(messages);
    for i in 0..messages {
        client
            .send_json(&json!({
                "id": i,
                "tool": "add",
                "params": { "a": i, "b": 1 },
                "credential": USER_KEY,
            }))
            .await?;

        let bytes = tokio::time::timeout(REPLY_TIMEOUT, client.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("channel closed before reply {i}"))?;
        replies.push(serde_json::from_slice(&bytes)?);

        if rotate {
            let key_id = client.rotate_key().await?;
            tracing::info!(key_id = %key_id, "rotated session key");
        }
    }

    client.close(close_code::NORMAL, "demo finished").await;
    tokio::time::timeout(REPLY_TIMEOUT, served).await??;
    gateway.destroy().await;

    Ok(DemoReport {
        session,
        replies,
        client_metrics: client.metrics(),
    })
}
