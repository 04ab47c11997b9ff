//! Toolgate CLI - Command-line interface for the tool gateway
//!
//! Usage:
//!   toolgate                          - Start interactive mode
//!   toolgate init [dir]               - Write a default toolgate.yaml
//!   toolgate config check <path>      - Validate a config file
//!   toolgate call <tool> -k <key>     - Execute one tool call
//!   toolgate channel demo             - Encrypted channel loopback demo

use clap::{Parser, Subcommand};
use cli::commands::{CallCommand, ChannelCommand, ConfigCommand, InitCommand};
use cli::demo::{demo_gateway, load_config};
use cli::interactive::InteractiveCli;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "toolgate")]
#[command(about = "Toolgate - authenticated, rate-limited tool execution gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file for interactive mode
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init(InitCommand),
    /// Inspect configuration
    Config(ConfigCommand),
    /// Execute a tool against the demo gateway
    Call(CallCommand),
    /// Encrypted channel utilities
    Channel(ChannelCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init(cmd)) => cmd.run(),
        Some(Commands::Config(cmd)) => cmd.run(),
        Some(Commands::Call(cmd)) => cmd.run().await,
        Some(Commands::Channel(cmd)) => cmd.run().await,
        None => {
            let gateway = demo_gateway(load_config(cli.config.as_deref())?)?;
            gateway.initialize()?;
            let mut interactive = InteractiveCli::new(gateway);
            interactive.run().await
        }
    }
}
