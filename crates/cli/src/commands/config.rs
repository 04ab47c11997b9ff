//! toolgate config command

use clap::{Args, Subcommand};
use console::style;
use shared::GatewayConfig;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigSubcommand {
    /// Load and validate a config file, then print the effective settings
    Check {
        /// YAML or JSON config file
        path: PathBuf,
    },
    /// Print the default configuration
    Defaults,
}

impl ConfigCommand {
    pub fn run(&self) -> anyhow::Result<()> {
        match &self.command {
            ConfigSubcommand::Check { path } => {
                let config = GatewayConfig::from_file(path)?;
                println!("{} {} is valid", style("✓").green(), path.display());
                println!();
                print!("{}", config.to_yaml()?);
            }
            ConfigSubcommand::Defaults => {
                print!("{}", GatewayConfig::default().to_yaml()?);
            }
        }
        Ok(())
    }
}
