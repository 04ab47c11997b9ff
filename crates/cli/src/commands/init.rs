//! toolgate init command

use clap::Args;
use console::style;
use dialoguer::Confirm;
use shared::GatewayConfig;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "toolgate.yaml";

#[derive(Debug, Args)]
pub struct InitCommand {
    /// Directory to initialize
    #[arg(default_value = ".")]
    pub directory: PathBuf,

    /// Overwrite an existing config without asking
    #[arg(long)]
    pub force: bool,
}

impl InitCommand {
    pub fn run(&self) -> anyhow::Result<()> {
        let target = self.directory.join(CONFIG_FILE);

        let overwrite = self.force
            || !target.exists()
            || Confirm::new()
                .with_prompt(format!("{} exists. Overwrite?", target.display()))
                .default(false)
                .interact()?;

        match write_default_config(&self.directory, overwrite)? {
            Some(path) => println!("{} Wrote {}", style("✓").green(), path.display()),
            None => println!("Left {} unchanged", target.display()),
        }
        Ok(())
    }
}

/// Write the default configuration into `dir`.
///
/// Returns `None` when the file already exists and `overwrite` is false.
pub fn write_default_config(dir: &Path, overwrite: bool) -> anyhow::Result<Option<PathBuf>> {
    let target = dir.join(CONFIG_FILE);
    if target.exists() && !overwrite {
        return Ok(None);
    }

    std::fs::create_dir_all(dir)?;
    std::fs::write(&target, GatewayConfig::default().to_yaml()?)?;
    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_written_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();

        let path = write_default_config(dir.path(), false).unwrap().unwrap();

        assert_eq!(GatewayConfig::from_file(&path).unwrap(), GatewayConfig::default());
    }

    #[test]
    fn test_existing_config_is_kept_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "adminRoles: [ops]\n").unwrap();

        assert!(write_default_config(dir.path(), false).unwrap().is_none());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "adminRoles: [ops]\n");

        assert!(write_default_config(dir.path(), true).unwrap().is_some());
        assert_ne!(std::fs::read_to_string(&path).unwrap(), "adminRoles: [ops]\n");
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");

        assert!(write_default_config(&nested, false).unwrap().is_some());
        assert!(nested.join(CONFIG_FILE).exists());
    }
}
