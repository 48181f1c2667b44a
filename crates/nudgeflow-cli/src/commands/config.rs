/// Configuration management command handlers
use anyhow::{Context, Result};
use clap::Subcommand;
use nudgeflow_core::config::config_path;
use nudgeflow_core::EngineConfig;
use std::path::Path;

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the configuration file location
    Path,
    /// Print the effective configuration
    Show,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

pub fn handle_config_command(action: &ConfigAction) -> Result<()> {
    let path = config_path()?;
    match action {
        ConfigAction::Path => {
            println!("{}", path.display());
            Ok(())
        }
        ConfigAction::Show => show_config(&path),
        ConfigAction::Init { force } => init_config(&path, *force),
    }
}

fn show_config(path: &Path) -> Result<()> {
    let config = EngineConfig::load_or_default(path)?;
    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    if !path.exists() {
        println!("# {} does not exist, showing defaults", path.display());
    }
    println!("{rendered}");
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists. Use --force to overwrite it.",
            path.display()
        );
    }
    EngineConfig::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}
