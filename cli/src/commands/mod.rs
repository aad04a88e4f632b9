//! CLI command definitions and dispatch.

mod login;
mod logout;
mod pull;
mod save;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use imgflow_core::config::{EngineConfig, LogLevel};
use imgflow_runtime::ImageRuntime;

/// imgflow - pull and save container images.
#[derive(Parser)]
#[command(name = "imgflow", version, about)]
pub struct Cli {
    /// Configuration file (default: ~/.imgflow/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Root directory of the image store
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Pull an image into the local store
    Pull(pull::PullArgs),
    /// Save one or more images to a directory or archive
    Save(save::SaveArgs),
    /// Log in to a registry
    Login(login::LoginArgs),
    /// Log out from a registry
    Logout(logout::LogoutArgs),
}

/// Load the engine configuration, applying command-line overrides.
pub(crate) fn load_config(cli: &Cli) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let path = cli.config.clone().unwrap_or_else(EngineConfig::default_path);
    let mut config = if cli.config.is_some() {
        EngineConfig::load(&path)?
    } else {
        EngineConfig::load_or_default(&path)?
    };
    if let Some(root) = &cli.root {
        config.store_root = root.clone();
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    Ok(config)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&cli)?;
    tracing::debug!(store_root = %config.store_root.display(), "Configuration loaded");

    match cli.command {
        Command::Pull(args) => pull::execute(args, &ImageRuntime::from_config(&config)?).await,
        Command::Save(args) => save::execute(args, &ImageRuntime::from_config(&config)?).await,
        Command::Login(args) => login::execute(args, &config).await,
        Command::Logout(args) => logout::execute(args, &config).await,
    }
}
