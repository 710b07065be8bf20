use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lbmap_maps::LbMapConfig;
use log::debug;
use std::path::PathBuf;

mod commands;
mod utils;

/// Load-balancer map tool
#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Sets the level of verbosity
    #[clap(short, long, global = true)]
    verbose: bool,

    /// Configuration file (TOML)
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory the maps are pinned under (overrides the configuration)
    #[clap(long, global = true)]
    pin_root: Option<PathBuf>,

    /// Subcommand to execute
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and edit the session-affinity match map
    Affinity {
        #[clap(subcommand)]
        cmd: AffinityCommands,
    },

    /// Print the record layouts shared with the datapath
    Layout,
}

#[derive(Subcommand)]
pub enum AffinityCommands {
    /// Show all bindings
    List,

    /// Mark a backend as active for a service
    Bind {
        /// Backend ID
        backend: u32,

        /// Reverse-NAT ID of the service
        rev_nat: u16,
    },

    /// Remove a binding
    Unbind {
        /// Backend ID
        backend: u32,

        /// Reverse-NAT ID of the service
        rev_nat: u16,
    },

    /// Remove every binding
    Flush,

    /// Remove every binding not listed
    Gc {
        /// Bindings to keep, as BACKEND:REVNAT
        keep: Vec<String>,
    },

    /// Show table counters
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if cli.verbose { "debug" } else { "info" }
    )).init();

    // Execute the specified command
    match cli.command {
        Commands::Affinity { cmd } => {
            let config = load_config(cli.config, cli.pin_root)?;
            commands::affinity::handle_command(cmd, &config).await?;
        }
        Commands::Layout => {
            commands::layout::show_layouts()?;
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>, pin_root: Option<PathBuf>) -> Result<LbMapConfig> {
    let mut config = LbMapConfig::load(path.as_deref()).context("Failed to load configuration")?;
    if let Some(pin_root) = pin_root {
        config.pin_root = pin_root;
    }
    debug!("Using configuration: {:?}", config);
    Ok(config)
}
