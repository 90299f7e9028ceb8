use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod refresh;
pub mod reset;
pub mod status;

use config::{default_config_path, default_state_path, CdsConfig};

#[derive(Parser)]
#[command(name = "cds-sync")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operator CLI for the contact discovery sync engine", long_about = None)]
pub struct Cli {
    /// Path to config file (default: ~/.local/share/cds-sync/config.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the persisted confirmed set and token fingerprint
    Status,

    /// Clear the persisted discovery state (next refresh is a cold start)
    Reset {
        /// Skip confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },

    /// Dry-run a refresh against a JSON fixture
    Refresh {
        /// Fixture describing local recipients, contacts and the simulated directory
        #[arg(long)]
        fixture: String,

        /// Recipient ids to refresh (omit to refresh everything)
        #[arg(long = "target")]
        targets: Vec<i64>,

        /// Dry-run state file (default: next to the configured state, `*.dry-run.json`)
        #[arg(long)]
        state: Option<String>,
    },

    /// Write a commented default config file
    InitConfig {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Status => status::execute(&setup(&config_path)?).await,
        Commands::Reset { yes } => reset::execute(&setup(&config_path)?, yes).await,
        Commands::Refresh {
            fixture,
            targets,
            state,
        } => refresh::execute(&setup(&config_path)?, fixture, targets, state).await,
        Commands::InitConfig { force } => init_config(&config_path, force),
    }
}

/// Load the operator config and install logging
fn setup(config_path: &Path) -> Result<CdsConfig, Box<dyn std::error::Error>> {
    let config = CdsConfig::load_or_default(config_path)?;
    init_logging(&config)?;
    Ok(config)
}

fn init_config(config_path: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    if config_path.exists() && !force {
        return Err(format!(
            "Config file '{}' already exists (use --force to overwrite)",
            config_path.display()
        )
        .into());
    }

    CdsConfig::create_default(config_path, &default_state_path())?;
    println!("✅ Wrote default config to {}", config_path.display());
    Ok(())
}

/// Install the tracing subscriber. `RUST_LOG` wins over the configured level.
fn init_logging(config: &CdsConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .map_err(|e| format!("Invalid log level '{}': {}", config.logging.level, e))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("Failed to open log file '{}': {}", path.display(), e))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|e| format!("Failed to initialize logging: {}", e))?;
        }
        None => {
            builder
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| format!("Failed to initialize logging: {}", e))?;
        }
    }

    Ok(())
}
