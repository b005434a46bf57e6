//! Chorus - Multi-Entity Conversation Orchestration
//!
//! Command-line entry point: run scripted sessions against the configured
//! generation provider and inspect the text pipeline and configuration.

mod cli;

use anyhow::Result;
use chorus_core::ChorusConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser)]
#[command(name = "chorus")]
#[command(about = "Multi-entity conversation orchestration", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Configuration file (TOML); CHORUS__SECTION__FIELD variables override it
    #[arg(short, long, env = "CHORUS_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a scripted session (humans, entities, rooms, messages)
    Run {
        /// Session script (TOML)
        #[arg(short, long)]
        script: PathBuf,
    },

    /// Extract keywords from text
    Keywords {
        /// Text to analyse
        text: String,

        /// Maximum number of keywords to print
        #[arg(short, long)]
        max: Option<usize>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // RUST_LOG wins when set; otherwise our crates at the requested level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level.as_str().to_lowercase();
        EnvFilter::new(format!("chorus={},chorus_core={},reqwest=warn", level, level))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    debug!("Chorus v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = ChorusConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { script } => cli::run::handle(config, &script).await,
        Commands::Keywords { text, max } => cli::keywords::handle(&config, &text, max),
        Commands::Config => cli::config::handle(&config),
    }
}
