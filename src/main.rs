//! # Zapflow — bulk WhatsApp dispatch server
//!
//! Runs campaigns and number warm-up through one rate-limited, resumable
//! dispatch loop, driven over a small HTTP API.
//!
//! Usage:
//!   zapflow                          # Serve on the configured host/port
//!   zapflow serve --port 8080        # Custom port
//!   zapflow check-config             # Validate the config file and exit
//!   zapflow --config ./zapflow.toml  # Explicit config file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use zapflow_channels::UazapiSender;
use zapflow_core::ZapflowConfig;
use zapflow_scheduler::{DispatchDb, DispatchEngine, EngineSettings};

#[derive(Parser)]
#[command(
    name = "zapflow",
    version,
    about = "📨 Zapflow — rate-limited WhatsApp campaigns and warm-up"
)]
struct Cli {
    /// Config file (default: $ZAPFLOW_CONFIG or ~/.zapflow/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP API and resume interrupted jobs
    Serve {
        /// Override gateway.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override gateway.host
        #[arg(long)]
        host: Option<String>,
    },
    /// Load and validate the configuration, then exit
    CheckConfig,
}

fn init_logging(cli: &Cli) {
    let filter = if cli.verbose {
        "zapflow=debug,zapflow_scheduler=debug,zapflow_channels=debug,zapflow_gateway=debug,tower_http=debug"
    } else {
        "zapflow=info,zapflow_scheduler=info,zapflow_channels=info,zapflow_gateway=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<ZapflowConfig> {
    let config = match &cli.config {
        Some(path) => ZapflowConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ZapflowConfig::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let mut config = load_config(&cli)?;

    match cli.command {
        Some(Command::CheckConfig) => {
            println!("✅ Config OK");
            println!("   database: {}", config.database.resolved_path().display());
            println!("   gateway:  {}:{}", config.gateway.host, config.gateway.port);
            println!("   uazapi:   {}", config.uazapi.base_url);
            println!(
                "   pacing:   {}–{}s, pause {}s every {} sends, tz {}",
                config.dispatch.min_delay_secs,
                config.dispatch.max_delay_secs,
                config.dispatch.pause_duration_secs,
                config.dispatch.pause_after,
                config.dispatch.timezone
            );
            Ok(())
        }
        Some(Command::Serve { port, host }) => {
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(host) = host {
                config.gateway.host = host;
            }
            serve(config).await
        }
        None => serve(config).await,
    }
}

async fn serve(config: ZapflowConfig) -> Result<()> {
    let db_path = config.database.resolved_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db = Arc::new(DispatchDb::open(&db_path)?);
    tracing::info!("🗄️ Database: {}", db_path.display());

    let sender = Arc::new(UazapiSender::new(&config.uazapi)?);
    let settings = EngineSettings::from_config(&config.dispatch)?;
    let engine = DispatchEngine::new(db, sender, settings);

    let stale = engine.reconcile_on_startup()?;
    if stale > 0 {
        tracing::info!(
            "🔄 {} job(s) left running by the previous process ({:?})",
            stale,
            config.dispatch.startup_policy
        );
    }

    zapflow_gateway::start(&config.gateway, engine).await
}
