//! crashlens - privacy-first crash telemetry with AI-assisted analysis
//!
//! One process runs the ingestion gateway (HTTP) and a pool of analysis
//! workers fed by a durable in-memory queue.
//!
//! Exit codes:
//!   0 - Clean shutdown
//!   1 - Startup or runtime error (config, bind failure, bad event file, etc.)

mod app;
mod cli;
mod config;
mod consensus;
mod error;
mod gateway;
mod models;
mod notify;
mod queue;
mod redact;
mod router;
mod server;
mod store;
mod worker;

use anyhow::{Context, Result};
use cli::Args;
use config::Config;
use models::RawEvent;
use redact::Redactor;
use std::path::Path;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    init_logging(&args);

    info!("crashlens v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    if let Err(e) = run(args).await {
        error!("crashlens failed: {:#}", e);
        eprintln!("\n❌ Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

/// Handle --init-config: generate a default crashlens.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(config::DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            config::DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", config::DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", config::DEFAULT_CONFIG_FILE);
    println!("   Add [[credentials]] entries before accepting traffic.");
    Ok(())
}

/// Initialize logging. `RUST_LOG` wins over the verbosity flags when set.
fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level().to_string().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);
    config.validate().context("Invalid configuration")?;

    if let Some(ref path) = args.scrub {
        return scrub_file(&config, path);
    }

    info!(
        "Starting with {} providers, {} workers, consensus {}",
        config.providers.len(),
        config.worker.concurrency,
        if config.consensus.enabled { "on" } else { "off" }
    );
    app::serve(config).await
}

/// Handle --scrub: run the producer-side redactor over a raw event file.
fn scrub_file(config: &Config, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read event file: {}", path.display()))?;
    let event: RawEvent = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse event file: {}", path.display()))?;

    let redactor = Redactor::from_config(&config.redaction).context("Failed to load redaction rules")?;
    let scrubbed = redactor.scrub_event(&event);
    println!("{}", serde_json::to_string_pretty(&scrubbed)?);
    Ok(())
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", config::DEFAULT_CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}
