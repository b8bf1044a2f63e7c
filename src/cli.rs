//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use std::path::PathBuf;

/// crashlens - privacy-first crash telemetry with AI-assisted analysis
///
/// Runs the ingestion gateway and the analysis workers in one process.
/// Events are scrubbed before they are stored, analyzed by a tiered set
/// of LLM providers, and alerts go out for severe results.
///
/// Examples:
///   crashlens
///   crashlens --config crashlens.toml --bind 0.0.0.0:8080
///   crashlens --workers 8 --verbose
///   crashlens --scrub event.json
///   crashlens --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Path to configuration file
    ///
    /// If not specified, looks for crashlens.toml in the current directory
    #[arg(short, long, value_name = "FILE", env = "CRASHLENS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address the gateway listens on (overrides server.bind)
    #[arg(short, long, value_name = "ADDR", env = "CRASHLENS_BIND")]
    pub bind: Option<String>,

    /// Number of analysis workers (overrides worker.concurrency)
    #[arg(short, long, value_name = "NUM")]
    pub workers: Option<usize>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Scrub a raw event JSON file, print the result and exit
    ///
    /// Useful to check redaction rules before deploying them.
    #[arg(long, value_name = "FILE", conflicts_with = "init_config")]
    pub scrub: Option<PathBuf>,

    /// Generate a default crashlens.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config {
            return Ok(());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.workers == Some(0) {
            return Err("Workers must be at least 1".to_string());
        }

        if let Some(ref bind) = self.bind {
            if !bind.contains(':') {
                return Err(format!("Bind address must be host:port, got '{}'", bind));
            }
        }

        if let Some(ref path) = self.scrub {
            if !path.is_file() {
                return Err(format!("Event file does not exist: {}", path.display()));
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
