//! CLI configuration management.
//!
//! ```text
//! Cli
//! ├── postgres: PgConfig          # URL, deployment context, resilience overrides
//! ├── lifecycle: LifecycleConfig  # status reporting, shutdown timeout
//! └── check: bool                 # one-shot connectivity check
//! ```
//!
//! All configuration can be provided via CLI arguments or environment variables.
//! Use `--help` to see all available options.

mod lifecycle;

use std::process;

use anyhow::Context;
use clap::Parser;
use keel_postgres::PgConfig;
pub use lifecycle::LifecycleConfig;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::{TRACING_TARGET_CONFIG, TRACING_TARGET_STARTUP};

/// Complete CLI configuration.
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(name = "keel")]
#[command(about = "Resilient PostgreSQL access layer process")]
#[command(version)]
pub struct Cli {
    /// Database connection and resilience configuration.
    #[clap(flatten)]
    pub postgres: PgConfig,

    /// Process lifecycle configuration.
    #[clap(flatten)]
    pub lifecycle: LifecycleConfig,

    /// Connect, run a single probe query and exit.
    #[arg(long)]
    #[serde(default)]
    pub check: bool,
}

impl Cli {
    /// Loads environment variables from .env file (if enabled) and parses CLI arguments.
    ///
    /// The .env file is loaded before clap parses arguments, so its values act
    /// as environment defaults.
    pub fn init() -> Self {
        Self::load_dotenv();
        Self::parse()
    }

    /// Loads environment variables from .env file if the dotenv feature is enabled.
    #[cfg(feature = "dotenv")]
    fn load_dotenv() {
        if let Err(err) = dotenvy::dotenv()
            && !err.not_found()
        {
            eprintln!("Warning: failed to load .env file: {err}");
        }
    }

    /// No-op when dotenv feature is disabled.
    #[cfg(not(feature = "dotenv"))]
    fn load_dotenv() {}

    /// Initializes tracing with environment-based filtering.
    pub fn init_tracing() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    /// Validates all configuration values.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.postgres
            .validate()
            .context("invalid database configuration")?;
        self.lifecycle
            .validate()
            .context("invalid lifecycle configuration")?;
        Ok(())
    }

    /// Logs configuration (no sensitive information).
    pub fn log(&self) {
        tracing::debug!(
            target: TRACING_TARGET_STARTUP,
            version = env!("CARGO_PKG_VERSION"),
            pid = process::id(),
            arch = std::env::consts::ARCH,
            os = std::env::consts::OS,
            features = ?Self::enabled_features(),
            "Build information"
        );

        let pool_config = self.postgres.pool_config();
        tracing::info!(
            target: TRACING_TARGET_CONFIG,
            database_url = %self.postgres.database_url_masked(),
            deployment = %self.postgres.deployment(),
            max_connections = pool_config.max_connections,
            min_connections = pool_config.min_connections,
            query_timeout_secs = pool_config.query_timeout.as_secs(),
            max_retries = self.postgres.retry_policy().max_retries,
            "Database configuration"
        );

        self.lifecycle.log();
    }

    /// Returns a list of enabled compile-time features.
    fn enabled_features() -> Vec<&'static str> {
        [cfg!(feature = "dotenv").then_some("dotenv")]
            .into_iter()
            .flatten()
            .collect()
    }
}
