#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod config;
mod lifecycle;

use std::process;

use anyhow::Context;

use crate::config::Cli;

// Tracing target constants
pub const TRACING_TARGET_STARTUP: &str = "keel_cli::startup";
pub const TRACING_TARGET_SHUTDOWN: &str = "keel_cli::shutdown";
pub const TRACING_TARGET_CONFIG: &str = "keel_cli::config";
pub const TRACING_TARGET_STATUS: &str = "keel_cli::status";

#[tokio::main]
async fn main() {
    let Err(error) = run().await else {
        tracing::info!(
            target: TRACING_TARGET_SHUTDOWN,
            "application terminated successfully"
        );
        process::exit(0);
    };

    if tracing::enabled!(tracing::Level::ERROR) {
        tracing::error!(
            target: TRACING_TARGET_SHUTDOWN,
            error = %format!("{error:#}"),
            "application terminated with error"
        );
    } else {
        eprintln!("Error: {error:#}");
    }

    process::exit(1);
}

/// Main application entry point.
async fn run() -> anyhow::Result<()> {
    let cli = Cli::init();

    Cli::init_tracing();
    cli.log();
    cli.validate()?;

    let manager = cli
        .postgres
        .clone()
        .build()
        .context("failed to create connection manager")?;

    if cli.check {
        return lifecycle::run_check(&manager).await;
    }

    lifecycle::run_until_shutdown(manager, &cli.lifecycle).await
}
