//! Process lifecycle around the connection manager.
//!
//! Startup connects in the background, a reporter logs the database status
//! while the process runs, and a termination signal triggers a graceful
//! shutdown bounded by the configured timeout.

mod shutdown;
mod status;

use std::time::Instant;

use anyhow::{Context, anyhow};
use keel_postgres::{ConnectionManager, PgDriver, QueryOptions};
use tokio_util::sync::CancellationToken;

use self::shutdown::wait_for_signal;
use crate::config::LifecycleConfig;
use crate::{TRACING_TARGET_SHUTDOWN, TRACING_TARGET_STARTUP};

/// Runs until SIGINT or SIGTERM, then shuts the manager down.
///
/// # Errors
///
/// Returns an error if graceful shutdown does not finish within the
/// configured timeout.
pub async fn run_until_shutdown(
    manager: ConnectionManager<PgDriver>,
    config: &LifecycleConfig,
) -> anyhow::Result<()> {
    let start_time = Instant::now();

    tracing::info!(
        target: TRACING_TARGET_STARTUP,
        client = ?manager.client(),
        "Starting database connection in the background"
    );
    // The outcome is logged by the manager; a failed startup connect is
    // retried by the first query.
    drop(manager.connect_in_background());

    let cancel = CancellationToken::new();
    let reporter = config
        .status_interval()
        .map(|interval| status::spawn_reporter(manager.clone(), interval, cancel.clone()));

    let signal = wait_for_signal().await;

    let shutdown_timeout = config.shutdown_timeout();
    tracing::info!(
        target: TRACING_TARGET_SHUTDOWN,
        signal = signal.as_str(),
        timeout_secs = shutdown_timeout.as_secs(),
        "Graceful shutdown initiated"
    );

    cancel.cancel();
    if let Some(reporter) = reporter {
        status::join_reporter(reporter).await;
    }

    if tokio::time::timeout(shutdown_timeout, manager.disconnect_gracefully())
        .await
        .is_err()
    {
        tracing::error!(
            target: TRACING_TARGET_SHUTDOWN,
            timeout_secs = shutdown_timeout.as_secs(),
            "Graceful shutdown timed out"
        );
        return Err(anyhow!(
            "graceful shutdown did not finish within {} seconds",
            shutdown_timeout.as_secs()
        ));
    }

    status::report(&manager.health_status(), None);
    tracing::info!(
        target: TRACING_TARGET_SHUTDOWN,
        uptime_secs = start_time.elapsed().as_secs(),
        "Shutdown completed"
    );
    Ok(())
}

/// Connects, runs one probe query through the executor and disconnects.
///
/// # Errors
///
/// Returns an error if the database cannot be reached or the probe fails.
pub async fn run_check(manager: &ConnectionManager<PgDriver>) -> anyhow::Result<()> {
    let result = check(manager).await;
    manager.disconnect_gracefully().await;
    result
}

async fn check(manager: &ConnectionManager<PgDriver>) -> anyhow::Result<()> {
    manager
        .connect()
        .await
        .context("failed to connect to database")?;

    let latency = manager
        .run_query(
            |client| async move { client.ping().await },
            QueryOptions::new().with_label("check"),
        )
        .await
        .context("probe query failed")?;

    let pool = manager.current_handle().ok().map(|client| client.pool_status());
    status::report(&manager.health_status(), pool.as_ref());
    tracing::info!(
        target: TRACING_TARGET_STARTUP,
        latency_ms = latency.as_millis(),
        "Database check passed"
    );
    Ok(())
}
