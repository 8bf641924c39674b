//! Periodic database status reports.

use std::time::Duration;

use keel_postgres::{ConnectionManager, HealthStatus, PgDriver, PgPoolStatus};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::TRACING_TARGET_STATUS;

/// Spawns a task that logs the health record and pool status every `interval`.
///
/// The task ends when `cancel` fires.
pub fn spawn_reporter(
    manager: ConnectionManager<PgDriver>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let pool = manager
                .current_handle()
                .ok()
                .map(|client| client.pool_status());
            report(&manager.health_status(), pool.as_ref());
        }
    })
}

/// Waits for a cancelled reporter to exit and logs it if it panicked.
///
/// Returns whether the reporter exited cleanly.
pub async fn join_reporter(reporter: JoinHandle<()>) -> bool {
    match reporter.await {
        Ok(()) => true,
        Err(err) => {
            if err.is_panic() {
                tracing::error!(
                    target: TRACING_TARGET_STATUS,
                    error = %err,
                    "Status reporter panicked"
                );
            }
            false
        }
    }
}

/// Logs a single status report.
pub fn report(status: &HealthStatus, pool: Option<&PgPoolStatus>) {
    tracing::info!(
        target: TRACING_TARGET_STATUS,
        healthy = status.is_healthy,
        state = %status.state,
        consecutive_failures = status.consecutive_failures,
        total_queries = status.total_queries,
        failed_queries = status.failed_queries,
        average_latency_ms = status.average_latency_ms,
        success_rate_percent = status.success_rate_percent,
        pool_size = pool.map(|p| p.size),
        pool_available = pool.map(|p| p.available),
        pool_waiting = pool.map(|p| p.waiting),
        "Database status"
    );

    if let Some(pool) = pool
        && pool.is_under_pressure()
    {
        tracing::warn!(
            target: TRACING_TARGET_STATUS,
            utilization = pool.utilization(),
            waiting = pool.waiting,
            max_size = pool.max_size,
            "Connection pool under pressure"
        );
    }
}
