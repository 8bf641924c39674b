//! Logging callbacks and hooks installed on the [`diesel`] / [`deadpool`] pool.
//!
//! None of these hooks reject a connection. Broken connections are left for
//! deadpool's recycle check to discard; the hooks only make that visible.

use std::time::Instant;

use deadpool::managed::{HookResult, Metrics};
use diesel::ConnectionResult;
use diesel_async::pooled_connection::{PoolError, PoolableConnection};
use diesel_async::{AsyncConnection, AsyncPgConnection};
use futures::FutureExt;
use futures::future::BoxFuture;

use super::mask_url;
use crate::TRACING_TARGET_CLIENT;

/// Establishes a new physical connection, logging its outcome and latency.
///
/// See [`ManagerConfig`] and [`SetupCallback`] for more details.
///
/// [`ManagerConfig`]: diesel_async::pooled_connection::ManagerConfig
/// [`SetupCallback`]: diesel_async::pooled_connection::SetupCallback
pub fn setup_callback<C>(addr: &str) -> BoxFuture<'_, ConnectionResult<C>>
where
    C: AsyncConnection + 'static,
{
    let start = Instant::now();
    let masked_addr = mask_url(addr);

    tracing::debug!(
        target: TRACING_TARGET_CLIENT,
        hook = "setup_callback",
        addr = %masked_addr,
        "Opening physical connection"
    );

    async move {
        let result = C::establish(addr).await;
        let elapsed_ms = start.elapsed().as_millis();

        match &result {
            Ok(_) => tracing::debug!(
                target: TRACING_TARGET_CLIENT,
                hook = "setup_callback",
                addr = %masked_addr,
                elapsed_ms,
                "Physical connection opened"
            ),
            Err(err) => tracing::warn!(
                target: TRACING_TARGET_CLIENT,
                hook = "setup_callback",
                addr = %masked_addr,
                elapsed_ms,
                error = %err,
                "Failed to open physical connection"
            ),
        }

        result
    }
    .boxed()
}

/// Runs after a connection has been created and added to the pool.
///
/// See [`PoolBuilder`] for more details.
///
/// [`PoolBuilder`]: deadpool::managed::PoolBuilder
pub fn post_create(conn: &mut AsyncPgConnection, metrics: &Metrics) -> HookResult<PoolError> {
    let is_broken = conn.is_broken();

    if is_broken {
        tracing::warn!(
            target: TRACING_TARGET_CLIENT,
            hook = "post_create",
            created_at = ?metrics.created,
            "Connection is broken right after creation"
        );
    } else {
        tracing::trace!(
            target: TRACING_TARGET_CLIENT,
            hook = "post_create",
            created_at = ?metrics.created,
            "Connection added to pool"
        );
    }

    Ok(())
}

/// Runs after a connection has passed deadpool's recycle check.
///
/// See [`PoolBuilder`] for more details.
///
/// [`PoolBuilder`]: deadpool::managed::PoolBuilder
pub fn post_recycle(conn: &mut AsyncPgConnection, metrics: &Metrics) -> HookResult<PoolError> {
    if conn.is_broken() {
        tracing::warn!(
            target: TRACING_TARGET_CLIENT,
            hook = "post_recycle",
            recycle_count = metrics.recycle_count,
            "Recycled connection reports itself broken"
        );
    } else {
        tracing::trace!(
            target: TRACING_TARGET_CLIENT,
            hook = "post_recycle",
            recycle_count = metrics.recycle_count,
            last_used_ms = metrics.last_used().as_millis(),
            "Connection recycled"
        );
    }

    Ok(())
}
