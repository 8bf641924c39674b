use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use deadpool::managed::{Hook, Pool};
use derive_more::{Deref, DerefMut};
use diesel_async::pooled_connection::{AsyncDieselConnectionManager, ManagerConfig};
use diesel_async::scoped_futures::ScopedBoxFuture;
use diesel_async::{AsyncConnection, RunQueryDsl};

use super::custom_hooks;
use crate::{
    ConnectionPool, PgError, PgPoolStatus, PgResult, PoolConfig, PooledConnection,
    TRACING_TARGET_CLIENT,
};

/// Pooled PostgreSQL client.
///
/// This is the physical handle the connection manager hands to units of work.
/// Cloning is cheap; all clones share one pool. A handle is never repaired in
/// place: on reconnection the manager builds a new `PgClient` and closes the
/// old one.
#[derive(Clone)]
pub struct PgClient {
    inner: Arc<PgClientInner>,
}

/// Inner data for PgClient
struct PgClientInner {
    pool: ConnectionPool,
    pool_config: PoolConfig,
    database_url_masked: String,
}

impl PgClient {
    /// Creates a new pool sized by `pool_config`.
    ///
    /// No connection is opened here; see [`PgClient::warm_up`].
    ///
    /// # Errors
    ///
    /// Returns an error if the pool configuration is rejected by deadpool.
    #[tracing::instrument(
        skip(database_url, pool_config),
        target = TRACING_TARGET_CLIENT,
        fields(database_url = %super::mask_url(database_url))
    )]
    pub fn new(database_url: &str, pool_config: &PoolConfig) -> PgResult<Self> {
        tracing::debug!(target: TRACING_TARGET_CLIENT, "Building connection pool");

        let mut manager_config = ManagerConfig::default();
        manager_config.custom_setup = Box::new(custom_hooks::setup_callback);
        let manager = AsyncDieselConnectionManager::new_with_config(database_url, manager_config);

        let pool = Pool::builder(manager)
            .max_size(pool_config.max_connections as usize)
            .wait_timeout(Some(pool_config.pool_timeout))
            .create_timeout(Some(pool_config.connect_timeout))
            .recycle_timeout(Some(pool_config.connect_timeout))
            .runtime(deadpool::Runtime::Tokio1)
            .post_create(Hook::sync_fn(custom_hooks::post_create))
            .post_recycle(Hook::sync_fn(custom_hooks::post_recycle))
            .build()
            .map_err(|e| {
                tracing::error!(target: TRACING_TARGET_CLIENT, error = %e, "Failed to create connection pool");
                PgError::Unexpected(format!("Failed to build connection pool: {}", e).into())
            })?;

        Ok(Self {
            inner: Arc::new(PgClientInner {
                pool,
                pool_config: *pool_config,
                database_url_masked: super::mask_url(database_url),
            }),
        })
    }

    /// Opens up to `connections` connections concurrently and returns them to the pool.
    ///
    /// Doubles as the connectivity test performed when a handle is created.
    #[tracing::instrument(skip(self), target = TRACING_TARGET_CLIENT)]
    pub async fn warm_up(&self, connections: u32) -> PgResult<()> {
        let connections = (connections as usize).clamp(1, self.inner.pool.status().max_size.max(1));
        let start = Instant::now();

        let pending = (0..connections).map(|_| self.inner.pool.get());
        let warmed = futures::future::try_join_all(pending)
            .await
            .map_err(PgError::from)?;

        tracing::debug!(
            target: TRACING_TARGET_CLIENT,
            connections = warmed.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "Connection pool warmed up"
        );
        Ok(())
    }

    /// Gets a connection from the pool.
    ///
    /// This method will wait up to the configured pool timeout for an
    /// available connection.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection is available within the timeout period.
    pub async fn get_connection(&self) -> PgResult<PgConn> {
        let start = Instant::now();
        let conn = self.inner.pool.get().await.map_err(|e| {
            tracing::debug!(
                target: TRACING_TARGET_CLIENT,
                error = %e,
                elapsed = ?start.elapsed(),
                "Failed to acquire connection from pool"
            );
            PgError::from(e)
        })?;

        let elapsed = start.elapsed();
        if elapsed > Duration::from_millis(100) {
            tracing::warn!(
                target: TRACING_TARGET_CLIENT,
                elapsed = ?elapsed,
                "Connection acquisition took longer than expected"
            );
        }

        Ok(PgConn::new(conn))
    }

    /// Runs `SELECT 1` on a pooled connection and returns the round-trip time.
    pub async fn ping(&self) -> PgResult<Duration> {
        let start = Instant::now();
        let mut conn = self.get_connection().await?;
        diesel::sql_query("SELECT 1").execute(&mut **conn).await?;
        Ok(start.elapsed())
    }

    /// Drops pooled connections that have been idle longer than the idle timeout.
    ///
    /// Checked-out connections are unaffected.
    pub fn evict_idle(&self) {
        let idle_timeout = self.inner.pool_config.idle_timeout;
        let before = self.inner.pool.status().size;
        self.inner
            .pool
            .retain(|_, metrics| metrics.last_used() < idle_timeout);
        let after = self.inner.pool.status().size;

        if after < before {
            tracing::debug!(
                target: TRACING_TARGET_CLIENT,
                evicted = before - after,
                idle_timeout_secs = idle_timeout.as_secs(),
                "Evicted idle connections"
            );
        }
    }

    /// Closes the pool.
    ///
    /// Idle connections are dropped immediately; checked-out connections are
    /// dropped when returned. Pending and future acquisitions fail.
    pub fn close(&self) {
        if !self.inner.pool.is_closed() {
            self.inner.pool.close();
            tracing::debug!(
                target: TRACING_TARGET_CLIENT,
                database_url = %self.inner.database_url_masked,
                "Connection pool closed"
            );
        }
    }

    /// Returns whether the pool has been closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    /// Gets the current pool status and statistics.
    #[inline]
    pub fn pool_status(&self) -> PgPoolStatus {
        let status = self.inner.pool.status();
        PgPoolStatus {
            max_size: status.max_size,
            size: status.size,
            available: status.available,
            waiting: status.waiting,
        }
    }

    /// Gets the pool configuration this client was built with.
    #[inline]
    pub fn pool_config(&self) -> &PoolConfig {
        &self.inner.pool_config
    }
}

impl fmt::Debug for PgClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pool_status = self.pool_status();
        f.debug_struct("PgClient")
            .field("database_url", &self.inner.database_url_masked)
            .field("pool_max_connections", &pool_status.max_size)
            .field("pool_current_size", &pool_status.size)
            .field("pool_available", &pool_status.available)
            .field("pool_waiting", &pool_status.waiting)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A wrapper around a pooled database connection.
///
/// Derefs to the underlying pooled [`AsyncPgConnection`] so diesel queries
/// can run on it directly. When dropped, the connection is returned to the pool.
///
/// ```ignore
/// let mut conn = client.get_connection().await?;
/// diesel::sql_query("SELECT 1").execute(&mut **conn).await?;
/// ```
///
/// [`AsyncPgConnection`]: crate::PgConnection
#[derive(Deref, DerefMut)]
pub struct PgConn {
    #[deref]
    #[deref_mut]
    conn: PooledConnection,
}

impl PgConn {
    /// Creates a new connection wrapper from a pooled connection.
    pub fn new(conn: PooledConnection) -> Self {
        Self { conn }
    }

    /// Executes the given function within a database transaction.
    ///
    /// If the function returns `Ok`, the transaction is committed.
    /// If the function returns `Err`, the transaction is rolled back.
    ///
    /// # Example
    ///
    /// ```ignore
    /// conn.transaction(|conn| {
    ///     Box::pin(async move {
    ///         diesel::sql_query("UPDATE a SET x = 1").execute(conn).await?;
    ///         diesel::sql_query("UPDATE b SET y = 2").execute(conn).await?;
    ///         Ok(())
    ///     })
    /// }).await?;
    /// ```
    pub async fn transaction<'a, T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: for<'r> FnOnce(&'r mut PooledConnection) -> ScopedBoxFuture<'a, 'r, Result<T, E>>
            + Send
            + 'a,
        T: Send + 'a,
        E: From<diesel::result::Error> + Send + 'a,
    {
        self.conn.transaction(f).await
    }
}

impl fmt::Debug for PgConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConn").finish_non_exhaustive()
    }
}
