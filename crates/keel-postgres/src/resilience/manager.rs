//! Connection lifecycle: connect with retry, handle replacement and shutdown.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

#[cfg(feature = "schema")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ConnectionHealth, HealthMonitor, HealthStatus, MonitorConfig, RetryPolicy};
use crate::{DatabaseClient, PgError, PgResult, PoolConfig, TRACING_TARGET_CONNECTION};

/// Lifecycle state of the managed connection.
///
/// `Disconnected -> Connecting -> Connected -> Reconnecting -> Connected | Disconnected`.
/// `Disconnected` is both the initial state and the state after shutdown or
/// after a connect cycle ran out of attempts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Display, EnumString, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No usable handle.
    #[default]
    Disconnected,
    /// First connect cycle in progress.
    Connecting,
    /// A handle is installed.
    Connected,
    /// Replacing a degraded handle; the previous handle stays in use meanwhile.
    Reconnecting,
}

/// Tunables of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerOptions {
    /// Retry budget and backoff for connects and queries.
    pub retry: RetryPolicy,
    /// Health monitor schedule and thresholds.
    pub monitor: MonitorConfig,
    /// Successful queries slower than this are logged as slow.
    pub slow_query_threshold: Duration,
    /// Retries of the connect cycle the executor runs when the connection is unhealthy.
    pub query_reconnect_attempts: u32,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            monitor: MonitorConfig::default(),
            slow_query_threshold: Duration::from_secs(5),
            query_reconnect_attempts: 2,
        }
    }
}

impl ManagerOptions {
    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the health monitor configuration.
    #[must_use]
    pub fn with_monitor_config(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Sets the slow query threshold.
    #[must_use]
    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }

    /// Sets the connect retries used by the executor's proactive reconnect.
    #[must_use]
    pub fn with_query_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.query_reconnect_attempts = attempts;
        self
    }
}

/// State guarded together so that health and lifecycle never disagree.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    pub(crate) state: ConnectionState,
    pub(crate) health: ConnectionHealth,
}

pub(crate) struct ManagerInner<C: DatabaseClient> {
    pub(crate) client: C,
    pub(crate) pool_config: PoolConfig,
    pub(crate) options: ManagerOptions,
    handle: RwLock<Option<C::Handle>>,
    shared: Mutex<SharedState>,
    /// Serializes connect cycles and shutdown.
    connect_gate: tokio::sync::Mutex<()>,
    /// Incremented after every finished connect cycle.
    connect_generation: AtomicU64,
    monitor: Mutex<Option<HealthMonitor>>,
    pub(crate) reconnecting: AtomicBool,
    closed: AtomicBool,
    pub(crate) shutdown: CancellationToken,
}

impl<C: DatabaseClient> Drop for ManagerInner<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Owns the process's database handle and brokers its lifecycle.
///
/// The manager is constructed explicitly and shared by cloning; all clones
/// refer to the same handle, health record and monitor. Callers obtain the
/// live handle through the query executor ([`ConnectionManager::run_query`]),
/// which never sees a half-built handle: a reconnect keeps the previous
/// handle installed until its replacement has connected.
///
/// ```rust,no_run
/// use keel_postgres::{ConnectionManager, PgDriver, PoolConfig};
///
/// # async fn example() -> keel_postgres::PgResult<()> {
/// let manager = ConnectionManager::new(
///     PgDriver::new("postgresql://localhost/app"),
///     PoolConfig::default(),
/// );
/// manager.connect_in_background();
/// # manager.disconnect_gracefully().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager<C: DatabaseClient> {
    inner: Arc<ManagerInner<C>>,
}

impl<C: DatabaseClient> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: DatabaseClient> ConnectionManager<C> {
    /// Creates a disconnected manager with default options.
    pub fn new(client: C, pool_config: PoolConfig) -> Self {
        Self::with_options(client, pool_config, ManagerOptions::default())
    }

    /// Creates a disconnected manager.
    pub fn with_options(client: C, pool_config: PoolConfig, options: ManagerOptions) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                client,
                pool_config,
                options,
                handle: RwLock::new(None),
                shared: Mutex::new(SharedState::default()),
                connect_gate: tokio::sync::Mutex::new(()),
                connect_generation: AtomicU64::new(0),
                monitor: Mutex::new(None),
                reconnecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner<C>>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ManagerInner<C>> {
        &self.inner
    }

    /// Connects using the configured retry budget.
    pub async fn connect(&self) -> PgResult<()> {
        self.connect_with_retry(self.inner.options.retry.max_retries)
            .await
    }

    /// Starts [`ConnectionManager::connect`] on a background task.
    ///
    /// Startup does not have to wait for, or fail on, an unreachable
    /// database; the outcome is logged and deferred to the first query.
    pub fn connect_in_background(&self) -> JoinHandle<PgResult<()>> {
        let manager = self.clone();
        tokio::spawn(async move { manager.connect().await })
    }

    /// Establishes the connection, retrying up to `remaining_retries` times.
    ///
    /// Makes at most `remaining_retries + 1` attempts, sleeping
    /// `backoff(i)` after failed attempt `i`, and stops early on an error
    /// that is not worth retrying. On success the handle is installed, the
    /// health record is reset and the health monitor is started. On failure
    /// the previous handle, if any, is closed and the manager is left
    /// `Disconnected`; the process keeps running.
    ///
    /// Concurrent calls are serialized. A call that waited while another
    /// call finished a connect cycle returns that cycle's outcome without
    /// making attempts of its own.
    ///
    /// # Errors
    ///
    /// - [`PgError::Closed`] after [`ConnectionManager::disconnect_gracefully`].
    /// - [`PgError::Exhausted`] when every attempt failed with a retryable error.
    /// - The first non-retryable error otherwise.
    #[tracing::instrument(
        skip(self),
        target = TRACING_TARGET_CONNECTION,
        fields(client = self.inner.client.name())
    )]
    pub async fn connect_with_retry(&self, remaining_retries: u32) -> PgResult<()> {
        if self.is_closed() {
            return Err(PgError::Closed);
        }

        let observed_generation = self.inner.connect_generation.load(Ordering::Acquire);
        let _gate = tokio::select! {
            guard = self.inner.connect_gate.lock() => guard,
            () = self.inner.shutdown.cancelled() => return Err(PgError::Closed),
        };

        if self.is_closed() {
            return Err(PgError::Closed);
        }

        if self.inner.connect_generation.load(Ordering::Acquire) != observed_generation {
            tracing::debug!(
                target: TRACING_TARGET_CONNECTION,
                "Connect cycle finished while waiting, reusing its outcome"
            );
            return if self.has_live_handle() {
                Ok(())
            } else {
                Err(PgError::NotConnected)
            };
        }

        if self.has_live_handle() {
            return Ok(());
        }

        let result = self.run_connect_cycle(remaining_retries).await;
        self.inner
            .connect_generation
            .fetch_add(1, Ordering::AcqRel);
        result
    }

    async fn run_connect_cycle(&self, remaining_retries: u32) -> PgResult<()> {
        let policy = self.inner.options.retry;
        let connect_timeout = self.inner.pool_config.connect_timeout;
        let max_attempts = remaining_retries.saturating_add(1);

        let next_state = if self.read_handle().is_some() {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };
        self.with_shared(|shared| shared.state = next_state);

        let mut last_error = PgError::NotConnected;
        let mut attempts = 0;
        for attempt in 0..max_attempts {
            attempts = attempt + 1;
            tracing::info!(
                target: TRACING_TARGET_CONNECTION,
                attempt = attempts,
                max_attempts,
                state = %next_state,
                "Connecting to database"
            );

            let connect = tokio::time::timeout(
                connect_timeout,
                self.inner.client.connect(&self.inner.pool_config),
            );
            let outcome = tokio::select! {
                outcome = connect => outcome,
                () = self.inner.shutdown.cancelled() => return Err(PgError::Closed),
            };

            last_error = match outcome {
                Ok(Ok(handle)) => {
                    self.install_handle(handle, attempts).await;
                    return Ok(());
                }
                Ok(Err(err)) => err,
                Err(_) => PgError::Deadline(connect_timeout),
            };

            let class = last_error.class();
            if !class.is_retryable() {
                tracing::warn!(
                    target: TRACING_TARGET_CONNECTION,
                    attempt = attempts,
                    error = %last_error,
                    class = %class,
                    "Connection attempt failed with a non-retryable error"
                );
                break;
            }

            if attempts < max_attempts {
                let backoff = policy.backoff(attempt);
                tracing::warn!(
                    target: TRACING_TARGET_CONNECTION,
                    attempt = attempts,
                    max_attempts,
                    backoff_ms = backoff.as_millis(),
                    error = %last_error,
                    "Connection attempt failed, retrying after backoff"
                );
                tokio::select! {
                    () = tokio::time::sleep(backoff) => {}
                    () = self.inner.shutdown.cancelled() => return Err(PgError::Closed),
                }
            }
        }

        self.abandon_handle(attempts, &last_error).await;
        if last_error.class().is_retryable() {
            Err(PgError::Exhausted {
                attempts,
                source: Box::new(last_error),
            })
        } else {
            Err(last_error)
        }
    }

    async fn install_handle(&self, handle: C::Handle, attempts: u32) {
        let previous = self.write_handle().replace(handle);
        let reconnected = previous.is_some();
        self.with_shared(|shared| {
            shared.state = ConnectionState::Connected;
            shared.health.record_probe_success();
        });

        if let Some(previous) = previous {
            self.inner.client.close(previous).await;
        }

        tracing::info!(
            target: TRACING_TARGET_CONNECTION,
            attempts,
            reconnected,
            "Connected to database"
        );
        self.start_health_monitor();
    }

    async fn abandon_handle(&self, attempts: u32, error: &PgError) {
        let previous = self.write_handle().take();
        self.with_shared(|shared| {
            shared.state = ConnectionState::Disconnected;
            shared.health.mark_unhealthy();
        });

        if let Some(previous) = previous {
            self.inner.client.close(previous).await;
        }

        tracing::error!(
            target: TRACING_TARGET_CONNECTION,
            attempts,
            error = %error,
            "Failed to connect to database, deferring to the next query"
        );
    }

    /// Stops the health monitor, then closes the handle.
    ///
    /// Idempotent: safe to call repeatedly and on a manager that never
    /// connected. Only the first call logs. In-flight queries keep their
    /// clone of the handle and finish or time out on their own; new queries
    /// fail with [`PgError::Closed`].
    pub async fn disconnect_gracefully(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::info!(target: TRACING_TARGET_CONNECTION, "Shutting down database connection");
        self.inner.shutdown.cancel();
        self.stop_health_monitor().await;

        let _gate = self.inner.connect_gate.lock().await;
        let handle = self.write_handle().take();
        let had_handle = handle.is_some();
        if let Some(handle) = handle {
            self.inner.client.close(handle).await;
        }
        self.with_shared(|shared| {
            shared.state = ConnectionState::Disconnected;
            shared.health.mark_unhealthy();
        });

        tracing::info!(
            target: TRACING_TARGET_CONNECTION,
            had_handle,
            "Database connection closed"
        );
    }

    /// Returns the live handle.
    ///
    /// # Errors
    ///
    /// [`PgError::Closed`] after shutdown, [`PgError::NotConnected`] when no
    /// handle is installed.
    pub fn current_handle(&self) -> PgResult<C::Handle> {
        if self.is_closed() {
            return Err(PgError::Closed);
        }
        self.read_handle().clone().ok_or(PgError::NotConnected)
    }

    /// Returns a snapshot of the health record.
    pub fn health_status(&self) -> HealthStatus {
        self.with_shared(|shared| shared.health.status(shared.state))
    }

    /// Returns whether the last probe or connect succeeded.
    pub fn is_healthy(&self) -> bool {
        self.with_shared(|shared| shared.health.is_healthy)
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.with_shared(|shared| shared.state)
    }

    /// Returns whether [`ConnectionManager::disconnect_gracefully`] has been called.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Returns the pool configuration handed to the client.
    #[inline]
    pub fn pool_config(&self) -> &PoolConfig {
        &self.inner.pool_config
    }

    /// Returns the manager options.
    #[inline]
    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    /// Returns the database client.
    #[inline]
    pub fn client(&self) -> &C {
        &self.inner.client
    }

    /// Starts the health monitor unless it is already running or the manager is closed.
    pub fn start_health_monitor(&self) {
        if self.is_closed() {
            return;
        }

        let mut monitor = lock(&self.inner.monitor);
        if monitor.as_ref().is_some_and(HealthMonitor::is_running) {
            return;
        }
        *monitor = Some(HealthMonitor::spawn(&self.inner));
    }

    /// Stops the health monitor and waits for its task to finish.
    pub async fn stop_health_monitor(&self) {
        let monitor = lock(&self.inner.monitor).take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
    }

    /// Returns whether the health monitor task is running.
    pub fn is_monitor_running(&self) -> bool {
        lock(&self.inner.monitor)
            .as_ref()
            .is_some_and(HealthMonitor::is_running)
    }

    pub(crate) fn with_shared<R>(&self, f: impl FnOnce(&mut SharedState) -> R) -> R {
        f(&mut lock(&self.inner.shared))
    }

    fn has_live_handle(&self) -> bool {
        self.read_handle().is_some() && self.is_healthy()
    }

    fn read_handle(&self) -> std::sync::RwLockReadGuard<'_, Option<C::Handle>> {
        self.inner
            .handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_handle(&self) -> std::sync::RwLockWriteGuard<'_, Option<C::Handle>> {
        self.inner
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C: DatabaseClient + fmt::Debug> fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("client", &self.inner.client)
            .field("state", &self.state())
            .field("healthy", &self.is_healthy())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
