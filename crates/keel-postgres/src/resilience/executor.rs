//! Deadline-bounded, retrying execution of units of work.

use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ConnectionManager, RetryPolicy};
use crate::{DatabaseClient, PgError, PgResult, TRACING_TARGET_QUERY};

/// Per-call overrides for [`ConnectionManager::run_query`].
///
/// Unset fields fall back to the manager's retry policy and the pool's
/// query or transaction timeout.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Retries after the first attempt.
    pub max_retries: Option<u32>,
    /// Deadline for a single attempt.
    pub timeout: Option<Duration>,
    /// Delay before the first retry; later retries double it.
    pub retry_base_delay: Option<Duration>,
    /// Caller-owned cancellation signal.
    pub cancellation: Option<CancellationToken>,
    /// Name used in log events.
    pub label: Option<Cow<'static, str>>,
}

impl QueryOptions {
    /// Creates options that use every default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of retries after the first attempt.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets the deadline for a single attempt.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the delay before the first retry.
    #[must_use]
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = Some(delay);
        self
    }

    /// Sets the caller's cancellation signal.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Sets the name used in log events.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl<C: DatabaseClient> ConnectionManager<C> {
    /// Runs a single query against the live handle.
    ///
    /// `work` is called once per attempt with a clone of the handle. Each
    /// attempt is bounded by the query timeout; when it elapses the attempt's
    /// future is dropped, which cancels the in-flight work. Transient and
    /// timeout failures are retried with exponential backoff; any other
    /// failure is returned at once.
    ///
    /// ```rust,no_run
    /// use diesel_async::RunQueryDsl;
    /// use keel_postgres::{ConnectionManager, PgDriver, QueryOptions};
    ///
    /// # async fn example(manager: ConnectionManager<PgDriver>) -> keel_postgres::PgResult<()> {
    /// let rows = manager
    ///     .run_query(
    ///         |client| async move {
    ///             let mut conn = client.get_connection().await?;
    ///             Ok(diesel::sql_query("SELECT 1").execute(&mut **conn).await?)
    ///         },
    ///         QueryOptions::new().with_label("ping"),
    ///     )
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// - [`PgError::Exhausted`] when every attempt failed with a retryable error.
    /// - [`PgError::Cancelled`] when the caller's token fired.
    /// - [`PgError::Closed`] after shutdown.
    /// - The first non-retryable error otherwise.
    pub async fn run_query<T, F, Fut>(&self, work: F, options: QueryOptions) -> PgResult<T>
    where
        F: FnMut(C::Handle) -> Fut,
        Fut: Future<Output = PgResult<T>>,
    {
        let timeout = options.timeout.unwrap_or(self.pool_config().query_timeout);
        self.run_with_retry(work, options, timeout, "query").await
    }

    /// Runs a multi-statement transaction against the live handle.
    ///
    /// Same contract as [`ConnectionManager::run_query`], but the default
    /// deadline is the pool's transaction timeout. `work` is responsible for
    /// opening and committing the transaction, so that a retried attempt
    /// starts a fresh one.
    pub async fn run_transaction<T, F, Fut>(
        &self,
        work: F,
        options: QueryOptions,
    ) -> PgResult<T>
    where
        F: FnMut(C::Handle) -> Fut,
        Fut: Future<Output = PgResult<T>>,
    {
        let timeout = options
            .timeout
            .unwrap_or(self.pool_config().transaction_timeout);
        self.run_with_retry(work, options, timeout, "transaction")
            .await
    }

    async fn run_with_retry<T, F, Fut>(
        &self,
        mut work: F,
        options: QueryOptions,
        timeout: Duration,
        kind: &'static str,
    ) -> PgResult<T>
    where
        F: FnMut(C::Handle) -> Fut,
        Fut: Future<Output = PgResult<T>>,
    {
        let defaults = self.options().retry;
        let policy = RetryPolicy {
            max_retries: options.max_retries.unwrap_or(defaults.max_retries),
            base_delay: options.retry_base_delay.unwrap_or(defaults.base_delay),
            ..defaults
        };
        let max_attempts = policy.max_attempts();
        let cancel = options.cancellation.unwrap_or_default();
        let label = options.label.as_deref().unwrap_or(kind);

        let mut last_error = PgError::NotConnected;
        for attempt in 0..max_attempts {
            if let Err(err) = self.ensure_connected(&cancel).await {
                return Err(self.record_failure(err, label, attempt + 1));
            }

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(PgError::Cancelled),
                result = self.attempt(&mut work, timeout) => result,
            };

            let err = match result {
                Ok(value) => {
                    self.record_success(started.elapsed(), label, attempt + 1);
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = err.class();
            if !class.is_retryable() {
                return Err(self.record_failure(err, label, attempt + 1));
            }

            if attempt + 1 < max_attempts {
                let backoff = policy.backoff(attempt);
                tracing::warn!(
                    target: TRACING_TARGET_QUERY,
                    label,
                    attempt = attempt + 1,
                    max_attempts,
                    backoff_ms = backoff.as_millis(),
                    class = %class,
                    error = %err,
                    "Database {kind} failed, retrying after backoff"
                );

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        return Err(self.record_failure(PgError::Cancelled, label, attempt + 1));
                    }
                    () = tokio::time::sleep(backoff) => {}
                }
            }
            last_error = err;
        }

        self.with_shared(|shared| shared.health.record_query_failure());
        tracing::error!(
            target: TRACING_TARGET_QUERY,
            label,
            attempts = max_attempts,
            error = %last_error,
            "Database {kind} failed after exhausting retries"
        );
        Err(PgError::Exhausted {
            attempts: max_attempts,
            source: Box::new(last_error),
        })
    }

    async fn attempt<T, F, Fut>(&self, work: &mut F, timeout: Duration) -> PgResult<T>
    where
        F: FnMut(C::Handle) -> Fut,
        Fut: Future<Output = PgResult<T>>,
    {
        let handle = self.current_handle()?;
        match tokio::time::timeout(timeout, work(handle)).await {
            Ok(result) => result,
            Err(_) => Err(PgError::Deadline(timeout)),
        }
    }

    /// Checks an unhealthy connection before an attempt.
    ///
    /// An installed handle is probed once and kept either way; replacing it
    /// is left to the health monitor and its failure threshold. Without a
    /// handle a bounded connect cycle runs on its own task, so that a
    /// cancelled caller cannot abandon the manager halfway through it. The
    /// outcome is only logged: the following attempt surfaces a missing
    /// handle.
    async fn ensure_connected(&self, cancel: &CancellationToken) -> PgResult<()> {
        if self.is_closed() || self.is_healthy() {
            return Ok(());
        }

        match self.current_handle() {
            Ok(handle) => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(PgError::Cancelled),
                    () = self.verify_handle(handle) => Ok(()),
                }
            }
            Err(_) => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(PgError::Cancelled),
                    () = self.connect_before_query() => Ok(()),
                }
            }
        }
    }

    async fn verify_handle(&self, handle: C::Handle) {
        let probe_timeout = self.options().monitor.probe_timeout;
        let probe = self.inner().client.probe(&handle);
        let result = match tokio::time::timeout(probe_timeout, probe).await {
            Ok(result) => result,
            Err(_) => Err(PgError::Deadline(probe_timeout)),
        };

        match result {
            Ok(()) => {
                self.with_shared(|shared| shared.health.record_probe_success());
                tracing::debug!(
                    target: TRACING_TARGET_QUERY,
                    "Connection answered again before the next attempt"
                );
            }
            Err(err) => tracing::debug!(
                target: TRACING_TARGET_QUERY,
                error = %err,
                "Connection still unhealthy, leaving recovery to the health monitor"
            ),
        }
    }

    async fn connect_before_query(&self) {
        let retries = self.options().query_reconnect_attempts;
        tracing::debug!(
            target: TRACING_TARGET_QUERY,
            retries,
            "Not connected, connecting before the next attempt"
        );

        let manager = self.clone();
        let connect = tokio::spawn(async move { manager.connect_with_retry(retries).await });
        match connect.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::debug!(
                target: TRACING_TARGET_QUERY,
                error = %err,
                "Connect before query failed"
            ),
            Err(err) => tracing::error!(
                target: TRACING_TARGET_QUERY,
                error = %err,
                "Connect task failed"
            ),
        }
    }

    fn record_success(&self, latency: Duration, label: &str, attempts: u32) {
        self.with_shared(|shared| shared.health.record_query_success(latency));

        let threshold = self.options().slow_query_threshold;
        if latency > threshold {
            tracing::warn!(
                target: TRACING_TARGET_QUERY,
                label,
                attempts,
                elapsed_ms = latency.as_millis(),
                threshold_ms = threshold.as_millis(),
                "Slow database query"
            );
        } else {
            tracing::trace!(
                target: TRACING_TARGET_QUERY,
                label,
                attempts,
                elapsed_ms = latency.as_millis(),
                "Database query completed"
            );
        }
    }

    fn record_failure(&self, err: PgError, label: &str, attempts: u32) -> PgError {
        self.with_shared(|shared| shared.health.record_query_failure());
        tracing::debug!(
            target: TRACING_TARGET_QUERY,
            label,
            attempts,
            class = %err.class(),
            error = %err,
            "Database query failed without retry"
        );
        err
    }
}
