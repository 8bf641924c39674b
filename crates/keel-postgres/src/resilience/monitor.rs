//! Background health probing.
//!
//! The monitor owns a timer task that probes the installed handle on a fixed
//! interval. It holds only a weak reference to the manager, so dropping every
//! [`ConnectionManager`] clone also ends the task.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::ConnectionManager;
use super::manager::ManagerInner;
use crate::{DatabaseClient, PgError, TRACING_TARGET_HEALTH};

/// Health monitor schedule and thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Time between probes.
    pub interval: Duration,
    /// Deadline for a single probe.
    pub probe_timeout: Duration,
    /// Consecutive failed probes that trigger a reconnect.
    pub failure_threshold: u32,
    /// Retries of the reconnect cycle the monitor triggers.
    pub reconnect_attempts: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            failure_threshold: 3,
            reconnect_attempts: 3,
        }
    }
}

impl MonitorConfig {
    /// Sets the probe interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the probe deadline.
    #[must_use]
    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Sets the number of consecutive failures that trigger a reconnect.
    #[must_use]
    pub fn with_failure_threshold(mut self, failure_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold.max(1);
        self
    }

    /// Sets the retries of a triggered reconnect.
    #[must_use]
    pub fn with_reconnect_attempts(mut self, reconnect_attempts: u32) -> Self {
        self.reconnect_attempts = reconnect_attempts;
        self
    }
}

/// Result of a single health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckOutcome {
    /// The probe succeeded.
    Healthy,
    /// The probe failed.
    Unhealthy {
        /// Failed probes since the last success, including this one.
        consecutive_failures: u32,
        /// Whether this check started a reconnect.
        reconnect_triggered: bool,
    },
}

/// Handle to the background probe task.
///
/// Stopping is idempotent and waits for the task to exit, so no timer
/// outlives [`HealthMonitor::stop`].
#[derive(Debug)]
pub struct HealthMonitor {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub(crate) fn spawn<C: DatabaseClient>(inner: &Arc<ManagerInner<C>>) -> Self {
        let config = inner.options.monitor;
        let cancel = inner.shutdown.child_token();
        let token = cancel.clone();
        let weak = Arc::downgrade(inner);

        let task = tokio::spawn(async move {
            let start = Instant::now() + config.interval;
            let mut ticker = tokio::time::interval_at(start, config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(
                target: TRACING_TARGET_HEALTH,
                interval_secs = config.interval.as_secs(),
                failure_threshold = config.failure_threshold,
                "Health monitor started"
            );

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = ConnectionManager::from_inner(inner);
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = manager.check_health() => {}
                }
            }

            tracing::info!(target: TRACING_TARGET_HEALTH, "Health monitor stopped");
        });

        Self {
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Returns whether the probe task is still running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stops the probe task and waits for it to exit. Later calls do nothing.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = task
            && let Err(err) = task.await
            && err.is_panic()
        {
            tracing::error!(
                target: TRACING_TARGET_HEALTH,
                error = %err,
                "Health monitor task panicked"
            );
        }
    }
}

impl<C: DatabaseClient> ConnectionManager<C> {
    /// Probes the installed handle once and updates the health record.
    ///
    /// After `failure_threshold` consecutive failures a bounded reconnect is
    /// started on its own task; this call does not wait for it. At most one
    /// such reconnect runs at a time.
    pub async fn check_health(&self) -> HealthCheckOutcome {
        let config = self.inner().options.monitor;
        let result = match self.current_handle() {
            Ok(handle) => {
                let probe = self.inner().client.probe(&handle);
                match tokio::time::timeout(config.probe_timeout, probe).await {
                    Ok(result) => result,
                    Err(_) => Err(PgError::Deadline(config.probe_timeout)),
                }
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                self.with_shared(|shared| shared.health.record_probe_success());
                tracing::debug!(target: TRACING_TARGET_HEALTH, "Health check passed");
                HealthCheckOutcome::Healthy
            }
            Err(err) => {
                let consecutive_failures =
                    self.with_shared(|shared| shared.health.record_probe_failure());
                tracing::warn!(
                    target: TRACING_TARGET_HEALTH,
                    consecutive_failures,
                    failure_threshold = config.failure_threshold,
                    error = %err,
                    "Health check failed"
                );

                let reconnect_triggered = consecutive_failures >= config.failure_threshold
                    && !self.is_closed()
                    && self.trigger_reconnect(config.reconnect_attempts);

                HealthCheckOutcome::Unhealthy {
                    consecutive_failures,
                    reconnect_triggered,
                }
            }
        }
    }

    fn trigger_reconnect(&self, reconnect_attempts: u32) -> bool {
        use std::sync::atomic::Ordering;

        if self.inner().reconnecting.swap(true, Ordering::AcqRel) {
            tracing::debug!(target: TRACING_TARGET_HEALTH, "Reconnect already in progress");
            return false;
        }

        tracing::warn!(
            target: TRACING_TARGET_HEALTH,
            reconnect_attempts,
            "Connection degraded, starting reconnect"
        );

        let manager = self.clone();
        tokio::spawn(async move {
            match manager.connect_with_retry(reconnect_attempts).await {
                Ok(()) => {
                    tracing::info!(target: TRACING_TARGET_HEALTH, "Reconnect succeeded");
                }
                Err(err) => {
                    tracing::warn!(target: TRACING_TARGET_HEALTH, error = %err, "Reconnect failed");
                }
            }
            manager.inner().reconnecting.store(false, Ordering::Release);
        });

        true
    }
}
