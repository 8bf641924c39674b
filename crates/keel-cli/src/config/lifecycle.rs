//! Process lifecycle configuration.

use std::time::Duration;

use anyhow::{Result as AnyhowResult, anyhow};
use clap::Args;
use serde::{Deserialize, Serialize};

use crate::TRACING_TARGET_CONFIG;

/// Status reporting and shutdown configuration.
///
/// # Environment Variables
///
/// - `STATUS_INTERVAL_SECS` - Seconds between status reports, 0 disables them (default: 60)
/// - `SHUTDOWN_TIMEOUT` - Graceful shutdown timeout in seconds (default: 30, max: 300)
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[must_use = "config does nothing unless you use it"]
pub struct LifecycleConfig {
    /// Seconds between database status reports in the log; 0 disables them.
    #[arg(long, env = "STATUS_INTERVAL_SECS", default_value_t = 60)]
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,

    /// Maximum time in seconds to wait for graceful shutdown.
    ///
    /// Shutdown stops the health monitor and closes the pool. Valid range: 1-300 seconds.
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 30)]
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

fn default_status_interval() -> u64 {
    60
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            status_interval_secs: default_status_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl LifecycleConfig {
    /// Validates all configuration values.
    pub fn validate(&self) -> AnyhowResult<()> {
        if self.shutdown_timeout == 0 || self.shutdown_timeout > 300 {
            return Err(anyhow!(
                "Shutdown timeout {} seconds is invalid. Must be between 1 and 300 seconds.",
                self.shutdown_timeout
            ));
        }

        if self.status_interval_secs > 86_400 {
            return Err(anyhow!(
                "Status interval {} seconds is invalid. Must be at most one day.",
                self.status_interval_secs
            ));
        }

        Ok(())
    }

    /// Returns the status report interval, or `None` when reporting is disabled.
    #[must_use]
    pub const fn status_interval(&self) -> Option<Duration> {
        if self.status_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.status_interval_secs))
        }
    }

    /// Returns the graceful shutdown timeout as a `Duration`.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    /// Logs the lifecycle configuration.
    pub fn log(&self) {
        tracing::debug!(
            target: TRACING_TARGET_CONFIG,
            status_interval_secs = self.status_interval_secs,
            shutdown_timeout_secs = self.shutdown_timeout,
            "Lifecycle configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = LifecycleConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.status_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn zero_interval_disables_reports() {
        let config = LifecycleConfig {
            status_interval_secs: 0,
            ..LifecycleConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.status_interval(), None);
    }

    #[test]
    fn shutdown_timeout_must_be_in_range() {
        for shutdown_timeout in [0, 301] {
            let config = LifecycleConfig {
                shutdown_timeout,
                ..LifecycleConfig::default()
            };
            assert!(config.validate().is_err());
        }
    }
}
