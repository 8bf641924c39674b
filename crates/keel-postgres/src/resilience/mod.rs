//! Connection recovery, health monitoring and retrying query execution.
//!
//! All state shared between callers lives behind a [`ConnectionManager`]:
//! the live handle, the [`ConnectionHealth`] record and the background
//! [`HealthMonitor`]. Retry decisions go through [`ErrorClassifier`] and
//! delays through [`RetryPolicy`].

mod classify;
mod executor;
mod health;
pub(crate) mod manager;
mod monitor;
mod retry;
#[cfg(test)]
pub(crate) mod testing;

pub use classify::{
    ErrorClass, ErrorClassifier, TRANSIENT_MESSAGE_MARKERS, TRANSIENT_SQLSTATE_CODES,
};
pub use executor::QueryOptions;
pub use health::{ConnectionHealth, HealthStatus};
pub use manager::{ConnectionManager, ConnectionState, ManagerOptions};
pub use monitor::{HealthCheckOutcome, HealthMonitor, MonitorConfig};
pub use retry::RetryPolicy;
