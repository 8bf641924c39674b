#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

// Tracing target constants for consistent logging.

/// Tracing target for client-related operations.
///
/// Use this target for logging client initialization, configuration, and pool lifecycle events.
pub const TRACING_TARGET_CLIENT: &str = "keel_postgres::client";

/// Tracing target for database query operations.
///
/// Use this target for logging query execution, retries, slow queries and query-related errors.
pub const TRACING_TARGET_QUERY: &str = "keel_postgres::query";

/// Tracing target for database connection operations.
///
/// Use this target for logging connection attempts, reconnection and shutdown.
pub const TRACING_TARGET_CONNECTION: &str = "keel_postgres::connection";

/// Tracing target for health monitoring.
///
/// Use this target for logging health probes and the monitor lifecycle.
pub const TRACING_TARGET_HEALTH: &str = "keel_postgres::health";

mod client;
pub mod driver;
mod error;
pub mod resilience;

pub use diesel_async::AsyncPgConnection as PgConnection;

pub use crate::client::{
    ConnectionPool, DeploymentContext, PgClient, PgConfig, PgConn, PgPoolStatus, PoolConfig,
    PooledConnection, compute_pool_config,
};
pub use crate::driver::{DatabaseClient, PgDriver, UnsupportedClient};
pub use crate::error::{ErrorHint, PgError, PgResult};
pub use crate::resilience::{
    ConnectionHealth, ConnectionManager, ConnectionState, ErrorClass, ErrorClassifier,
    HealthCheckOutcome, HealthMonitor, HealthStatus, ManagerOptions, MonitorConfig, QueryOptions,
    RetryPolicy,
};
