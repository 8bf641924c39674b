//! PostgreSQL pool wrapper and its configuration.
//!
//! This module owns everything that talks to `deadpool` and `diesel-async`
//! directly: pool sizing derived from the deployment context, the pooled
//! client handle, and the logging hooks installed on the pool.

pub(crate) mod custom_hooks;
mod pg_client;
mod pg_config;
mod pool_config;
mod pool_status;

use deadpool::managed::{Object, Pool};
use diesel_async::AsyncPgConnection;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
pub use pg_client::{PgClient, PgConn};
pub use pg_config::PgConfig;
pub(crate) use pg_config::mask_url;
pub use pool_config::{DeploymentContext, PoolConfig, compute_pool_config};
pub use pool_status::PgPoolStatus;

/// Type alias for the connection pool used throughout the crate.
pub type ConnectionPool = Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

/// Type alias for a connection object from the pool.
pub type PooledConnection = Object<AsyncDieselConnectionManager<AsyncPgConnection>>;
