//! Database client capability.
//!
//! The connection manager is generic over a [`DatabaseClient`], chosen when
//! the manager is constructed. [`PgDriver`] talks to PostgreSQL through a
//! pooled [`PgClient`]; [`UnsupportedClient`] stands in where no database is
//! reachable by construction and fails every operation with
//! [`PgError::Unsupported`].
//!
//! # Example
//!
//! ```ignore
//! #[async_trait::async_trait]
//! impl DatabaseClient for MyDriver {
//!     type Handle = MyPool;
//!
//!     fn name(&self) -> &'static str { "my-driver" }
//!
//!     async fn connect(&self, pool_config: &PoolConfig) -> PgResult<MyPool> { ... }
//!     async fn probe(&self, handle: &MyPool) -> PgResult<()> { ... }
//!     async fn close(&self, handle: MyPool) { ... }
//! }
//! ```
//!
//! [`PgClient`]: crate::PgClient
//! [`PgError::Unsupported`]: crate::PgError::Unsupported

mod postgres;
mod unsupported;

pub use postgres::PgDriver;
pub use unsupported::UnsupportedClient;

use crate::{PgResult, PoolConfig};

/// Capability to open, probe and close a database handle.
///
/// A handle is the unit the connection manager swaps on reconnection. It is
/// cloned out to every unit of work, so it should be a cheap reference to a
/// pool rather than a single connection.
#[async_trait::async_trait]
pub trait DatabaseClient: Send + Sync + 'static {
    /// Live handle produced by a successful connect.
    type Handle: Clone + Send + Sync + 'static;

    /// Short name used in log events.
    fn name(&self) -> &'static str;

    /// Opens a new handle sized by `pool_config`.
    ///
    /// Implementations must verify connectivity before returning `Ok`; a
    /// returned handle is considered usable.
    async fn connect(&self, pool_config: &PoolConfig) -> PgResult<Self::Handle>;

    /// Runs a cheap query to check that the handle is usable.
    async fn probe(&self, handle: &Self::Handle) -> PgResult<()>;

    /// Releases the handle. Must be safe to call on a broken handle.
    async fn close(&self, handle: Self::Handle);
}
