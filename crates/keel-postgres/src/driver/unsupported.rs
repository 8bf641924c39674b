use super::DatabaseClient;
use crate::{PgError, PgResult, PoolConfig, TRACING_TARGET_CLIENT};

/// Client for environments without database access.
///
/// Every connect and probe fails with [`PgError::Unsupported`], which is
/// classified as fatal, so nothing is ever retried against it.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedClient;

#[async_trait::async_trait]
impl DatabaseClient for UnsupportedClient {
    type Handle = ();

    fn name(&self) -> &'static str {
        "unsupported"
    }

    async fn connect(&self, _pool_config: &PoolConfig) -> PgResult<()> {
        tracing::debug!(
            target: TRACING_TARGET_CLIENT,
            client = self.name(),
            "Database access requested in an unsupported environment"
        );
        Err(PgError::Unsupported)
    }

    async fn probe(&self, _handle: &()) -> PgResult<()> {
        Err(PgError::Unsupported)
    }

    async fn close(&self, _handle: ()) {}
}
