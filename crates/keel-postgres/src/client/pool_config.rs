//! Pool sizing derived from the deployment context.
//!
//! The pool bounds and timeouts are computed once at startup from two facts
//! about the process: whether it runs on a managed (serverless) platform and
//! whether it serves production traffic. Anything that cannot be recognised
//! falls back to the smallest, local-development profile.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Platform names recognised as managed hosting.
const MANAGED_PLATFORMS: &[&str] = &["managed", "serverless", "lambda", "cloud-run"];

/// Environment names recognised as production.
const PRODUCTION_ENVIRONMENTS: &[&str] = &["production", "prod"];

/// Where the process is deployed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentContext {
    /// The process runs on a managed (serverless) platform.
    pub managed_platform: bool,
    /// The process serves production traffic.
    pub production: bool,
}

impl DeploymentContext {
    /// Creates a deployment context from explicit flags.
    pub const fn new(managed_platform: bool, production: bool) -> Self {
        Self {
            managed_platform,
            production,
        }
    }

    /// Interprets free-form environment and platform names.
    ///
    /// Matching is case-insensitive and ignores surrounding whitespace.
    /// Unknown or empty values are treated as local development.
    pub fn from_names(environment: &str, platform: &str) -> Self {
        let matches_any = |value: &str, names: &[&str]| {
            let value = value.trim();
            names.iter().any(|name| value.eq_ignore_ascii_case(name))
        };

        Self {
            managed_platform: matches_any(platform, MANAGED_PLATFORMS),
            production: matches_any(environment, PRODUCTION_ENVIRONMENTS),
        }
    }

    /// Computes the pool configuration for this deployment.
    #[inline]
    pub fn pool_config(&self) -> PoolConfig {
        compute_pool_config(self.managed_platform, self.production)
    }
}

impl fmt::Display for DeploymentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let platform = if self.managed_platform {
            "managed"
        } else {
            "self-hosted"
        };
        let environment = if self.production {
            "production"
        } else {
            "development"
        };
        write!(f, "{platform}/{environment}")
    }
}

/// Immutable pool sizing and timeout parameters.
///
/// Invariants: `1 <= min_connections <= max_connections` and every timeout is
/// non-zero. [`compute_pool_config`] always produces a value that satisfies
/// them; [`PoolConfig::with_max_connections`] preserves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on pooled connections.
    pub max_connections: u32,
    /// Connections opened eagerly when the pool is created.
    pub min_connections: u32,
    /// Maximum time to wait for a free pooled connection.
    pub pool_timeout: Duration,
    /// Connections unused for longer than this are evicted.
    pub idle_timeout: Duration,
    /// Maximum time to establish the pool's connections.
    pub connect_timeout: Duration,
    /// Default deadline for a single query.
    pub query_timeout: Duration,
    /// Default deadline for a multi-statement transaction.
    pub transaction_timeout: Duration,
}

/// Computes pool parameters for the given deployment.
///
/// Managed production deployments get the largest pool; local development
/// gets the smallest. This function is pure and cannot fail.
pub fn compute_pool_config(is_managed_platform: bool, is_production: bool) -> PoolConfig {
    match (is_managed_platform, is_production) {
        (true, true) => PoolConfig {
            max_connections: 20,
            min_connections: 2,
            pool_timeout: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            query_timeout: Duration::from_secs(30),
            transaction_timeout: Duration::from_secs(60),
        },
        (false, true) => PoolConfig {
            max_connections: 10,
            min_connections: 2,
            pool_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(30),
            transaction_timeout: Duration::from_secs(60),
        },
        (true, false) => PoolConfig {
            max_connections: 5,
            min_connections: 1,
            pool_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            query_timeout: Duration::from_secs(30),
            transaction_timeout: Duration::from_secs(60),
        },
        (false, false) => PoolConfig {
            max_connections: 5,
            min_connections: 1,
            pool_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(30),
            transaction_timeout: Duration::from_secs(60),
        },
    }
}

impl PoolConfig {
    /// Overrides the pool's upper bound, lowering the minimum if needed.
    ///
    /// A value of zero is raised to one.
    #[must_use]
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self.min_connections = self.min_connections.min(self.max_connections);
        self
    }

    /// Overrides the default query deadline.
    #[must_use]
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Overrides the default transaction deadline.
    #[must_use]
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        compute_pool_config(false, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_DEPLOYMENTS: [(bool, bool); 4] =
        [(false, false), (false, true), (true, false), (true, true)];

    #[test]
    fn managed_production_pool_is_at_least_twice_local() {
        let managed = compute_pool_config(true, true);
        let local = compute_pool_config(false, false);

        assert!(managed.max_connections > local.max_connections);
        assert!(managed.max_connections >= 2 * local.max_connections);
    }

    #[test]
    fn every_profile_satisfies_invariants() {
        for (managed, production) in ALL_DEPLOYMENTS {
            let config = compute_pool_config(managed, production);

            assert!(config.min_connections >= 1);
            assert!(config.min_connections <= config.max_connections);
            for timeout in [
                config.pool_timeout,
                config.idle_timeout,
                config.connect_timeout,
                config.query_timeout,
                config.transaction_timeout,
            ] {
                assert!(timeout > Duration::ZERO);
            }
        }
    }

    #[test]
    fn computation_is_deterministic() {
        for (managed, production) in ALL_DEPLOYMENTS {
            assert_eq!(
                compute_pool_config(managed, production),
                compute_pool_config(managed, production)
            );
        }
    }

    #[test]
    fn unknown_names_fall_back_to_local() {
        let context = DeploymentContext::from_names("staging??", "mainframe");
        assert_eq!(context, DeploymentContext::default());
        assert_eq!(context.pool_config(), compute_pool_config(false, false));

        let empty = DeploymentContext::from_names("", "");
        assert_eq!(empty, DeploymentContext::default());
    }

    #[test]
    fn known_names_are_recognised() {
        let context = DeploymentContext::from_names(" Production ", "SERVERLESS");
        assert!(context.production);
        assert!(context.managed_platform);
        assert_eq!(context.to_string(), "managed/production");
    }

    #[test]
    fn max_connection_override_keeps_min_below_max() {
        let config = compute_pool_config(true, true).with_max_connections(1);
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.min_connections, 1);

        let config = compute_pool_config(false, false).with_max_connections(0);
        assert_eq!(config.max_connections, 1);
    }
}
