//! Shared health record and its diagnostic snapshot.

use std::time::Duration;

use jiff::Timestamp;
#[cfg(feature = "schema")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ConnectionState;

/// Health record shared by the connection manager, the health monitor and
/// the query executor.
///
/// Invariants: `failed_queries <= total_queries`, and
/// `consecutive_failures == 0` whenever `is_healthy` is true. Every mutation
/// below preserves both.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConnectionHealth {
    /// Last probe or connect succeeded.
    pub is_healthy: bool,
    /// Probe failures since the last success.
    pub consecutive_failures: u32,
    /// Time of the most recent probe or connect, successful or not.
    pub last_check_time: Option<Timestamp>,
    /// Completed executor calls.
    pub total_queries: u64,
    /// Executor calls that returned an error.
    pub failed_queries: u64,
    /// Running mean latency of successful calls, in milliseconds.
    pub average_latency_ms: f64,
}

impl ConnectionHealth {
    /// Records a successful probe or connect.
    pub fn record_probe_success(&mut self) {
        self.is_healthy = true;
        self.consecutive_failures = 0;
        self.last_check_time = Some(Timestamp::now());
    }

    /// Records a failed probe and returns the new consecutive failure count.
    pub fn record_probe_failure(&mut self) -> u32 {
        self.is_healthy = false;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_check_time = Some(Timestamp::now());
        self.consecutive_failures
    }

    /// Marks the connection unhealthy without counting a probe failure.
    pub fn mark_unhealthy(&mut self) {
        self.is_healthy = false;
    }

    /// Records a successful executor call and folds its latency into the mean.
    pub fn record_query_success(&mut self, latency: Duration) {
        self.total_queries += 1;
        let successes = self.total_queries - self.failed_queries;
        let sample = latency.as_secs_f64() * 1000.0;
        self.average_latency_ms += (sample - self.average_latency_ms) / successes as f64;
    }

    /// Records a failed executor call.
    pub fn record_query_failure(&mut self) {
        self.total_queries += 1;
        self.failed_queries += 1;
    }

    /// Percentage of executor calls that succeeded, 100 when none ran yet.
    pub fn success_rate_percent(&self) -> f64 {
        if self.total_queries == 0 {
            return 100.0;
        }
        let successes = self.total_queries - self.failed_queries;
        successes as f64 * 100.0 / self.total_queries as f64
    }

    /// Takes a snapshot for diagnostics.
    pub fn status(&self, state: ConnectionState) -> HealthStatus {
        HealthStatus {
            is_healthy: self.is_healthy,
            state,
            consecutive_failures: self.consecutive_failures,
            total_queries: self.total_queries,
            failed_queries: self.failed_queries,
            average_latency_ms: self.average_latency_ms,
            success_rate_percent: self.success_rate_percent(),
            last_check_time: self.last_check_time,
        }
    }
}

/// Point-in-time health report for operational endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Whether the last probe or connect succeeded.
    pub is_healthy: bool,
    /// Connection lifecycle state.
    pub state: ConnectionState,
    /// Probe failures since the last success.
    pub consecutive_failures: u32,
    /// Completed executor calls.
    pub total_queries: u64,
    /// Executor calls that returned an error.
    pub failed_queries: u64,
    /// Mean latency of successful calls, in milliseconds.
    pub average_latency_ms: f64,
    /// Share of successful calls, in percent.
    pub success_rate_percent: f64,
    /// Time of the most recent probe or connect.
    pub last_check_time: Option<Timestamp>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariants(health: &ConnectionHealth) {
        assert!(health.failed_queries <= health.total_queries);
        if health.is_healthy {
            assert_eq!(health.consecutive_failures, 0);
        }
    }

    #[test]
    fn starts_unhealthy_and_empty() {
        let health = ConnectionHealth::default();
        assert!(!health.is_healthy);
        assert_eq!(health.last_check_time, None);

        let status = health.status(ConnectionState::Disconnected);
        assert_eq!(status.success_rate_percent, 100.0);
        assert_eq!(status.total_queries, 0);
    }

    #[test]
    fn invariants_hold_under_mixed_updates() {
        let mut health = ConnectionHealth::default();
        for step in 0..200u32 {
            match step % 7 {
                0 | 3 => health.record_query_success(Duration::from_millis(u64::from(step))),
                1 => health.record_query_failure(),
                2 | 5 => {
                    health.record_probe_failure();
                }
                4 => health.record_probe_success(),
                _ => health.mark_unhealthy(),
            }
            assert_invariants(&health);
        }
    }

    #[test]
    fn probe_success_resets_failures() {
        let mut health = ConnectionHealth::default();
        assert_eq!(health.record_probe_failure(), 1);
        assert_eq!(health.record_probe_failure(), 2);
        assert!(!health.is_healthy);
        assert!(health.last_check_time.is_some());

        health.record_probe_success();
        assert!(health.is_healthy);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn running_mean_matches_arithmetic_mean() {
        let mut health = ConnectionHealth::default();
        health.record_query_success(Duration::from_millis(10));
        health.record_query_failure();
        health.record_query_success(Duration::from_millis(20));
        health.record_query_success(Duration::from_millis(60));

        assert_eq!(health.total_queries, 4);
        assert_eq!(health.failed_queries, 1);
        assert!((health.average_latency_ms - 30.0).abs() < 1e-9);
        assert_eq!(health.success_rate_percent(), 75.0);
    }

    #[test]
    fn status_serializes_in_camel_case() {
        let mut health = ConnectionHealth::default();
        health.record_probe_success();

        let json = serde_json::to_value(health.status(ConnectionState::Connected))
            .expect("serializable status");
        assert_eq!(json["isHealthy"], true);
        assert_eq!(json["state"], "connected");
        assert_eq!(json["successRatePercent"], 100.0);
    }
}
