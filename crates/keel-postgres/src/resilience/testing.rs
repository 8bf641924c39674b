//! Scripted in-memory database client for resilience tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use diesel::result::ConnectionError;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::{ConnectionManager, ManagerOptions, MonitorConfig};
use crate::{DatabaseClient, PgError, PgResult, PoolConfig};

#[derive(Debug, Default)]
struct Script {
    connects: AtomicU32,
    probes: AtomicU32,
    closes: AtomicU32,
    failing_connects: AtomicU32,
    failing_probes: AtomicU32,
    fatal_connects: AtomicBool,
    connect_delay_ms: AtomicU32,
    probe_delay_ms: AtomicU32,
}

/// Client whose handles are sequence numbers and whose failures are scripted.
#[derive(Debug, Default, Clone)]
pub(crate) struct ScriptedClient {
    script: Arc<Script>,
}

impl ScriptedClient {
    /// The next `n` connects fail with a transient error.
    pub(crate) fn failing_connects(self, n: u32) -> Self {
        self.fail_next_connects(n);
        self
    }

    /// Every connect fails with a fatal error.
    pub(crate) fn fatal_connects(self) -> Self {
        self.script.fatal_connects.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn with_connect_delay(self, delay: Duration) -> Self {
        self.script
            .connect_delay_ms
            .store(delay.as_millis() as u32, Ordering::SeqCst);
        self
    }

    pub(crate) fn with_probe_delay(self, delay: Duration) -> Self {
        self.script
            .probe_delay_ms
            .store(delay.as_millis() as u32, Ordering::SeqCst);
        self
    }

    pub(crate) fn fail_next_connects(&self, n: u32) {
        self.script.failing_connects.store(n, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_probes(&self, n: u32) {
        self.script.failing_probes.store(n, Ordering::SeqCst);
    }

    pub(crate) fn connects(&self) -> u32 {
        self.script.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn probes(&self) -> u32 {
        self.script.probes.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> u32 {
        self.script.closes.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

async fn delay(millis: &AtomicU32) {
    let millis = millis.load(Ordering::SeqCst);
    if millis > 0 {
        tokio::time::sleep(Duration::from_millis(u64::from(millis))).await;
    }
}

#[async_trait::async_trait]
impl DatabaseClient for ScriptedClient {
    type Handle = u32;

    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn connect(&self, _pool_config: &PoolConfig) -> PgResult<u32> {
        let sequence = self.script.connects.fetch_add(1, Ordering::SeqCst) + 1;
        delay(&self.script.connect_delay_ms).await;

        if self.script.fatal_connects.load(Ordering::SeqCst) {
            return Err(PgError::Connection(ConnectionError::InvalidConnectionUrl(
                "scripted invalid url".into(),
            )));
        }
        if take_one(&self.script.failing_connects) {
            return Err(PgError::Connection(ConnectionError::BadConnection(
                "connection refused".into(),
            )));
        }
        Ok(sequence)
    }

    async fn probe(&self, _handle: &u32) -> PgResult<()> {
        self.script.probes.fetch_add(1, Ordering::SeqCst);
        delay(&self.script.probe_delay_ms).await;

        if take_one(&self.script.failing_probes) {
            return Err(PgError::driver(Some("08006"), "connection failure"));
        }
        Ok(())
    }

    async fn close(&self, _handle: u32) {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Default options with a monitor interval far beyond any test timer.
pub(crate) fn test_options() -> ManagerOptions {
    ManagerOptions::default()
        .with_monitor_config(MonitorConfig::default().with_interval(Duration::from_secs(3600)))
}

pub(crate) fn manager_for(client: ScriptedClient) -> ConnectionManager<ScriptedClient> {
    manager_with(client, test_options())
}

pub(crate) fn manager_with(
    client: ScriptedClient,
    options: ManagerOptions,
) -> ConnectionManager<ScriptedClient> {
    ConnectionManager::with_options(client, PoolConfig::default(), options)
}

/// Yields to spawned tasks until `condition` holds.
pub(crate) async fn settle(condition: impl Fn() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached after yielding to spawned tasks");
}

/// Layer that counts every event it sees.
///
/// Install it with `tracing::subscriber::set_default` on a current-thread
/// runtime so that spawned tasks report to it as well.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventCounter {
    events: Arc<Mutex<usize>>,
}

impl EventCounter {
    pub(crate) fn count(&self) -> usize {
        *self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: Subscriber> Layer<S> for EventCounter {
    fn on_event(&self, _event: &Event<'_>, _ctx: Context<'_, S>) {
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }
}
