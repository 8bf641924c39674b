//! Termination signals that start a graceful shutdown.

use std::future::pending;

use crate::TRACING_TARGET_SHUTDOWN;

/// Signal that ended the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT, usually Ctrl+C.
    Interrupt,
    /// SIGTERM, sent by process supervisors.
    Terminate,
}

impl Signal {
    /// Conventional name of the signal.
    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
        }
    }
}

/// Resolves on the first SIGINT or SIGTERM.
///
/// A signal whose listener cannot be installed is logged and ignored; the
/// other one still ends the wait.
pub async fn wait_for_signal() -> Signal {
    tokio::select! {
        () = interrupt() => Signal::Interrupt,
        () = terminate() => Signal::Terminate,
    }
}

async fn interrupt() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(
            target: TRACING_TARGET_SHUTDOWN,
            error = %err,
            "Cannot listen for SIGINT"
        );
        pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(err) => {
            tracing::error!(
                target: TRACING_TARGET_SHUTDOWN,
                error = %err,
                "Cannot listen for SIGTERM"
            );
            pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    pending::<()>().await;
}
