use std::io;
use std::sync::Arc;

use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::lifecycle::{DrainTrigger, Lifecycle};

/// Completes when the process receives SIGTERM or SIGINT, returning the
/// signal's name.
///
/// Fails only if the signal handlers cannot be registered.
#[cfg(unix)]
pub async fn termination_signal() -> io::Result<&'static str> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = interrupt.recv() => "SIGINT",
    };
    Ok(name)
}

#[cfg(not(unix))]
pub async fn termination_signal() -> io::Result<&'static str> {
    signal::ctrl_c().await?;
    Ok("ctrl-c")
}

/// Starts the drain of `lifecycle` when a termination signal arrives. The
/// watcher exits on its own once a drain has started for any other reason.
pub(crate) fn spawn_signal_watcher(lifecycle: Arc<Lifecycle>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = lifecycle.drain_requested() => {}
            received = termination_signal() => match received {
                Ok(name) => {
                    info!(signal = name, "signal received, shutting down server");
                    lifecycle.begin_drain(DrainTrigger::Signal(name));
                }
                Err(e) => {
                    error!(error = %e, "failed to register signal handlers, server only stops on explicit shutdown");
                }
            },
        }
    })
}
