//! Termination signal handling.

use crate::server::Signal;
use std::io;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Wait for the next SIGINT or SIGTERM (Ctrl+C on non-Unix platforms).
#[cfg(unix)]
pub async fn wait_for_termination() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };
    Ok(name)
}

/// Wait for the next SIGINT or SIGTERM (Ctrl+C on non-Unix platforms).
#[cfg(not(unix))]
pub async fn wait_for_termination() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

/// Fire `stop` on the first termination signal.
///
/// A second termination signal exits the process with status 1 without
/// waiting for the graceful shutdown to finish.
pub fn stop_on_termination(stop: Signal) -> JoinHandle<()> {
    tokio::spawn(async move {
        match wait_for_termination().await {
            Ok(name) => {
                info!(signal = name, "received termination signal, shutting down");
                stop.fire();
            }
            Err(e) => {
                error!(error = %e, "failed to listen for termination signals");
                return;
            }
        }

        if let Ok(name) = wait_for_termination().await {
            warn!(signal = name, "received second termination signal, exiting immediately");
            std::process::exit(1);
        }
    })
}
