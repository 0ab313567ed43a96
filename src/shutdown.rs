//! SIGINT/SIGTERM handling for the `build` command.
//!
//! The first signal asks for a shutdown: workers stop claiming and the pool
//! settles in-flight jobs using the configured mode. A second signal forces
//! the issue and kills whatever compilers are still running.

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct ShutdownSignals {
    /// Cancelled by the first signal.
    pub requested: CancellationToken,
    /// Cancelled by the second one.
    pub forced: CancellationToken,
}

/// Starts listening for SIGINT and SIGTERM.
pub fn listen() -> std::io::Result<ShutdownSignals> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let (tx, rx) = mpsc::channel(4);

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = sigterm.recv() => "SIGTERM",
                Some(()) = sigint.recv() => "SIGINT",
                else => break,
            };
            if tx.send(name).await.is_err() {
                break;
            }
        }
    });

    let signals = ShutdownSignals::default();
    tokio::spawn(relay(rx, signals.clone()));
    Ok(signals)
}

async fn relay(mut received: mpsc::Receiver<&'static str>, signals: ShutdownSignals) {
    while let Some(name) = received.recv().await {
        if !signals.requested.is_cancelled() {
            tracing::info!(signal = name, "Shutdown requested, signal again to kill running builds");
            signals.requested.cancel();
        } else {
            tracing::warn!(signal = name, "Second signal received, killing running builds");
            signals.forced.cancel();
            break;
        }
    }
}
