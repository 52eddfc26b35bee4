//! Signal handling for interrupting a run

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for shutdown signal (SIGTERM, SIGINT, or Ctrl+C)
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                signal::ctrl_c().await.ok();
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, stopping run"),
            _ = signal::ctrl_c() => info!("Received Ctrl+C, stopping run"),
        }
    }

    #[cfg(not(unix))]
    {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, stopping run"),
            Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
        }
    }
}

/// Cancel `token` when a termination signal arrives
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = wait_for_shutdown_signal() => token.cancel(),
        }
    });
}
