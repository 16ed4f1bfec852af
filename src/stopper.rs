use tokio::{
    select,
    signal::{
        ctrl_c,
        unix::{SignalKind, signal},
    },
    task::{self, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cancels `cancel_token` on Ctrl+C or SIGTERM. Scenarios observe the token
/// between steps, so a signal never interrupts a step half way.
pub fn run(cancel_token: CancellationToken) -> JoinHandle<()> {
    task::spawn(async move {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => select! {
                _ = cancel_token.cancelled() => info!("Run finished"),
                _ = ctrl_c() => warn!("Ctrl+C received"),
                _ = sigterm.recv() => warn!("SIGTERM received"),
            },
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                select! {
                    _ = cancel_token.cancelled() => info!("Run finished"),
                    _ = ctrl_c() => warn!("Ctrl+C received"),
                }
            }
        }
        cancel_token.cancel();
    })
}
