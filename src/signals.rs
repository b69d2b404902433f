//! Watcher task turning SIGINT / SIGTERM into cancellation.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::session::SessionCloser;

/// Spawns the watcher for the process signals.
///
/// On the first signal it cancels `cancel` and force-closes the session.
/// The task also ends, without closing anything, if `cancel` is cancelled
/// elsewhere first.
pub fn spawn_watcher(
    cancel: CancellationToken,
    closer: SessionCloser,
    client_id: String,
) -> JoinHandle<()> {
    spawn_watcher_on(shutdown_signal(), cancel, closer, client_id)
}

/// Same as [`spawn_watcher`] with any future standing in for the signal.
pub fn spawn_watcher_on<F>(
    signal: F,
    cancel: CancellationToken,
    closer: SessionCloser,
    client_id: String,
) -> JoinHandle<()>
where
    F: Future<Output = &'static str> + Send + 'static,
{
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = cancel.cancelled() => return,
            name = signal => name,
        };
        // Cancel before closing: the driver must see the flag when its
        // pending I/O fails.
        cancel.cancel();
        closer.close();
        info!(
            action = "received signal",
            signal = name,
            result = "success",
            info = "closing socket",
            client_id = %client_id
        );
    })
}

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
