//! Ctrl-C / SIGTERM signal handling, mirroring the orchestration
//! service's graceful-shutdown race.

use tracing::info;

/// Resolves once either Ctrl-C or (on unix) SIGTERM is received.
pub async fn signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, starting graceful shutdown"),
        _ = terminate => info!("received sigterm, starting graceful shutdown"),
    }
}
