use tokio_util::sync::CancellationToken;

/// Install a handler that listens for SIGINT and, on Unix, SIGTERM.
///
/// Returns a `CancellationToken` that is cancelled when either arrives.
/// Waiting callers treat it as an interruption; the cluster itself is left
/// for the caller to shut down.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::info!("Received SIGINT, interrupting"),
                Err(e) => {
                    tracing::error!(error = %e, "Could not listen for SIGINT");
                    return;
                }
            },
            _ = terminate() => tracing::info!("Received SIGTERM, interrupting"),
        }
        token_clone.cancel();
    });

    token
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Could not install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
