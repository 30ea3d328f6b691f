use tracing::error;

/// Waits for SIGTERM or SIGINT.
#[cfg(unix)]
async fn wait_for_signal_impl() -> String {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut terminate, mut interrupt) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(terminate), Ok(interrupt)) => (terminate, interrupt),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to install signal handlers: {}", e);
            return ctrl_c().await;
        }
    };

    tokio::select! {
        _ = terminate.recv() => "SIGTERM".to_string(),
        _ = interrupt.recv() => "SIGINT".to_string(),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal_impl() -> String {
    ctrl_c().await
}

async fn ctrl_c() -> String {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "CTRL_C".to_string(),
        Err(e) => {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<String>().await
        }
    }
}

/// Resolves once a shutdown has been requested.
pub async fn wait_for_stop_signal() -> String {
    wait_for_signal_impl().await
}
