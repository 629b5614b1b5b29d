pub mod config;
pub mod logger;
pub mod monitor;
pub mod simulator;
pub mod widgets;

use tokio::signal;

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let terminate = async {
        #[cfg(unix)]
        {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut term_signal) => {
                    term_signal.recv().await;
                    log::info!("SIGTERM received, initiating shutdown.");
                }
                Err(e) => {
                    log::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            // On non-unix platforms, just wait forever.
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => log::info!("Ctrl-C received, initiating shutdown."),
                Err(e) => log::error!("Failed to listen for Ctrl-C: {}", e),
            }
        }
        _ = terminate => {}
    }
}
