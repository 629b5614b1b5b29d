use anyhow::Result;

#[allow(dead_code)]
mod livesync_logic;
use livesync_logic::{config, logger, simulator};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config("feed_simulator.conf");
    logger::setup_logging(&config.log_dir(), config.log_level(), "feed_simulator")?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let server_handle = tokio::spawn(simulator::run(config.clone(), shutdown_tx.clone()));

    livesync_logic::shutdown_signal().await;

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    server_handle.await??;
    log::info!("Shutdown complete.");
    Ok(())
}
