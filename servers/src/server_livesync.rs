use anyhow::Result;
use lib_livesync::transport::WsTransport;
use lib_livesync::{FeedConnection, FreshnessTracker, RenderScheduler, SubscriptionRegistry, TopicRouter};
use std::sync::Arc;
use std::time::Duration;

#[allow(dead_code)]
mod livesync_logic;
use livesync_logic::{config, logger, monitor, widgets};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config("server_livesync.conf");
    logger::setup_logging(&config.log_dir(), config.log_level(), "server_livesync")?;
    let settings = config.sync_settings()?;
    log::info!("Starting live sync against {:?}", settings.source);

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let registry = Arc::new(SubscriptionRegistry::new());
    let freshness = Arc::new(FreshnessTracker::new());
    let scheduler = Arc::new(RenderScheduler::new());
    let router = Arc::new(TopicRouter::new(
        Arc::clone(&registry),
        Arc::clone(&freshness),
        Arc::clone(&scheduler),
    ));

    let _handles = widgets::mount_console_widgets(&registry, &settings.topics())?;

    let feed = Arc::new(FeedConnection::new(
        settings.source.clone(),
        settings.backoff,
        WsTransport::new(),
    ));
    feed.on_message(Arc::clone(&router));

    let scheduler_handle = tokio::spawn(Arc::clone(&scheduler).run(settings.tick_interval(), shutdown_tx.subscribe()));

    let monitor_handle = tokio::spawn(monitor::run(
        Duration::from_secs(config.monitor_interval_seconds.unwrap_or(5).max(1)),
        settings.stale.clone(),
        Arc::clone(&feed),
        Arc::clone(&registry),
        Arc::clone(&freshness),
        shutdown_tx.subscribe(),
    ));

    let mut feed_handle = tokio::spawn({
        let feed = Arc::clone(&feed);
        async move { feed.open().await }
    });

    // Wait for a shutdown signal, or for the feed to give up on its own
    let feed_outcome = tokio::select! {
        _ = livesync_logic::shutdown_signal() => None,
        outcome = &mut feed_handle => Some(outcome),
    };

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());
    feed.close();

    let feed_outcome = match feed_outcome {
        Some(outcome) => outcome,
        None => feed_handle.await,
    };

    // Wait for components to shut down
    let _ = tokio::try_join!(scheduler_handle, monitor_handle);

    let stats = router.stats();
    log::info!(
        "Shutdown complete. Routed {} messages ({} deliveries, {} for unknown topics).",
        stats.routed,
        stats.deliveries,
        stats.dropped_unknown
    );

    feed_outcome??;
    Ok(())
}
