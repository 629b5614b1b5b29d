use chrono::{Duration, Utc};
use clap::Parser;
use lib_livesync::transport::WsTransport;
use lib_livesync::{
    BackoffPolicy, FeedConnection, FreshnessTracker, RenderFrame, RenderScheduler, SourceConfig,
    SubscriptionRegistry, Topic, TopicRouter, WidgetCallback,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Measures per-topic delivery rates through the live sync pipeline", long_about = None)]
struct Args {
    /// Feed endpoint
    #[clap(long, default_value = "ws://127.0.0.1:9003/ws")]
    url: String,

    /// Comma-separated topics to subscribe to
    #[clap(long, value_delimiter = ',', default_value = "price:AAPL,price:TSLA,price:NVDA,sentiment:AAPL,risk:PORTFOLIO,news:GLOBAL")]
    topics: Vec<String>,

    /// Render tick in milliseconds
    #[clap(long, default_value_t = 100)]
    tick_ms: u64,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 60)]
    report_interval_seconds: u64,
}

#[derive(Default)]
struct Stats {
    global_timestamps: VecDeque<chrono::DateTime<Utc>>,
    topic_timestamps: HashMap<String, VecDeque<chrono::DateTime<Utc>>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let topics: Vec<Topic> = args
        .topics
        .iter()
        .map(Topic::new)
        .collect::<Result<_, _>>()?;

    let registry = Arc::new(SubscriptionRegistry::new());
    let freshness = Arc::new(FreshnessTracker::new());
    let scheduler = Arc::new(RenderScheduler::new());
    let router = Arc::new(TopicRouter::new(
        Arc::clone(&registry),
        Arc::clone(&freshness),
        Arc::clone(&scheduler),
    ));

    let stats = Arc::new(Mutex::new(Stats::default()));

    // One counting widget per topic
    let mut handles = Vec::new();
    for topic in &topics {
        let sink = Arc::clone(&stats);
        let callback: WidgetCallback = Arc::new(move |frame: &RenderFrame| -> anyhow::Result<()> {
            let now = Utc::now();
            let mut data = sink.lock().unwrap();
            for update in frame.updates() {
                data.global_timestamps.push_back(now);
                data.topic_timestamps
                    .entry(update.topic().to_string())
                    .or_default()
                    .push_back(now);
            }
            Ok(())
        });
        handles.push(registry.subscribe(&format!("counter:{}", topic), [topic.clone()], callback)?);
    }

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let tick = std::time::Duration::from_millis(args.tick_ms.max(1));
    tokio::spawn(Arc::clone(&scheduler).run(tick, shutdown_tx.subscribe()));

    let config = SourceConfig {
        topics: args.topics.clone(),
        ..SourceConfig::new(args.url.clone())
    };
    let feed = Arc::new(FeedConnection::new(config, BackoffPolicy::default(), WsTransport::new()));
    feed.on_message(Arc::clone(&router));

    // Clone for the reporter task
    let stats_reporter = Arc::clone(&stats);
    let feed_reporter = Arc::clone(&feed);
    let scheduler_reporter = Arc::clone(&scheduler);
    let freshness_reporter = Arc::clone(&freshness);
    let window_seconds = args.report_interval_seconds.max(1);
    tokio::spawn(async move {
        loop {
            sleep(std::time::Duration::from_secs(window_seconds)).await;
            let now = Utc::now();
            let window_start = now - Duration::seconds(window_seconds as i64);

            let mut data = stats_reporter.lock().unwrap();

            while data.global_timestamps.front().is_some_and(|&t| t < window_start) {
                data.global_timestamps.pop_front();
            }
            let global_rate = data.global_timestamps.len();

            let mut rates: Vec<(String, usize)> = Vec::new();
            for (topic, dq) in data.topic_timestamps.iter_mut() {
                while dq.front().is_some_and(|&t| t < window_start) {
                    dq.pop_front();
                }
                if !dq.is_empty() {
                    rates.push((topic.clone(), dq.len()));
                }
            }
            rates.sort_by(|a, b| b.1.cmp(&a.1));

            let report = rates
                .iter()
                .map(|(t, r)| format!("{}: {} renders", t, r))
                .collect::<Vec<_>>()
                .join(", ");

            let sched = scheduler_reporter.stats();
            let feed_stats = feed_reporter.stats();
            let stale = freshness_reporter.stale_topics(lib_livesync::utils::now_millis(), &Default::default());

            println!("\n----- {}s Summary -----", window_seconds);
            println!("Feed: {} | {} messages | {} reconnects", feed_reporter.state(), feed_stats.messages, feed_stats.reconnects);
            println!("Rendered updates: {}", global_rate);
            println!("Topics: {}", if report.is_empty() { "No data" } else { &report });
            println!("Scheduler: {} scheduled, {} coalesced, {} callbacks", sched.scheduled, sched.coalesced, sched.callbacks);
            println!("Stale: {:?}", stale);
            println!("----------------------------\n");
        }
    });

    println!("Connecting to {}... Press Ctrl+C to stop.", args.url);
    let feed_runner = Arc::clone(&feed);
    tokio::select! {
        result = feed_runner.open() => result?,
        _ = tokio::signal::ctrl_c() => {
            feed.close();
        }
    }

    let _ = shutdown_tx.send(());
    for handle in &handles {
        registry.unsubscribe(handle);
    }
    Ok(())
}
