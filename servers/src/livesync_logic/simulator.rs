//! Synthetic WebSocket feed for local development.
//!
//! Clients send `{"subscribe": [...]}` / `{"unsubscribe": [...]}` and receive
//! one JSON message per subscribed topic every publish interval. Prices follow
//! a random walk shared by all clients, so two dashboards see the same numbers.

use crate::livesync_logic::config::Config;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use lib_livesync::utils::now_millis;
use lib_livesync::{Message, Topic};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

const HEADLINES: &[&str] = &[
    "Fed holds rates steady",
    "Chipmakers rally on AI demand",
    "Oil slips as inventories build",
    "Treasury yields edge higher",
    "Retail sales beat expectations",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub subscribe: Option<Vec<String>>,
    pub unsubscribe: Option<Vec<String>>,
}

/// Per-topic state for the synthetic series.
#[derive(Debug, Default)]
pub struct SyntheticGenerator {
    prices: HashMap<String, (f64, f64)>,
    sentiment: HashMap<String, f64>,
}

impl SyntheticGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next payload for `topic`, shaped by its class.
    pub fn next_payload<R: Rng>(&mut self, topic: &Topic, rng: &mut R) -> Value {
        match topic.class() {
            "price" => {
                let (open, last) = self.prices.entry(topic.to_string()).or_insert_with(|| {
                    let start = rng.random_range(50.0..500.0);
                    (start, start)
                });
                let step = *last * rng.random_range(-0.005..0.005);
                *last = (*last + step).max(0.01);
                json!({
                    "price": round2(*last),
                    "change": round2(*last - *open),
                    "volume": rng.random_range(100..10_000u64),
                })
            }
            "sentiment" => {
                let score = self.sentiment.entry(topic.to_string()).or_insert(0.0);
                *score = (*score + rng.random_range(-0.1..0.1)).clamp(-1.0, 1.0);
                json!({ "score": round2(*score) })
            }
            "risk" => json!({
                "var": round2(rng.random_range(0.5..5.0)) / 100.0,
                "exposure": rng.random_range(100_000..5_000_000u64),
            }),
            "news" => {
                let headline = HEADLINES[rng.random_range(0..HEADLINES.len())];
                json!({ "headline": headline })
            }
            _ => json!({ "value": rng.random::<f64>() }),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Clone)]
pub struct SimState {
    generator: Arc<Mutex<SyntheticGenerator>>,
    publish_every: Duration,
    drop_every: Option<Duration>,
    auth_token: Option<String>,
    shutdown: broadcast::Sender<()>,
}

impl SimState {
    pub fn new(
        publish_every: Duration,
        drop_every: Option<Duration>,
        auth_token: Option<String>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            generator: Arc::new(Mutex::new(SyntheticGenerator::new())),
            publish_every,
            drop_every,
            auth_token,
            shutdown,
        }
    }

    fn frames_for(&self, topics: &BTreeSet<Topic>) -> Vec<String> {
        let mut generator = self.generator.lock().unwrap_or_else(PoisonError::into_inner);
        let mut rng = rand::rng();
        topics
            .iter()
            .filter_map(|topic| {
                let payload = generator.next_payload(topic, &mut rng);
                Message::new(topic.clone(), payload, now_millis()).to_json().ok()
            })
            .collect()
    }
}

pub fn app(state: SimState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

pub async fn run(config: Config, shutdown: broadcast::Sender<()>) -> anyhow::Result<()> {
    let state = SimState::new(
        Duration::from_millis(config.publish_interval_ms.unwrap_or(250).max(1)),
        config.drop_every_seconds.map(Duration::from_secs),
        config.auth_token.clone(),
        shutdown.clone(),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port.unwrap_or(9003)));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Feed simulator listening on {}", addr);

    let mut shutdown_rx = shutdown.subscribe();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            log::info!("Feed simulator shutting down.");
        })
        .await?;
    Ok(())
}

fn authorized(state: &SimState, headers: &HeaderMap) -> bool {
    match &state.auth_token {
        None => true,
        Some(token) => headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {}", token)),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, headers: HeaderMap, State(state): State<SimState>) -> Response {
    if !authorized(&state, &headers) {
        log::warn!("Rejected feed client with missing or invalid token");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(|socket| handle_socket(socket, state)).into_response()
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

fn apply_client_message(text: &str, topics: &mut BTreeSet<Topic>) {
    let Ok(client_msg) = serde_json::from_str::<ClientMessage>(text) else {
        log::debug!("Ignoring client frame: {}", text);
        return;
    };
    for name in client_msg.subscribe.unwrap_or_default() {
        if let Ok(topic) = Topic::new(&name) {
            topics.insert(topic);
        }
    }
    for name in client_msg.unsubscribe.unwrap_or_default() {
        topics.remove(name.as_str());
    }
}

async fn handle_socket(mut socket: WebSocket, state: SimState) {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    log::info!("Feed client {} connected", client_id);

    let mut topics: BTreeSet<Topic> = BTreeSet::new();
    let mut publish = tokio::time::interval(state.publish_every);
    let mut shutdown = state.shutdown.subscribe();
    let drop_timer = async {
        match state.drop_every {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(drop_timer);

    'session: loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let _ = socket.send(WsMessage::Close(None)).await;
                break;
            }
            _ = &mut drop_timer => {
                log::warn!("Dropping feed client {} to exercise reconnects", client_id);
                let _ = socket.send(WsMessage::Close(None)).await;
                break;
            }
            msg = socket.recv() => match msg {
                Some(Ok(WsMessage::Text(text))) => apply_client_message(text.as_str(), &mut topics),
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = publish.tick() => {
                for frame in state.frames_for(&topics) {
                    if socket.send(WsMessage::Text(frame.into())).await.is_err() {
                        break 'session;
                    }
                }
            }
        }
    }

    log::info!("Feed client {} disconnected", client_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_livesync::transport::WsTransport;
    use lib_livesync::{BackoffPolicy, FeedConnection, SourceConfig, SyncError, Transport};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::sync::mpsc;

    fn topic(name: &str) -> Topic {
        Topic::new(name).unwrap()
    }

    #[test]
    fn test_payload_shapes() {
        let mut generator = SyntheticGenerator::new();
        let mut rng = StdRng::seed_from_u64(7);

        let price = generator.next_payload(&topic("price:AAPL"), &mut rng);
        assert!(price["price"].as_f64().unwrap() > 0.0);
        assert!(price["volume"].is_u64());

        for _ in 0..200 {
            let sentiment = generator.next_payload(&topic("sentiment:AAPL"), &mut rng);
            let score = sentiment["score"].as_f64().unwrap();
            assert!((-1.0..=1.0).contains(&score));
        }

        let news = generator.next_payload(&topic("news:GLOBAL"), &mut rng);
        assert!(HEADLINES.contains(&news["headline"].as_str().unwrap()));
        assert!(generator.next_payload(&topic("misc:X"), &mut rng)["value"].is_f64());
    }

    #[test]
    fn test_price_walk_is_continuous() {
        let mut generator = SyntheticGenerator::new();
        let mut rng = StdRng::seed_from_u64(42);
        let aapl = topic("price:AAPL");
        let mut last = generator.next_payload(&aapl, &mut rng)["price"].as_f64().unwrap();
        for _ in 0..100 {
            let next = generator.next_payload(&aapl, &mut rng)["price"].as_f64().unwrap();
            assert!((next - last).abs() <= last * 0.006 + 0.01);
            last = next;
        }
    }

    #[test]
    fn test_client_messages_edit_topic_set() {
        let mut topics = BTreeSet::new();
        apply_client_message(r#"{"subscribe":["price:AAPL","news:GLOBAL"," "]}"#, &mut topics);
        assert_eq!(topics.len(), 2);
        apply_client_message(r#"{"unsubscribe":["news:GLOBAL"]}"#, &mut topics);
        assert_eq!(topics.into_iter().collect::<Vec<_>>(), vec![topic("price:AAPL")]);
    }

    async fn serve(state: SimState) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app(state)).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_feed_connection_receives_simulated_topics() {
        let (shutdown_tx, _) = broadcast::channel(1);
        let addr = serve(SimState::new(Duration::from_millis(20), None, None, shutdown_tx.clone())).await;

        let config = SourceConfig {
            topics: vec!["price:TSLA".to_string()],
            ..SourceConfig::new(format!("ws://{}/ws", addr))
        };
        let feed = Arc::new(FeedConnection::new(config, BackoffPolicy::default(), WsTransport::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        feed.on_message(tx);
        let runner = tokio::spawn({
            let feed = Arc::clone(&feed);
            async move { feed.open().await }
        });

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.topic.as_str(), "price:TSLA");
        assert!(message.payload["price"].is_f64());

        feed.close();
        assert_eq!(runner.await.unwrap(), Ok(()));
        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_token_is_enforced() {
        let (shutdown_tx, _) = broadcast::channel(1);
        let state = SimState::new(Duration::from_millis(20), None, Some("s3cret".to_string()), shutdown_tx);
        let addr = serve(state).await;
        let endpoint = format!("ws://{}/ws", addr);

        let rejected = WsTransport::new().connect(&SourceConfig::new(endpoint.clone())).await;
        assert!(matches!(rejected, Err(SyncError::ConnectionError(_))));

        let accepted = WsTransport::new()
            .connect(&SourceConfig {
                auth_token: Some("s3cret".to_string()),
                ..SourceConfig::new(endpoint)
            })
            .await;
        assert!(accepted.is_ok());
    }
}
