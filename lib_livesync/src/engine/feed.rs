//! # Feed Connection
//!
//! Owns exactly one logical connection to an upstream source and hides
//! reconnection from everything downstream.
//!
//! ## State machine
//!
//! ```text
//! Connecting -> Open -> Degraded -> Open        (recovered)
//!                       Degraded -> Closed      (retry budget exhausted)
//! Closed -> Connecting                           (explicit reopen() only)
//! ```
//!
//! Transport failures move the connection to `Degraded` and are retried with
//! [`BackoffPolicy`]. The consecutive-failure counter resets every time a
//! session opens. Once more than `max_attempts` retries have failed in a row the
//! connection closes and `open()` returns
//! [`SyncError::TerminalConnectionFailure`], the only error that leaves this
//! module.
//!
//! A session is also failed when nothing (data or heartbeat) arrives within the
//! silent timeout, which catches half-open "zombie" sockets.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::engine::backoff::BackoffPolicy;
use crate::engine::message::Message;
use crate::errors::SyncError;
use crate::utils::now_millis;

/// Lifecycle of a [`FeedConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// First attempt of a session run (after `open()` or `reopen()`).
    Connecting,
    /// A session is established and messages are flowing.
    Open,
    /// The last attempt failed; waiting to retry.
    Degraded,
    /// Not connected and not retrying. Terminal until `reopen()`.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Open => "Open",
            ConnectionState::Degraded => "Degraded",
            ConnectionState::Closed => "Closed",
        };
        f.write_str(label)
    }
}

/// Link quality derived from the latency of the most recent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl LinkQuality {
    pub fn from_latency(latency_ms: u64) -> Self {
        match latency_ms {
            0..=14 => LinkQuality::Excellent,
            15..=29 => LinkQuality::Good,
            30..=49 => LinkQuality::Fair,
            _ => LinkQuality::Poor,
        }
    }
}

impl fmt::Display for LinkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// # Source Configuration
///
/// Values only; nothing here is negotiated with the source.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceConfig {
    /// Transport endpoint, e.g. `ws://127.0.0.1:9003/ws`.
    pub endpoint: String,
    /// Bearer token presented to the source, if it requires one.
    pub auth_token: Option<String>,
    /// Interval at which the transport sends keep-alive pings.
    pub heartbeat_interval_ms: u64,
    /// Session is failed after this long without any frame.
    /// Defaults to three heartbeat intervals.
    pub silent_timeout_ms: Option<u64>,
    /// Topics requested from the source when a session opens.
    pub topics: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:9003/ws".to_string(),
            auth_token: None,
            heartbeat_interval_ms: 10_000,
            silent_timeout_ms: None,
            topics: Vec::new(),
        }
    }
}

impl SourceConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn silent_timeout(&self) -> Duration {
        let ms = self
            .silent_timeout_ms
            .unwrap_or_else(|| self.heartbeat_interval_ms.saturating_mul(3));
        Duration::from_millis(ms.max(1))
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("endpoint", &self.endpoint)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("silent_timeout_ms", &self.silent_timeout_ms)
            .field("topics", &self.topics)
            .finish()
    }
}

/// One item read from a transport session.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedFrame {
    Data(Message),
    /// Keep-alive traffic (ping/pong). Resets the silent timeout only.
    Heartbeat,
}

/// A live transport session. Ends (`None`) or yields `Err` when the session drops.
pub type MessageStream = BoxStream<'static, Result<FeedFrame, SyncError>>;

/// # Transport
///
/// The seam between the connection policy and the wire. Implementations open a
/// session and return it as a stream; dropping the stream must release the
/// underlying resources.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self, config: &SourceConfig) -> BoxFuture<'static, Result<MessageStream, SyncError>>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn connect(&self, config: &SourceConfig) -> BoxFuture<'static, Result<MessageStream, SyncError>> {
        (**self).connect(config)
    }
}

/// The single downstream consumer of a feed.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: Message);
}

impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    fn handle(&self, message: Message) {
        (**self).handle(message)
    }
}

impl MessageHandler for mpsc::UnboundedSender<Message> {
    fn handle(&self, message: Message) {
        if self.send(message).is_err() {
            log::debug!("Message receiver dropped; discarding message");
        }
    }
}

/// Counters since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub messages: u64,
    pub reconnects: u64,
    pub consecutive_failures: u32,
    /// Latency of the last message (`now - sourceTimestamp`), if any arrived.
    pub last_latency_ms: Option<u64>,
}

#[derive(Default)]
struct Counters {
    messages: AtomicU64,
    reconnects: AtomicU64,
    consecutive_failures: AtomicU32,
    // u64::MAX until the first message
    last_latency_ms: AtomicU64,
}

enum SessionEnd {
    Cancelled,
    Failed(SyncError),
}

/// Resets the `running` flag even when the driving future is dropped.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// # Feed Connection
///
/// Typically wrapped in an `Arc` so that `open()` can run on its own task while
/// other tasks observe the state or call `close()`.
pub struct FeedConnection {
    config: SourceConfig,
    backoff: BackoffPolicy,
    transport: Box<dyn Transport>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: Mutex<CancellationToken>,
    running: AtomicBool,
    counters: Counters,
}

impl FeedConnection {
    pub fn new(config: SourceConfig, backoff: BackoffPolicy, transport: impl Transport) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        let counters = Counters::default();
        counters.last_latency_ms.store(u64::MAX, Ordering::Relaxed);
        Self {
            config,
            backoff,
            transport: Box::new(transport),
            handler: RwLock::new(None),
            state_tx,
            shutdown: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
            counters,
        }
    }

    /// Registers the single downstream consumer, replacing any previous one.
    pub fn on_message(&self, handler: impl MessageHandler) {
        let mut slot = self.handler.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            log::warn!("Replacing the feed's message handler");
        }
        *slot = Some(Arc::new(handler));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch channel following every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn stats(&self) -> FeedStats {
        let latency = self.counters.last_latency_ms.load(Ordering::Relaxed);
        FeedStats {
            messages: self.counters.messages.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            consecutive_failures: self.counters.consecutive_failures.load(Ordering::Relaxed),
            last_latency_ms: (latency != u64::MAX).then_some(latency),
        }
    }

    /// Quality of the link judged by the last message's latency.
    pub fn link_quality(&self) -> Option<LinkQuality> {
        self.stats().last_latency_ms.map(LinkQuality::from_latency)
    }

    /// Connects and keeps the connection alive until `close()` is called
    /// (returns `Ok`) or the retry budget is exhausted (returns
    /// `TerminalConnectionFailure`, exactly once per run).
    pub async fn open(&self) -> Result<(), SyncError> {
        let token = self.current_token();
        if token.is_cancelled() {
            return Err(SyncError::ConnectionError(
                "feed connection was closed; call reopen() to connect again".to_string(),
            ));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SyncError::ConnectionError(
                "feed connection is already open".to_string(),
            ));
        }
        let _guard = RunGuard(&self.running);
        self.drive(token).await
    }

    /// Leaves `Closed` and runs the connection again with a fresh retry budget.
    pub async fn reopen(&self) -> Result<(), SyncError> {
        {
            let mut shutdown = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
            if shutdown.is_cancelled() {
                *shutdown = CancellationToken::new();
            }
        }
        self.counters.consecutive_failures.store(0, Ordering::Relaxed);
        log::info!("Reopening feed connection to {}", self.config.endpoint);
        self.open().await
    }

    /// Terminal and idempotent. Stops any running session and retry wait; the
    /// transport stream is dropped by the driving task.
    pub fn close(&self) {
        let token = self.current_token();
        if !token.is_cancelled() {
            log::info!("Closing feed connection to {}", self.config.endpoint);
            token.cancel();
        }
        self.set_state(ConnectionState::Closed);
    }

    fn current_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            log::info!("Feed connection state: {} -> {}", previous, next);
        }
    }

    async fn drive(&self, token: CancellationToken) -> Result<(), SyncError> {
        let mut failures: u32 = 0;
        self.set_state(ConnectionState::Connecting);

        loop {
            log::info!("Connecting to feed: {}", self.config.endpoint);
            let attempt = tokio::select! {
                _ = token.cancelled() => return self.closed(),
                result = self.transport.connect(&self.config) => result,
            };

            let error = match attempt {
                Ok(stream) => {
                    failures = 0;
                    self.counters.consecutive_failures.store(0, Ordering::Relaxed);
                    self.set_state(ConnectionState::Open);
                    match self.pump(stream, &token).await {
                        SessionEnd::Cancelled => return self.closed(),
                        SessionEnd::Failed(e) => e,
                    }
                }
                Err(e) => e,
            };

            failures = failures.saturating_add(1);
            self.counters.consecutive_failures.store(failures, Ordering::Relaxed);

            if !self.backoff.allows_retry(failures) {
                token.cancel();
                self.set_state(ConnectionState::Closed);
                log::error!(
                    "Feed connection to {} failed {} times in a row; giving up: {}",
                    self.config.endpoint,
                    failures,
                    error
                );
                return Err(SyncError::TerminalConnectionFailure {
                    attempts: failures,
                    last_error: error.to_string(),
                });
            }

            self.set_state(ConnectionState::Degraded);
            let delay = self.backoff.delay(failures);
            log::warn!(
                "{}. Retrying in {} ms (attempt {}/{})",
                error,
                delay.as_millis(),
                failures,
                self.backoff.max_attempts
            );

            tokio::select! {
                _ = token.cancelled() => return self.closed(),
                _ = tokio::time::sleep(delay) => {}
            }
            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn closed(&self) -> Result<(), SyncError> {
        self.set_state(ConnectionState::Closed);
        Ok(())
    }

    async fn pump(&self, mut stream: MessageStream, token: &CancellationToken) -> SessionEnd {
        let silent_timeout = self.config.silent_timeout();
        loop {
            tokio::select! {
                _ = token.cancelled() => return SessionEnd::Cancelled,
                next = tokio::time::timeout(silent_timeout, stream.next()) => match next {
                    Ok(Some(Ok(FeedFrame::Data(message)))) => self.deliver(message),
                    Ok(Some(Ok(FeedFrame::Heartbeat))) => {}
                    Ok(Some(Err(e))) => return SessionEnd::Failed(e),
                    Ok(None) => {
                        return SessionEnd::Failed(SyncError::ConnectionError(
                            "stream closed by remote host".to_string(),
                        ))
                    }
                    Err(_) => {
                        return SessionEnd::Failed(SyncError::ConnectionError(format!(
                            "no data for {} ms",
                            silent_timeout.as_millis()
                        )))
                    }
                }
            }
        }
    }

    fn deliver(&self, message: Message) {
        self.counters.messages.fetch_add(1, Ordering::Relaxed);
        let latency = now_millis().saturating_sub(message.source_timestamp);
        self.counters.last_latency_ms.store(latency, Ordering::Relaxed);

        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler.handle(message),
            None => log::trace!("No message handler registered; dropping '{}'", message.topic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::message::Topic;
    use futures_util::stream;
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    enum Step {
        Fail,
        /// Yields the frames, then either stays silent or ends the session.
        Session(Vec<FeedFrame>, bool),
    }

    struct ScriptedTransport {
        script: Mutex<VecDeque<Step>>,
        attempts: Mutex<Vec<Instant>>,
    }

    impl ScriptedTransport {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.into()),
                attempts: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }

        fn gaps(&self) -> Vec<Duration> {
            self.attempts().windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    impl Transport for ScriptedTransport {
        fn connect(&self, _config: &SourceConfig) -> BoxFuture<'static, Result<MessageStream, SyncError>> {
            self.attempts.lock().unwrap().push(Instant::now());
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Fail);
            Box::pin(async move {
                match step {
                    Step::Fail => Err(SyncError::ConnectionError("connection refused".to_string())),
                    Step::Session(frames, keep_open) => {
                        let frames = stream::iter(frames.into_iter().map(Ok));
                        let stream: MessageStream = if keep_open {
                            frames.chain(stream::pending()).boxed()
                        } else {
                            frames.boxed()
                        };
                        Ok(stream)
                    }
                }
            })
        }
    }

    fn data(topic: &str, payload: serde_json::Value) -> FeedFrame {
        FeedFrame::Data(Message::new(Topic::new(topic).unwrap(), payload, now_millis()))
    }

    fn deterministic(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base_ms: 1_000,
            cap_ms: 30_000,
            max_attempts,
            jitter: false,
        }
    }

    fn assert_close(actual: Duration, expected_ms: u64) {
        let actual_ms = actual.as_millis() as i128;
        assert!(
            (actual_ms - expected_ms as i128).abs() <= 10,
            "expected ~{} ms, got {} ms",
            expected_ms,
            actual_ms
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_back_off_then_open() {
        let transport = ScriptedTransport::new(vec![
            Step::Fail,
            Step::Fail,
            Step::Fail,
            Step::Session(vec![data("price:AAPL", json!(100))], true),
        ]);
        let feed = Arc::new(FeedConnection::new(
            SourceConfig::default(),
            deterministic(10),
            Arc::clone(&transport),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        feed.on_message(tx);

        let runner = tokio::spawn({
            let feed = Arc::clone(&feed);
            async move { feed.open().await }
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload, json!(100));
        assert_eq!(feed.state(), ConnectionState::Open);

        let gaps = transport.gaps();
        assert_eq!(gaps.len(), 3);
        assert_close(gaps[0], 1_000);
        assert_close(gaps[1], 2_000);
        assert_close(gaps[2], 4_000);
        assert_eq!(feed.stats().reconnects, 3);
        assert_eq!(feed.stats().consecutive_failures, 0);

        feed.close();
        assert_eq!(runner.await.unwrap(), Ok(()));
        assert_eq!(feed.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_is_terminal() {
        let transport = ScriptedTransport::new(Vec::new());
        let feed = FeedConnection::new(
            SourceConfig::default(),
            BackoffPolicy::default(),
            Arc::clone(&transport),
        );
        let mut states = feed.subscribe_state();

        let result = feed.open().await;

        match result {
            Err(SyncError::TerminalConnectionFailure { attempts, .. }) => assert_eq!(attempts, 11),
            other => panic!("expected terminal failure, got {:?}", other),
        }
        assert_eq!(transport.attempts().len(), 11);
        assert_eq!(feed.state(), ConnectionState::Closed);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Closed);

        // No further attempts happen on their own.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.attempts().len(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopen_after_terminal_failure() {
        let transport = ScriptedTransport::new(vec![Step::Fail, Step::Fail]);
        let feed = Arc::new(FeedConnection::new(
            SourceConfig::default(),
            deterministic(1),
            Arc::clone(&transport),
        ));
        assert!(matches!(
            feed.open().await,
            Err(SyncError::TerminalConnectionFailure { attempts: 2, .. })
        ));
        // Closed is left only through reopen().
        assert!(matches!(feed.open().await, Err(SyncError::ConnectionError(_))));

        transport
            .script
            .lock()
            .unwrap()
            .push_back(Step::Session(vec![data("news:GLOBAL", json!("headline"))], true));
        let (tx, mut rx) = mpsc::unbounded_channel();
        feed.on_message(tx);

        let runner = tokio::spawn({
            let feed = Arc::clone(&feed);
            async move { feed.reopen().await }
        });
        assert_eq!(rx.recv().await.unwrap().topic.as_str(), "news:GLOBAL");
        assert_eq!(feed.state(), ConnectionState::Open);

        feed.close();
        assert_eq!(runner.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_session_recovers() {
        let transport = ScriptedTransport::new(vec![
            Step::Session(vec![data("price:AAPL", json!(1))], false),
            Step::Session(vec![data("price:AAPL", json!(2))], true),
        ]);
        let feed = Arc::new(FeedConnection::new(
            SourceConfig::default(),
            deterministic(10),
            Arc::clone(&transport),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        feed.on_message(tx);

        let runner = tokio::spawn({
            let feed = Arc::clone(&feed);
            async move { feed.open().await }
        });

        assert_eq!(rx.recv().await.unwrap().payload, json!(1));
        assert_eq!(rx.recv().await.unwrap().payload, json!(2));
        assert_eq!(feed.state(), ConnectionState::Open);
        assert_close(transport.gaps()[0], 1_000);
        assert_eq!(feed.stats().messages, 2);

        feed.close();
        assert_eq!(runner.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_session_is_failed_by_watchdog() {
        let transport = ScriptedTransport::new(vec![
            Step::Session(vec![FeedFrame::Heartbeat], true),
            Step::Session(vec![data("risk:VAR", json!(0.02))], true),
        ]);
        let config = SourceConfig {
            silent_timeout_ms: Some(3_000),
            ..Default::default()
        };
        let feed = Arc::new(FeedConnection::new(config, deterministic(10), Arc::clone(&transport)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        feed.on_message(tx);

        let runner = tokio::spawn({
            let feed = Arc::clone(&feed);
            async move { feed.open().await }
        });

        assert_eq!(rx.recv().await.unwrap().topic.as_str(), "risk:VAR");
        // 3s of silence, then the 1s backoff.
        assert_close(transport.gaps()[0], 4_000);

        feed.close();
        assert_eq!(runner.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_open() {
        let feed = FeedConnection::new(
            SourceConfig::default(),
            BackoffPolicy::default(),
            ScriptedTransport::new(Vec::new()),
        );
        feed.close();
        feed.close();
        assert_eq!(feed.state(), ConnectionState::Closed);
        assert!(matches!(feed.open().await, Err(SyncError::ConnectionError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_open_is_rejected_while_running() {
        let transport = ScriptedTransport::new(vec![Step::Session(Vec::new(), true)]);
        let feed = Arc::new(FeedConnection::new(
            SourceConfig::default(),
            deterministic(10),
            transport,
        ));
        let mut states = feed.subscribe_state();
        let runner = tokio::spawn({
            let feed = Arc::clone(&feed);
            async move { feed.open().await }
        });
        states.wait_for(|s| *s == ConnectionState::Open).await.unwrap();

        assert!(matches!(feed.open().await, Err(SyncError::ConnectionError(_))));
        feed.close();
        assert_eq!(runner.await.unwrap(), Ok(()));
    }

    #[test]
    fn test_link_quality_bands() {
        assert_eq!(LinkQuality::from_latency(8), LinkQuality::Excellent);
        assert_eq!(LinkQuality::from_latency(22), LinkQuality::Good);
        assert_eq!(LinkQuality::from_latency(45), LinkQuality::Fair);
        assert_eq!(LinkQuality::from_latency(120), LinkQuality::Poor);
    }

    #[test]
    fn test_source_config_defaults_and_redaction() {
        let config = SourceConfig {
            auth_token: Some("secret-token".to_string()),
            heartbeat_interval_ms: 5_000,
            ..SourceConfig::new("ws://feed.local/ws")
        };
        assert_eq!(config.silent_timeout(), Duration::from_secs(15));
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("<redacted>"));
    }
}
