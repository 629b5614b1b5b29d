//! # WebSocket Transport
//!
//! Connects to a JSON-over-WebSocket source with `tokio-tungstenite`.
//!
//! On connect the transport presents the bearer token (if configured), asks
//! for the configured topics with `{"subscribe": [...]}` and starts a ping
//! task at the heartbeat interval. Each text or binary frame must decode to a
//! [`Message`]; frames that do not are logged and skipped.

use futures_util::future::{self, BoxFuture};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::engine::{FeedFrame, Message, MessageStream, SourceConfig, Transport};
use crate::errors::SyncError;

/// Stops the ping task when the session stream is dropped.
struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WsTransport {
    fn connect(&self, config: &SourceConfig) -> BoxFuture<'static, Result<MessageStream, SyncError>> {
        let endpoint = config.endpoint.clone();
        let auth_token = config.auth_token.clone();
        let topics = config.topics.clone();
        let heartbeat = config.heartbeat_interval();

        Box::pin(async move {
            let mut request = endpoint
                .as_str()
                .into_client_request()
                .map_err(|e| SyncError::ConnectionError(format!("invalid endpoint {}: {}", endpoint, e)))?;
            if let Some(token) = auth_token {
                let value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| SyncError::ConnectionError(format!("invalid auth token: {}", e)))?;
                request.headers_mut().insert(AUTHORIZATION, value);
            }

            let (ws_stream, _) = connect_async(request)
                .await
                .map_err(|e| SyncError::ConnectionError(format!("failed to connect to {}: {}", endpoint, e)))?;
            log::info!("WebSocket session established with {}", endpoint);

            let (mut write, read) = ws_stream.split();

            if !topics.is_empty() {
                let subscribe = json!({ "subscribe": topics }).to_string();
                log::debug!("Sending upstream: {}", subscribe);
                write
                    .send(WsMessage::Text(subscribe.into()))
                    .await
                    .map_err(|e| SyncError::ConnectionError(format!("failed to send subscribe: {}", e)))?;
            }

            let guard = HeartbeatGuard(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(heartbeat);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = write.send(WsMessage::Ping(Vec::new().into())).await {
                        log::warn!("Heartbeat ping failed: {}", e);
                        break;
                    }
                }
            }));

            let stream = read.filter_map(move |frame| {
                let _heartbeat = &guard;
                future::ready(decode_frame(frame))
            });
            Ok(stream.boxed())
        })
    }
}

/// Maps one WebSocket frame to a feed frame.
///
/// `None` means the frame carries nothing for the feed (malformed payloads,
/// raw frames). Close frames and socket errors end the session.
pub fn decode_frame(frame: Result<WsMessage, WsError>) -> Option<Result<FeedFrame, SyncError>> {
    match frame {
        Ok(WsMessage::Text(text)) => match Message::from_json(text.as_str()) {
            Ok(message) => Some(Ok(FeedFrame::Data(message))),
            Err(e) => {
                log::warn!("Skipping malformed text frame: {}", e);
                None
            }
        },
        Ok(WsMessage::Binary(data)) => match serde_json::from_slice::<Message>(&data) {
            Ok(message) => Some(Ok(FeedFrame::Data(message))),
            Err(e) => {
                log::warn!("Skipping malformed binary frame ({} bytes): {}", data.len(), e);
                None
            }
        },
        Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => Some(Ok(FeedFrame::Heartbeat)),
        Ok(WsMessage::Close(reason)) => Some(Err(SyncError::ConnectionError(match reason {
            Some(frame) => format!("closed by remote host ({}): {}", frame.code, frame.reason),
            None => "closed by remote host".to_string(),
        }))),
        Ok(WsMessage::Frame(_)) => None,
        Err(e) => Some(Err(SyncError::ConnectionError(format!("read error: {}", e)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn test_decode_text_frame() {
        let frame = decode_frame(Ok(WsMessage::Text(
            r#"{"topic":"price:AAPL","payload":{"price":189.5},"sourceTimestamp":1700000000000}"#.into(),
        )));
        match frame {
            Some(Ok(FeedFrame::Data(message))) => {
                assert_eq!(message.topic.as_str(), "price:AAPL");
                assert_eq!(message.source_timestamp, 1_700_000_000_000);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_decode_binary_frame() {
        let body = br#"{"topic":"risk:VAR","payload":0.021,"sourceTimestamp":5}"#.to_vec();
        assert!(matches!(
            decode_frame(Ok(WsMessage::Binary(body.into()))),
            Some(Ok(FeedFrame::Data(_)))
        ));
    }

    #[test]
    fn test_malformed_frames_are_skipped() {
        assert!(decode_frame(Ok(WsMessage::Text("not json".into()))).is_none());
        assert!(decode_frame(Ok(WsMessage::Text(
            r#"{"topic":"  ","payload":1,"sourceTimestamp":1}"#.into()
        )))
        .is_none());
    }

    #[test]
    fn test_keepalive_and_close() {
        assert!(matches!(
            decode_frame(Ok(WsMessage::Ping(Vec::new().into()))),
            Some(Ok(FeedFrame::Heartbeat))
        ));
        assert!(matches!(
            decode_frame(Ok(WsMessage::Close(None))),
            Some(Err(SyncError::ConnectionError(_)))
        ));
        assert!(matches!(
            decode_frame(Err(WsError::ConnectionClosed)),
            Some(Err(SyncError::ConnectionError(_)))
        ));
    }

    #[tokio::test]
    async fn test_session_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();
            let request = ws.next().await.unwrap().unwrap();
            let request: serde_json::Value = serde_json::from_str(request.to_text().unwrap()).unwrap();
            ws.send(WsMessage::Text(
                r#"{"topic":"price:AAPL","payload":101,"sourceTimestamp":2}"#.into(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
            request
        });

        let config = SourceConfig {
            topics: vec!["price:AAPL".to_string()],
            ..SourceConfig::new(format!("ws://{}", addr))
        };
        let mut stream = WsTransport::new().connect(&config).await.unwrap();

        match stream.next().await {
            Some(Ok(FeedFrame::Data(message))) => assert_eq!(message.payload, serde_json::json!(101)),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(matches!(stream.next().await, Some(Err(SyncError::ConnectionError(_)))));

        let request = server.await.unwrap();
        assert_eq!(request, serde_json::json!({ "subscribe": ["price:AAPL"] }));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = WsTransport::new()
            .connect(&SourceConfig::new(format!("ws://{}", addr)))
            .await;
        assert!(matches!(result, Err(SyncError::ConnectionError(_))));
    }
}
