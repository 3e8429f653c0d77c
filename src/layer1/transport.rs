// Event Socket Transport - named events with JSON payloads
// Trait seam over the gateway websocket so sessions can be swapped in tests

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Connection closed")]
    Closed,
}

/// A single named event with a JSON payload.
///
/// Connection-level events are implicit in the session lifecycle: a
/// successful `connect` is the connect event, `next_event` returning `None`
/// is the disconnect event, and an `Err` item is the transport error event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl SocketEvent {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }
}

/// Opens event-socket sessions against a gateway URL
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        client_id: &str,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), TransportError>;
}

/// Write half of a session; single-owner
#[async_trait]
pub trait TransportSink: Send {
    async fn emit(&mut self, event: SocketEvent) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// Read half of a session
#[async_trait]
pub trait TransportStream: Send {
    /// Next inbound event; `None` once the peer has closed the connection
    async fn next_event(&mut self) -> Option<Result<SocketEvent, TransportError>>;
}

// ============================================================================
// Websocket implementation
// ============================================================================

type WsStreamInner = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production transport speaking `{event, data}` JSON text frames over a
/// tungstenite websocket
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        url: &str,
        client_id: &str,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), TransportError> {
        let mut request = websocket_url(url)
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let header = HeaderValue::from_str(client_id)
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        request.headers_mut().insert("Client-id", header);

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url = %url, "Websocket connected");

        let (sink, stream) = stream.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsStream { stream })))
    }
}

/// Gateway URLs carry the https scheme; the socket itself speaks wss
fn websocket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        url.to_string()
    }
}

struct WsSink {
    sink: SplitSink<WsStreamInner, Message>,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn emit(&mut self, event: SocketEvent) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(&event).map_err(|e| TransportError::Send(e.to_string()))?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

struct WsStream {
    stream: SplitStream<WsStreamInner>,
}

#[async_trait]
impl TransportStream for WsStream {
    async fn next_event(&mut self) -> Option<Result<SocketEvent, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => match serde_json::from_str::<SocketEvent>(&text) {
                    Ok(event) => return Some(Ok(event)),
                    Err(error) => {
                        // One malformed frame must not take the session down
                        warn!(error = %error, "Dropping unparseable frame");
                    }
                },
                Ok(Message::Close(_)) => return None,
                // Pings are answered at the protocol layer; binary frames are
                // not part of the gateway protocol
                Ok(_) => {}
                Err(error) => {
                    warn!(error = %error, "Websocket read error");
                    return Some(Err(TransportError::Closed));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_codec_round_trip() {
        let event = SocketEvent::new("request", json!({"requestId": "abc", "type": "subscribe"}));
        let text = serde_json::to_string(&event).unwrap();
        let decoded: SocketEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_frame_without_data_defaults_to_null() {
        let decoded: SocketEvent = serde_json::from_str(r#"{"event": "connect"}"#).unwrap();
        assert_eq!(decoded.event, "connect");
        assert!(decoded.data.is_null());
    }

    #[test]
    fn test_websocket_url_scheme_mapping() {
        assert_eq!(
            websocket_url("https://mt-client-api-v1.example.com/ws?auth-token=t"),
            "wss://mt-client-api-v1.example.com/ws?auth-token=t"
        );
        assert_eq!(websocket_url("http://localhost:8080/ws"), "ws://localhost:8080/ws");
        assert_eq!(websocket_url("wss://already.mapped/ws"), "wss://already.mapped/ws");
    }
}
