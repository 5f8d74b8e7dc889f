//! WebSocket connector to the inference engine
//!
//! One WebSocket per session. Requests go out as JSON text frames, engine
//! events come back as JSON text (or binary) frames and are decoded into
//! [`SessionEvent`]s. A close frame from the engine ends the event stream.

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{future, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use voxrelay_core::{
    ChannelSink, EngineRequest, Error, InferenceConnector, OpenedChannel, Result, SessionEvent,
};

type EngineSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens one engine WebSocket per session
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl InferenceConnector for WebSocketConnector {
    async fn open(&self, session_id: &str) -> Result<OpenedChannel> {
        tracing::debug!(session_id = %session_id, url = %self.url, "Connecting to inference engine");

        let connect = tokio_tungstenite::connect_async(self.url.as_str());
        let (socket, _response) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                Error::Connection(format!(
                    "timed out after {}ms connecting to {}",
                    self.connect_timeout.as_millis(),
                    self.url
                ))
            })?
            .map_err(|e| Error::Connection(format!("connecting to {}: {}", self.url, e)))?;

        let (writer, reader) = socket.split();
        let events = reader
            .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
            .filter_map(|frame| future::ready(decode_frame(frame)))
            .boxed();

        tracing::info!(session_id = %session_id, "Inference engine channel open");
        Ok(OpenedChannel {
            sink: Arc::new(WsSink {
                session_id: session_id.to_string(),
                writer: Mutex::new(writer),
            }),
            events,
        })
    }
}

/// Decode one engine frame; control frames carry no event
fn decode_frame(frame: tungstenite::Result<Message>) -> Option<Result<SessionEvent>> {
    match frame {
        Ok(Message::Text(text)) => Some(serde_json::from_str(&text).map_err(Error::from)),
        Ok(Message::Binary(bytes)) => Some(serde_json::from_slice(&bytes).map_err(Error::from)),
        Ok(_) => None,
        Err(e) => Some(Err(Error::Connection(e.to_string()))),
    }
}

struct WsSink {
    session_id: String,
    writer: Mutex<SplitSink<EngineSocket, Message>>,
}

#[async_trait]
impl ChannelSink for WsSink {
    async fn send(&self, request: EngineRequest) -> Result<()> {
        let text = serde_json::to_string(&request)?;
        self.writer
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| Error::Connection(e.to_string()))
    }

    /// The engine may already have hung up after `streamComplete`; a failed
    /// close handshake still leaves the channel closed
    async fn close(&self) -> Result<()> {
        match self.writer.lock().await.close().await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => {
                tracing::debug!(session_id = %self.session_id, "Inference engine channel closed");
            }
            Err(e) => {
                tracing::debug!(session_id = %self.session_id, "Close handshake with the engine failed: {}", e);
            }
        }
        Ok(())
    }
}
