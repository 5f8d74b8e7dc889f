//! Local stand-in for the inference engine's WebSocket endpoint
//!
//! Echoes `contentStart`/`contentEnd` for every content name it is sent and
//! answers `sessionEnd` with `streamComplete` followed by a close frame.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use voxrelay_core::{ContentType, EngineRequest, SessionEvent};

#[derive(Clone)]
pub struct StubEngine {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<EngineRequest>>>,
}

impl StubEngine {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_channel(stream, recorded.clone()));
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/v1/stream", self.addr)
    }

    pub fn request_kinds(&self) -> Vec<&'static str> {
        self.requests.lock().unwrap().iter().map(|r| r.kind()).collect()
    }

    pub fn requests(&self) -> Vec<EngineRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Poll until the engine has seen a request of `kind`
    pub async fn wait_for(&self, kind: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !self.request_kinds().contains(&kind) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("engine never saw {}", kind));
    }
}

async fn serve_channel(stream: TcpStream, requests: Arc<Mutex<Vec<EngineRequest>>>) {
    let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut tx, mut rx) = socket.split();
    let mut content_types: HashMap<String, ContentType> = HashMap::new();

    while let Some(Ok(frame)) = rx.next().await {
        let Message::Text(text) = frame else {
            if frame.is_close() {
                break;
            }
            continue;
        };
        let request: EngineRequest = serde_json::from_str(&text).unwrap();
        requests.lock().unwrap().push(request.clone());

        let reply = match request {
            EngineRequest::ContentStart {
                content_name,
                content_type,
                role,
                ..
            } => {
                content_types.insert(content_name.clone(), content_type);
                Some(SessionEvent::ContentStart {
                    content_id: content_name,
                    role,
                    content_type,
                })
            }
            EngineRequest::ContentEnd { content_name, .. } => Some(SessionEvent::ContentEnd {
                content_type: content_types
                    .get(&content_name)
                    .copied()
                    .unwrap_or(ContentType::Text),
                content_id: content_name,
                stop_reason: Some("END_TURN".to_string()),
            }),
            EngineRequest::SessionEnd => {
                let json = serde_json::to_string(&SessionEvent::StreamComplete).unwrap();
                let _ = tx.send(Message::Text(json)).await;
                let _ = tx.send(Message::Close(None)).await;
                None
            }
            _ => None,
        };

        if let Some(event) = reply {
            let json = serde_json::to_string(&event).unwrap();
            if tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    }
}
