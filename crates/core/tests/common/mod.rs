//! Scripted inference engine for session tests
//!
//! The mock records every request it receives and answers the way the real
//! engine does for the parts sessions depend on:
//! - `contentStart`/`contentEnd` for each content name are echoed back
//!   (echoing `contentEnd` can be switched off to drive it by hand)
//! - `sessionEnd` is answered with `streamComplete` and the end of the stream,
//!   optionally after a delay

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use voxrelay_core::{
    ChannelSink, ContentType, EngineRequest, Error, EventName, InferenceConnector, Metrics,
    OpenedChannel, Result, Role, SessionConfig, SessionEvent, StreamSession,
};

#[derive(Default)]
struct EngineState {
    requests: Mutex<Vec<EngineRequest>>,
    content_types: Mutex<HashMap<String, ContentType>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<Result<SessionEvent>>>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl EngineState {
    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = self.events_tx.lock().as_ref() {
            let _ = tx.send(Ok(event));
        }
    }

    fn finish(&self) {
        self.events_tx.lock().take();
    }
}

/// Connector handing out one scripted channel per `open`
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<EngineState>,
    echo_content_end: Arc<AtomicBool>,
    fail_open: Arc<AtomicBool>,
    session_end_delay: Arc<Mutex<Option<Duration>>>,
    close_delay: Arc<Mutex<Option<Duration>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        let engine = Self::default();
        engine.echo_content_end.store(true, Ordering::SeqCst);
        engine
    }

    /// Leave `contentEnd` to [`emit`](Self::emit)
    pub fn manual_content_end(self) -> Self {
        self.echo_content_end.store(false, Ordering::SeqCst);
        self
    }

    pub fn failing(self) -> Self {
        self.fail_open.store(true, Ordering::SeqCst);
        self
    }

    /// Hold the answer to `sessionEnd` for `delay`
    pub fn slow_session_end(self, delay: Duration) -> Self {
        *self.session_end_delay.lock() = Some(delay);
        self
    }

    /// Hold channel teardown for `delay`
    pub fn slow_close(self, delay: Duration) -> Self {
        *self.close_delay.lock() = Some(delay);
        self
    }

    pub fn emit(&self, event: SessionEvent) {
        self.state.emit(event);
    }

    /// End the event stream without `streamComplete`
    pub fn drop_stream(&self) {
        self.state.finish();
    }

    pub fn requests(&self) -> Vec<EngineRequest> {
        self.state.requests.lock().clone()
    }

    pub fn request_kinds(&self) -> Vec<&'static str> {
        self.requests().iter().map(EngineRequest::kind).collect()
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Number of channel teardowns
    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceConnector for MockEngine {
    async fn open(&self, session_id: &str) -> Result<OpenedChannel> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!("engine unreachable for {}", session_id)));
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        *self.state.events_tx.lock() = Some(tx);

        let events = UnboundedReceiverStream::new(rx).boxed();
        Ok(OpenedChannel {
            sink: Arc::new(MockSink {
                engine: self.clone(),
            }),
            events,
        })
    }
}

struct MockSink {
    engine: MockEngine,
}

#[async_trait]
impl ChannelSink for MockSink {
    async fn send(&self, request: EngineRequest) -> Result<()> {
        let state = &self.engine.state;
        state.requests.lock().push(request.clone());

        match request {
            EngineRequest::ContentStart {
                content_name,
                content_type,
                role,
                ..
            } => {
                state
                    .content_types
                    .lock()
                    .insert(content_name.clone(), content_type);
                state.emit(SessionEvent::ContentStart {
                    content_id: content_name,
                    role,
                    content_type,
                });
            }
            EngineRequest::ContentEnd { content_name, .. } => {
                if self.engine.echo_content_end.load(Ordering::SeqCst) {
                    let content_type = state
                        .content_types
                        .lock()
                        .remove(&content_name)
                        .unwrap_or(ContentType::Text);
                    state.emit(SessionEvent::ContentEnd {
                        content_id: content_name,
                        content_type,
                        stop_reason: Some("END_TURN".to_string()),
                    });
                }
            }
            EngineRequest::SessionEnd => {
                let delay = *self.engine.session_end_delay.lock();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                state.emit(SessionEvent::StreamComplete);
                state.finish();
            }
            _ => {}
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.engine.state.closes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.engine.close_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.engine.state.finish();
        Ok(())
    }
}

/// Every event published on `session`, in delivery order
pub fn record_events(session: &StreamSession) -> Arc<Mutex<Vec<SessionEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    session
        .events()
        .on_all(move |event| sink.lock().push(event.clone()));
    seen
}

pub fn errors(events: &[SessionEvent]) -> Vec<SessionEvent> {
    events
        .iter()
        .filter(|e| e.name() == EventName::Error)
        .cloned()
        .collect()
}

pub fn session(id: &str, engine: &MockEngine) -> StreamSession {
    session_with(id, engine, SessionConfig::default())
}

pub fn session_with(id: &str, engine: &MockEngine, config: SessionConfig) -> StreamSession {
    StreamSession::new(id, config, Arc::new(engine.clone())).with_metrics(Arc::new(Metrics::new()))
}

pub fn content_end(id: &str) -> SessionEvent {
    SessionEvent::ContentEnd {
        content_id: id.to_string(),
        content_type: ContentType::Text,
        stop_reason: None,
    }
}

pub fn text_output(id: &str, text: &str) -> SessionEvent {
    SessionEvent::TextOutput {
        content_id: id.to_string(),
        role: Role::Assistant,
        content: text.to_string(),
    }
}

/// Poll `condition` on the (paused) clock until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    condition()
}
