//! Streaming session state machine
//!
//! A [`StreamSession`] owns one duplex channel to the inference engine and
//! walks through
//!
//! ```text
//! Created ─initiate─▶ PromptOpen ⇄ AudioOpen
//!                        │  ▲
//!              end_prompt│  │start_prompt
//!                        ▼  │
//!                     PromptEnded
//!
//! any ─close/force_close─▶ Closing ─▶ Closed
//! ```
//!
//! Caller operations are serialized on an async operation lane. Teardown is
//! guarded by a check-and-set latch: whichever of `close`, `force_close`,
//! the reaper or the shutdown drain reaches it first closes the channel, and
//! every later attempt is a no-op.

mod dispatch;
mod outbound;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::{ContentEndWait, ContentWaiters, EventBus};
use crate::channel::{ChannelSink, InferenceConnector, OpenedChannel};
use crate::config::SessionConfig;
use crate::content::{ContentTracker, Modality};
use crate::events::{ContentType, Role, SessionEvent};
use crate::metrics::{global_metrics, Metrics};
use crate::protocol::{AudioFormat, EngineRequest};
use crate::tools::ToolHandler;
use crate::{Error, Result};

use dispatch::EventPump;
use outbound::OutboundQueue;

pub(crate) use outbound::cancelled;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, no channel yet
    Created,
    /// Prompt open, no audio block open
    PromptOpen,
    /// Prompt open with one audio block open
    AudioOpen,
    /// Channel open, prompt ended; a new prompt may start
    PromptEnded,
    /// Teardown in progress
    Closing,
    /// Channel torn down
    Closed,
}

impl SessionState {
    fn prompt_is_open(&self) -> bool {
        matches!(self, SessionState::PromptOpen | SessionState::AudioOpen)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::PromptOpen => write!(f, "prompt_open"),
            SessionState::AudioOpen => write!(f, "audio_open"),
            SessionState::PromptEnded => write!(f, "prompt_ended"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// How a bounded close finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Graceful,
    Forced,
}

/// State shared with the event pump
pub(crate) struct SessionInner {
    pub(crate) state: SessionState,
    pub(crate) content: ContentTracker,
    /// Name of the open prompt; `None` outside `PromptOpen`/`AudioOpen`
    pub(crate) prompt_name: Option<String>,
    /// Current system instruction, resent at every prompt start
    system_prompt: Option<String>,
}

/// One caller's duplex session with the inference engine
pub struct StreamSession {
    id: String,
    config: SessionConfig,
    connector: Arc<dyn InferenceConnector>,
    tools: Option<Arc<dyn ToolHandler>>,
    bus: Arc<EventBus>,
    waiters: Arc<ContentWaiters>,
    inner: Arc<Mutex<SessionInner>>,
    metrics: Arc<Metrics>,

    /// Serializes caller operations; never taken by teardown
    op_lane: tokio::sync::Mutex<()>,

    outbound: Mutex<Option<OutboundQueue>>,
    sink: Mutex<Option<Arc<dyn ChannelSink>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,

    /// Set once any close path starts; rejects new caller operations
    closing: Arc<AtomicBool>,
    /// Teardown latch; the first swap wins
    torn_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
}

impl StreamSession {
    pub fn new(
        id: impl Into<String>,
        config: SessionConfig,
        connector: Arc<dyn InferenceConnector>,
    ) -> Self {
        let id = id.into();
        let system_prompt = config.default_system_prompt.clone();
        let (shutdown_tx, _) = watch::channel(false);
        let (closed_tx, _) = watch::channel(false);

        Self {
            bus: Arc::new(EventBus::new(id.clone())),
            id,
            config,
            connector,
            tools: None,
            waiters: Arc::new(ContentWaiters::new()),
            inner: Arc::new(Mutex::new(SessionInner {
                state: SessionState::Created,
                content: ContentTracker::new(),
                prompt_name: None,
                system_prompt,
            })),
            metrics: global_metrics(),
            op_lane: tokio::sync::Mutex::new(()),
            outbound: Mutex::new(None),
            sink: Mutex::new(None),
            writer: Mutex::new(None),
            pump: Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
            torn_down: AtomicBool::new(false),
            shutdown_tx,
            closed_tx,
        }
    }

    /// Attach a tool handler; its tools are advertised at every prompt start
    pub fn with_tools(mut self, tools: Arc<dyn ToolHandler>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Record counters into `metrics` instead of the global instance
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Event bus carrying this session's outbound events
    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Ids of content blocks currently open on our side
    pub fn open_content(&self) -> Vec<String> {
        self.inner.lock().content.open_ids()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Wait until the channel has been torn down
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Report a per-session failure to the caller as an `error` event
    pub fn emit_error(&self, source: &str, err: &Error) {
        tracing::warn!(session_id = %self.id, source, "Session error: {}", err);
        self.metrics.error_emitted();
        self.bus.publish(&SessionEvent::error(source, err));
    }

    /// Open the duplex channel and the first prompt
    pub async fn initiate(&self) -> Result<()> {
        let _lane = self.op_lane.lock().await;
        self.initiate_locked().await
    }

    /// Open a prompt: initiates a fresh session, reopens after `end_prompt`,
    /// and is a no-op while a prompt is open
    pub async fn start_prompt(&self) -> Result<()> {
        let _lane = self.op_lane.lock().await;
        self.ensure_accepting("start_prompt")?;
        match self.state() {
            SessionState::Created => self.initiate_locked().await,
            SessionState::PromptEnded => self.open_prompt_locked().await,
            SessionState::PromptOpen | SessionState::AudioOpen => Ok(()),
            state => Err(Error::invalid_state("start_prompt", format!("session is {}", state))),
        }
    }

    /// Set or refresh the system instruction
    ///
    /// Sent right away when the prompt is open and no audio is streaming;
    /// otherwise it goes out right after the next prompt start.
    pub async fn setup_system_prompt(&self, prompt_id: Option<String>, text: impl Into<String>) -> Result<()> {
        let _lane = self.op_lane.lock().await;
        self.ensure_accepting("setup_system_prompt")?;
        let text = text.into();

        let send_now = {
            let mut inner = self.inner.lock();
            inner.system_prompt = Some(text.clone());
            inner.state == SessionState::PromptOpen
        };

        if send_now {
            let content_id = prompt_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            self.send_text_locked(&content_id, &text, Role::System).await?;
        } else {
            tracing::debug!(session_id = %self.id, state = %self.state(), "System prompt deferred to next prompt start");
        }
        Ok(())
    }

    /// Open an audio content block; returns its content id
    pub async fn setup_start_audio(&self, format: AudioFormat) -> Result<String> {
        let _lane = self.op_lane.lock().await;
        self.ensure_accepting("setup_start_audio")?;
        let content_id = uuid::Uuid::new_v4().to_string();

        let prompt_name = {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::PromptOpen => {}
                SessionState::AudioOpen => {
                    return Err(Error::invalid_state(
                        "setup_start_audio",
                        "an audio content block is already open",
                    ))
                }
                state => {
                    return Err(Error::invalid_state(
                        "setup_start_audio",
                        format!("no prompt is open (session is {})", state),
                    ))
                }
            }
            inner.content.open(content_id.clone(), Modality::Audio, Role::User)?;
            inner.prompt_name.clone().unwrap_or_default()
        };

        let request = EngineRequest::ContentStart {
            prompt_name,
            content_name: content_id.clone(),
            content_type: ContentType::Audio,
            role: Role::User,
            audio_input: Some(format),
            tool_use_id: None,
        };
        if let Err(e) = self.send(request).await {
            self.inner.lock().content.acknowledge(&content_id);
            return Err(e);
        }

        self.inner.lock().state = SessionState::AudioOpen;
        tracing::debug!(session_id = %self.id, content_id = %content_id, "Audio content started");
        Ok(content_id)
    }

    /// Forward one audio chunk into the open audio block
    ///
    /// Returns false if the chunk was shed by the drop-newest policy.
    pub async fn stream_audio(&self, chunk: &[u8]) -> Result<bool> {
        let _lane = self.op_lane.lock().await;
        self.ensure_accepting("stream_audio")?;

        let (prompt_name, content_name) = {
            let mut inner = self.inner.lock();
            let Some(audio_id) = inner.content.open_audio().map(str::to_string) else {
                return Err(Error::invalid_state(
                    "stream_audio",
                    "no audio content block is open",
                ));
            };
            inner.content.mark_active(&audio_id)?;
            (inner.prompt_name.clone().unwrap_or_default(), audio_id)
        };

        let request = EngineRequest::AudioInput {
            prompt_name,
            content_name,
            content: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, chunk),
        };

        let queue = self.queue()?;
        let forwarded = queue.send_audio(request).await?;
        if !forwarded {
            tracing::debug!(session_id = %self.id, bytes = chunk.len(), "Audio chunk dropped under backpressure");
        }
        Ok(forwarded)
    }

    /// Close the open audio block; no-op when none is open
    pub async fn end_audio_content(&self) -> Result<()> {
        let _lane = self.op_lane.lock().await;
        self.ensure_accepting("end_audio_content")?;
        self.end_audio_locked().await
    }

    /// Inject a text block and return its completion
    ///
    /// The returned [`ContentEndWait`] resolves when the engine reports
    /// `contentEnd` for `content_id`; only then has the text been consumed.
    pub async fn send_text_content(
        &self,
        content_id: impl Into<String>,
        text: impl AsRef<str>,
        role: Role,
    ) -> Result<ContentEndWait> {
        let _lane = self.op_lane.lock().await;
        self.ensure_accepting("send_text_content")?;
        let content_id = content_id.into();

        let state = self.state();
        if state != SessionState::PromptOpen {
            return Err(Error::invalid_state(
                "send_text_content",
                format!("text needs an open prompt without audio (session is {})", state),
            ));
        }

        let wait = self.waiters.register(content_id.clone());
        if let Err(e) = self.send_text_locked(&content_id, text.as_ref(), role).await {
            self.waiters.cancel(&content_id);
            return Err(e);
        }
        Ok(wait)
    }

    /// End the prompt once every content block has ended
    pub async fn end_prompt(&self) -> Result<()> {
        let _lane = self.op_lane.lock().await;
        self.ensure_accepting("end_prompt")?;

        let prompt_name = {
            let inner = self.inner.lock();
            if !inner.state.prompt_is_open() {
                return Err(Error::invalid_state(
                    "end_prompt",
                    format!("no prompt is open (session is {})", inner.state),
                ));
            }
            let open = inner.content.open_ids();
            if !open.is_empty() {
                return Err(Error::invalid_state(
                    "end_prompt",
                    format!("content blocks still open: {}", open.join(", ")),
                ));
            }
            inner.prompt_name.clone().unwrap_or_default()
        };

        self.send(EngineRequest::PromptEnd { prompt_name }).await?;
        let mut inner = self.inner.lock();
        inner.state = SessionState::PromptEnded;
        inner.prompt_name = None;
        inner.content.clear();
        Ok(())
    }

    /// Graceful close: end audio, end prompt, end session, drain, tear down
    ///
    /// A second call, or a call after `force_close`, returns `Ok` at once.
    pub async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            tracing::debug!(session_id = %self.id, "Close requested but session is already closing");
            return Ok(());
        }
        let _lane = self.op_lane.lock().await;

        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            if previous != SessionState::Closed {
                inner.state = SessionState::Closing;
            }
            previous
        };
        tracing::info!(session_id = %self.id, from = %previous, "Closing session");

        if previous != SessionState::Created && !self.torn_down.load(Ordering::SeqCst) {
            if let Err(e) = self.end_audio_locked().await {
                tracing::warn!(session_id = %self.id, "End audio during close failed: {}", e);
            }
            if previous.prompt_is_open() {
                if let Err(e) = self.end_prompt_for_close().await {
                    tracing::warn!(session_id = %self.id, "End prompt during close failed: {}", e);
                }
            }
            if let Err(e) = self.send(EngineRequest::SessionEnd).await {
                tracing::warn!(session_id = %self.id, "Session end during close failed: {}", e);
            }
            self.drain().await;
        }

        self.teardown(false).await
    }

    /// Unconditional, idempotent teardown of the duplex channel
    pub async fn force_close(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.teardown(true).await
    }

    /// Graceful close bounded by `graceful`, falling back to `force_close`
    /// bounded by `force`
    pub async fn close_within(&self, graceful: Duration, force: Duration) -> Result<CloseOutcome> {
        match tokio::time::timeout(graceful, self.close()).await {
            Ok(Ok(())) => return Ok(CloseOutcome::Graceful),
            Ok(Err(e)) => {
                tracing::warn!(session_id = %self.id, "Graceful close failed, forcing: {}", e);
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %self.id,
                    timeout_ms = graceful.as_millis() as u64,
                    "Graceful close timed out, forcing"
                );
            }
        }

        match tokio::time::timeout(force, self.force_close()).await {
            Ok(Ok(())) => Ok(CloseOutcome::Forced),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::SessionCleanupTimeout {
                session_id: self.id.clone(),
                timeout_ms: force.as_millis() as u64,
            }),
        }
    }

    /// Cleanup after the caller went away
    pub async fn cleanup_on_disconnect(&self) -> Result<CloseOutcome> {
        let bound = self.config.disconnect_cleanup_timeout();
        self.close_within(bound, bound).await
    }

    fn ensure_accepting(&self, operation: &'static str) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::invalid_state(operation, "session is closing"));
        }
        Ok(())
    }

    fn queue(&self) -> Result<OutboundQueue> {
        self.outbound
            .lock()
            .clone()
            .ok_or_else(|| Error::Connection("duplex channel is not open".to_string()))
    }

    async fn send(&self, request: EngineRequest) -> Result<()> {
        self.queue()?.send(request).await
    }

    async fn initiate_locked(&self) -> Result<()> {
        self.ensure_accepting("initiate")?;
        let state = self.state();
        if state != SessionState::Created {
            return Err(Error::invalid_state("initiate", format!("session is {}", state)));
        }

        tracing::info!(session_id = %self.id, "Opening duplex channel");
        let OpenedChannel { sink, events } = self.connector.open(&self.id).await?;

        let (queue, rx) = OutboundQueue::new(
            self.config.outbound_queue_capacity,
            self.config.backpressure,
            self.metrics.clone(),
        );

        let writer = tokio::spawn(outbound::run_writer(
            self.id.clone(),
            sink.clone(),
            rx,
            self.shutdown_tx.subscribe(),
            self.bus.clone(),
            self.metrics.clone(),
        ));
        let pump = EventPump {
            session_id: self.id.clone(),
            bus: self.bus.clone(),
            waiters: self.waiters.clone(),
            inner: self.inner.clone(),
            tools: self.tools.clone(),
            outbound: queue.clone(),
            metrics: self.metrics.clone(),
            closing: self.closing.clone(),
            shutdown: self.shutdown_tx.subscribe(),
            pending_tool: None,
        };
        let pump = tokio::spawn(pump.run(events));

        *self.sink.lock() = Some(sink);
        *self.outbound.lock() = Some(queue);
        *self.writer.lock() = Some(writer);
        *self.pump.lock() = Some(pump);

        // A force-close that raced with the open found no sink to close.
        if self.torn_down.load(Ordering::SeqCst) {
            self.release_channel().await?;
            return Err(Error::invalid_state("initiate", "session was closed while opening"));
        }

        self.send(EngineRequest::SessionStart {
            inference: self.config.inference.clone(),
        })
        .await?;
        self.open_prompt_locked().await
    }

    async fn open_prompt_locked(&self) -> Result<()> {
        let prompt_name = uuid::Uuid::new_v4().to_string();
        let tools = self.tools.as_ref().map(|t| t.specs()).unwrap_or_default();

        self.send(EngineRequest::PromptStart {
            prompt_name: prompt_name.clone(),
            voice_id: self.config.voice_id.clone(),
            audio_output: self.config.audio_output.clone(),
            tools,
        })
        .await?;

        let system_prompt = {
            let mut inner = self.inner.lock();
            inner.state = SessionState::PromptOpen;
            inner.prompt_name = Some(prompt_name.clone());
            inner.content.clear();
            inner.system_prompt.clone()
        };
        tracing::debug!(session_id = %self.id, prompt = %prompt_name, "Prompt started");

        if let Some(text) = system_prompt {
            let content_id = uuid::Uuid::new_v4().to_string();
            self.send_text_locked(&content_id, &text, Role::System).await?;
        }
        Ok(())
    }

    /// Content start, text, content end for one text block
    async fn send_text_locked(&self, content_id: &str, text: &str, role: Role) -> Result<()> {
        let prompt_name = {
            let mut inner = self.inner.lock();
            inner.content.open(content_id, Modality::Text, role)?;
            inner.prompt_name.clone().unwrap_or_default()
        };

        let requests = [
            EngineRequest::ContentStart {
                prompt_name: prompt_name.clone(),
                content_name: content_id.to_string(),
                content_type: ContentType::Text,
                role,
                audio_input: None,
                tool_use_id: None,
            },
            EngineRequest::TextInput {
                prompt_name: prompt_name.clone(),
                content_name: content_id.to_string(),
                content: text.to_string(),
            },
            EngineRequest::ContentEnd {
                prompt_name,
                content_name: content_id.to_string(),
            },
        ];

        for (step, request) in requests.into_iter().enumerate() {
            if let Err(e) = self.send(request).await {
                self.inner.lock().content.acknowledge(content_id);
                return Err(e);
            }
            if step == 0 {
                self.inner.lock().content.mark_active(content_id)?;
            }
        }

        self.inner.lock().content.end(content_id);
        Ok(())
    }

    async fn end_audio_locked(&self) -> Result<()> {
        let (prompt_name, audio_id) = {
            let mut inner = self.inner.lock();
            let Some(audio_id) = inner.content.open_audio().map(str::to_string) else {
                return Ok(());
            };
            inner.content.end(&audio_id);
            if inner.state == SessionState::AudioOpen {
                inner.state = SessionState::PromptOpen;
            }
            (inner.prompt_name.clone().unwrap_or_default(), audio_id)
        };

        tracing::debug!(session_id = %self.id, content_id = %audio_id, "Audio content ended");
        self.send(EngineRequest::ContentEnd {
            prompt_name,
            content_name: audio_id,
        })
        .await
    }

    async fn end_prompt_for_close(&self) -> Result<()> {
        let Some(prompt_name) = self.inner.lock().prompt_name.take() else {
            return Ok(());
        };
        self.send(EngineRequest::PromptEnd { prompt_name }).await
    }

    /// Let the writer flush session end and the engine finish its stream
    async fn drain(&self) {
        let writer = self.writer.lock().take();
        let pump = self.pump.lock().take();
        let bound = self.config.drain_timeout();

        let drained = tokio::time::timeout(bound, async {
            if let Some(writer) = writer {
                let _ = writer.await;
            }
            if let Some(pump) = pump {
                let _ = pump.await;
            }
        })
        .await;

        if drained.is_err() {
            tracing::debug!(
                session_id = %self.id,
                timeout_ms = bound.as_millis() as u64,
                "Engine did not finish the stream before the drain bound"
            );
        }
    }

    async fn release_channel(&self) -> Result<()> {
        self.shutdown_tx.send_replace(true);
        if let Some(writer) = self.writer.lock().take() {
            writer.abort();
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.outbound.lock().take();

        let sink = self.sink.lock().take();
        match sink {
            Some(sink) => sink.close().await,
            None => Ok(()),
        }
    }

    async fn teardown(&self, forced: bool) -> Result<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            tracing::debug!(session_id = %self.id, forced, "Teardown already done");
            return Ok(());
        }

        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Closed {
                inner.state = SessionState::Closing;
            }
        }

        let result = self.release_channel().await;
        self.waiters.close();

        {
            let mut inner = self.inner.lock();
            inner.state = SessionState::Closed;
            inner.prompt_name = None;
            inner.content.clear();
        }
        self.metrics.session_closed(forced);
        self.closed_tx.send_replace(true);

        match &result {
            Ok(()) => tracing::info!(session_id = %self.id, forced, "Session closed"),
            Err(e) => tracing::warn!(session_id = %self.id, forced, "Channel close failed: {}", e),
        }
        result
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
