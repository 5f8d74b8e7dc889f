//! Engine event pump
//!
//! One task per session reads the engine's event stream and, for each event
//! in production order: updates content bookkeeping, publishes it on the
//! bus, then resolves content-end waiters. Tool requests are executed on a
//! side task so a slow tool never stalls event delivery.

use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use super::outbound::{cancelled, OutboundQueue};
use super::SessionInner;
use crate::bus::{ContentWaiters, EventBus};
use crate::channel::EngineEvents;
use crate::events::{ContentType, Role, SessionEvent};
use crate::metrics::Metrics;
use crate::protocol::EngineRequest;
use crate::tools::{ToolHandler, ToolInvocation};
use crate::Error;

pub(crate) struct EventPump {
    pub(crate) session_id: String,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) waiters: Arc<ContentWaiters>,
    pub(crate) inner: Arc<Mutex<SessionInner>>,
    pub(crate) tools: Option<Arc<dyn ToolHandler>>,
    pub(crate) outbound: OutboundQueue,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) closing: Arc<AtomicBool>,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) pending_tool: Option<ToolInvocation>,
}

impl EventPump {
    pub(crate) async fn run(mut self, mut events: EngineEvents) {
        let mut shutdown = self.shutdown.clone();
        let mut completed = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => break,
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    if event == SessionEvent::StreamComplete {
                        completed = true;
                    }
                    self.dispatch(event);
                }
                Some(Err(Error::Connection(message))) => {
                    tracing::error!(session_id = %self.session_id, "Engine stream failed: {}", message);
                    self.emit_error(&Error::Connection(message));
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(session_id = %self.session_id, "Skipping malformed engine event: {}", e);
                    self.emit_error(&e);
                }
                None => {
                    if !completed && !self.closing.load(Ordering::SeqCst) {
                        self.emit_error(&Error::Connection(
                            "engine stream ended unexpectedly".to_string(),
                        ));
                    }
                    break;
                }
            }
        }

        self.waiters.close();
        tracing::debug!(session_id = %self.session_id, completed, "Event pump stopped");
    }

    fn dispatch(&mut self, event: SessionEvent) {
        match &event {
            SessionEvent::ToolUse {
                tool_name,
                tool_use_id,
                content,
                ..
            } => {
                self.pending_tool = Some(ToolInvocation::from_tool_use(tool_name, tool_use_id, content));
                self.bus.publish(&event);
            }
            SessionEvent::ContentEnd {
                content_id,
                content_type,
                ..
            } => {
                self.inner.lock().content.acknowledge(content_id);
                self.bus.publish(&event);
                self.waiters.resolve(content_id, &event);

                if *content_type == ContentType::Tool {
                    if let Some(invocation) = self.pending_tool.take() {
                        self.spawn_tool(invocation);
                    }
                }
            }
            SessionEvent::Error { .. } => {
                self.metrics.error_emitted();
                self.bus.publish(&event);
            }
            _ => {
                self.bus.publish(&event);
            }
        }
    }

    fn emit_error(&self, err: &Error) {
        self.metrics.error_emitted();
        self.bus.publish(&SessionEvent::error("inferenceEngine", err));
    }

    fn spawn_tool(&self, invocation: ToolInvocation) {
        let Some(tools) = self.tools.clone() else {
            tracing::warn!(
                session_id = %self.session_id,
                tool = %invocation.tool_name,
                "Engine requested a tool but no tool handler is configured"
            );
            return;
        };
        let Some(prompt_name) = self.inner.lock().prompt_name.clone() else {
            tracing::warn!(session_id = %self.session_id, "Tool result dropped, prompt already ended");
            return;
        };

        let runner = ToolRunner {
            session_id: self.session_id.clone(),
            bus: self.bus.clone(),
            outbound: self.outbound.clone(),
            metrics: self.metrics.clone(),
            tools,
            prompt_name,
        };
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled(&mut shutdown) => {}
                _ = runner.run(invocation) => {}
            }
        });
    }
}

struct ToolRunner {
    session_id: String,
    bus: Arc<EventBus>,
    outbound: OutboundQueue,
    metrics: Arc<Metrics>,
    tools: Arc<dyn ToolHandler>,
    prompt_name: String,
}

impl ToolRunner {
    async fn run(self, invocation: ToolInvocation) {
        tracing::info!(
            session_id = %self.session_id,
            tool = %invocation.tool_name,
            tool_use_id = %invocation.tool_use_id,
            "Invoking tool"
        );

        let result = self.tools.invoke(&invocation).await;
        self.metrics.tool_invoked();

        let payload = match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, tool = %invocation.tool_name, "Tool failed: {}", e);
                self.metrics.error_emitted();
                self.bus.publish(&SessionEvent::error("tool", &e));
                serde_json::json!({ "error": e.to_string() })
            }
        };

        let content_name = uuid::Uuid::new_v4().to_string();
        let requests = [
            EngineRequest::ContentStart {
                prompt_name: self.prompt_name.clone(),
                content_name: content_name.clone(),
                content_type: ContentType::Tool,
                role: Role::Tool,
                audio_input: None,
                tool_use_id: Some(invocation.tool_use_id.clone()),
            },
            EngineRequest::ToolResult {
                prompt_name: self.prompt_name.clone(),
                content_name: content_name.clone(),
                content: payload.to_string(),
            },
            EngineRequest::ContentEnd {
                prompt_name: self.prompt_name.clone(),
                content_name,
            },
        ];
        for request in requests {
            if let Err(e) = self.outbound.send(request).await {
                tracing::warn!(session_id = %self.session_id, "Could not return tool result: {}", e);
                return;
            }
        }

        self.bus.publish(&SessionEvent::ToolResult {
            tool_use_id: invocation.tool_use_id,
            tool_name: invocation.tool_name,
            result: payload,
        });
    }
}
