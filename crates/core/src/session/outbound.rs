//! Outbound request queue and writer task
//!
//! Every request a session issues goes through one bounded queue drained by
//! one writer task, so the engine sees requests in issue order. Only audio
//! chunks may be shed, and only under [`BackpressurePolicy::DropNewest`].

use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::bus::EventBus;
use crate::channel::ChannelSink;
use crate::config::BackpressurePolicy;
use crate::events::SessionEvent;
use crate::metrics::Metrics;
use crate::protocol::EngineRequest;
use crate::{Error, Result};

/// Sending half of a session's outbound queue
#[derive(Clone)]
pub(crate) struct OutboundQueue {
    tx: mpsc::Sender<EngineRequest>,
    policy: BackpressurePolicy,
    metrics: Arc<Metrics>,
}

impl OutboundQueue {
    pub(crate) fn new(
        capacity: usize,
        policy: BackpressurePolicy,
        metrics: Arc<Metrics>,
    ) -> (Self, mpsc::Receiver<EngineRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                policy,
                metrics,
            },
            rx,
        )
    }

    /// Queue a control request, waiting for space
    pub(crate) async fn send(&self, request: EngineRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| Error::Connection("outbound channel to the engine is closed".to_string()))
    }

    /// Queue an audio chunk according to the backpressure policy
    ///
    /// Returns false when the chunk was dropped.
    pub(crate) async fn send_audio(&self, request: EngineRequest) -> Result<bool> {
        match self.policy {
            BackpressurePolicy::Block => {
                self.send(request).await?;
                self.metrics.audio_forwarded();
                Ok(true)
            }
            BackpressurePolicy::DropNewest => match self.tx.try_send(request) {
                Ok(()) => {
                    self.metrics.audio_forwarded();
                    Ok(true)
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.audio_dropped();
                    Ok(false)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::Connection(
                    "outbound channel to the engine is closed".to_string(),
                )),
            },
        }
    }
}

/// Resolves once `shutdown` is set (or its sender is gone)
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Drain the queue into the channel sink until session end, failure or shutdown
pub(crate) async fn run_writer(
    session_id: String,
    sink: Arc<dyn ChannelSink>,
    mut rx: mpsc::Receiver<EngineRequest>,
    mut shutdown: watch::Receiver<bool>,
    bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => break,
            next = rx.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };

        let is_session_end = matches!(request, EngineRequest::SessionEnd);
        let kind = request.kind();

        let sent = tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => break,
            sent = sink.send(request) => sent,
        };

        if let Err(e) = sent {
            tracing::error!(session_id = %session_id, request = kind, "Engine send failed: {}", e);
            bus.publish(&SessionEvent::error("inferenceEngine", &e));
            metrics.error_emitted();
            break;
        }

        tracing::trace!(session_id = %session_id, request = kind, "Request sent");

        if is_session_end {
            break;
        }
    }

    tracing::debug!(session_id = %session_id, "Outbound writer stopped");
}
