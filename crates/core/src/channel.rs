//! Duplex channel abstraction towards the inference engine
//!
//! The core never sees transport framing. A connector opens one channel per
//! session and hands back a sink for requests plus a stream of engine events.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

use crate::events::SessionEvent;
use crate::protocol::EngineRequest;
use crate::Result;

/// Stream of engine events in production order
pub type EngineEvents = BoxStream<'static, Result<SessionEvent>>;

/// Request side of an open duplex channel
#[async_trait]
pub trait ChannelSink: Send + Sync {
    /// Send one request; suspends on the transport's own backpressure
    async fn send(&self, request: EngineRequest) -> Result<()>;

    /// Tear down the channel
    async fn close(&self) -> Result<()>;
}

/// An open duplex channel
pub struct OpenedChannel {
    pub sink: Arc<dyn ChannelSink>,
    pub events: EngineEvents,
}

/// Opens duplex channels to the inference engine
#[async_trait]
pub trait InferenceConnector: Send + Sync {
    /// Open a channel for `session_id`; fails with `Error::Connection`
    async fn open(&self, session_id: &str) -> Result<OpenedChannel>;
}
