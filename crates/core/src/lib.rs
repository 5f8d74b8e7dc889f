//! voxrelay core - duplex audio/text sessions with an inference engine
//!
//! This crate holds everything that is independent of the caller-facing
//! transport:
//!
//! - [`StreamSession`]: per-caller state machine owning one duplex channel
//! - [`EventBus`] and [`ContentWaiters`]: outbound event fan-out and
//!   "wait for this content to end" completions
//! - [`SessionRegistry`]: process-wide table of live sessions
//! - [`InactivityReaper`] and [`ShutdownCoordinator`]: registry-wide cleanup
//! - [`CommandHandler`]: maps caller commands onto session operations
//!
//! The engine is reached through the [`InferenceConnector`] trait; the
//! gateway crate provides the WebSocket implementation.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use voxrelay_core::{SessionConfig, SessionRegistry, StreamSession};
//!
//! let registry = Arc::new(SessionRegistry::new());
//! let session = registry.register(StreamSession::new("sess_1", SessionConfig::default(), connector))?;
//! session.initiate().await?;
//! session.setup_start_audio(Default::default()).await?;
//! session.stream_audio(&pcm).await?;
//! session.close().await?;
//! ```

#![warn(clippy::all)]

pub mod bus;
pub mod channel;
pub mod commands;
pub mod config;
pub mod content;
pub mod error;
pub mod events;
pub mod metrics;
pub mod protocol;
pub mod reaper;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod tools;

pub use bus::{ContentEndWait, ContentWaiters, EventBus, EventHandler, SubscriptionId};
pub use channel::{ChannelSink, EngineEvents, InferenceConnector, OpenedChannel};
pub use commands::{ClientCommand, CommandHandler, CommandOutcome};
pub use config::{BackpressurePolicy, ReaperConfig, SessionConfig, ShutdownConfig};
pub use content::{BlockState, ContentBlock, ContentTracker, Modality};
pub use error::{Error, Result};
pub use events::{ContentType, EventName, Role, SessionEvent};
pub use metrics::{global_metrics, Metrics, MetricsSnapshot};
pub use protocol::{AudioFormat, EngineRequest, InferenceConfig, ToolSpec};
pub use reaper::{InactivityReaper, ReaperHandle, SweepReport};
pub use registry::{SessionHandle, SessionRegistry, SessionSummary};
pub use session::{CloseOutcome, SessionState, StreamSession};
pub use shutdown::{DrainReport, ShutdownCoordinator};
pub use tools::{
    KnowledgeBase, KnowledgeBaseTool, ToolHandler, ToolInvocation, KNOWLEDGE_TOOL_NAME,
    NO_ANSWER_FOUND,
};
