//! Session, reaper and shutdown settings
//!
//! All structs deserialize with per-field defaults so a config file only
//! needs to name what it overrides.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::{AudioFormat, InferenceConfig};

/// What `stream_audio` does when the outbound queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Suspend the caller until the writer frees a slot
    #[default]
    Block,
    /// Drop the incoming audio chunk; control requests still block
    DropNewest,
}

/// Per-session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sampling parameters sent with session start
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Voice used for engine speech
    #[serde(default = "default_voice_id")]
    pub voice_id: String,

    /// Format of engine speech output
    #[serde(default = "AudioFormat::output_default")]
    pub audio_output: AudioFormat,

    /// System instruction sent when the caller does not provide one
    #[serde(default)]
    pub default_system_prompt: Option<String>,

    /// Capacity of the outbound request queue, in requests
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Policy when the outbound queue is full
    #[serde(default)]
    pub backpressure: BackpressurePolicy,

    /// How long graceful close waits for the engine to finish the stream
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// How long `userText` waits for the injected content to end
    #[serde(default = "default_content_end_timeout_ms")]
    pub content_end_timeout_ms: u64,

    /// Bound on graceful cleanup after the caller disconnects
    #[serde(default = "default_disconnect_cleanup_timeout_ms")]
    pub disconnect_cleanup_timeout_ms: u64,
}

fn default_voice_id() -> String {
    "matthew".to_string()
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_drain_timeout_ms() -> u64 {
    2000
}

fn default_content_end_timeout_ms() -> u64 {
    10_000
}

fn default_disconnect_cleanup_timeout_ms() -> u64 {
    3000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inference: InferenceConfig::default(),
            voice_id: default_voice_id(),
            audio_output: AudioFormat::output_default(),
            default_system_prompt: None,
            outbound_queue_capacity: default_outbound_queue_capacity(),
            backpressure: BackpressurePolicy::default(),
            drain_timeout_ms: default_drain_timeout_ms(),
            content_end_timeout_ms: default_content_end_timeout_ms(),
            disconnect_cleanup_timeout_ms: default_disconnect_cleanup_timeout_ms(),
        }
    }
}

impl SessionConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn content_end_timeout(&self) -> Duration {
        Duration::from_millis(self.content_end_timeout_ms)
    }

    pub fn disconnect_cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_cleanup_timeout_ms)
    }
}

/// Inactivity reaper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Sweep period in seconds
    #[serde(default = "default_reaper_interval")]
    pub interval_seconds: u64,

    /// Idle time after which a session is force-closed, in seconds
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_seconds: u64,

    /// Bound on one session's force-close during a sweep, in milliseconds
    #[serde(default = "default_force_close_timeout_ms")]
    pub force_close_timeout_ms: u64,
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_inactivity_timeout() -> u64 {
    300 // 5 minutes
}

fn default_force_close_timeout_ms() -> u64 {
    1000
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_reaper_interval(),
            inactivity_timeout_seconds: default_inactivity_timeout(),
            force_close_timeout_ms: default_force_close_timeout_ms(),
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_seconds)
    }

    pub fn force_close_timeout(&self) -> Duration {
        Duration::from_millis(self.force_close_timeout_ms)
    }
}

/// Shutdown drain settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Bound on each session's graceful close, in milliseconds
    #[serde(default = "default_graceful_timeout_ms")]
    pub graceful_timeout_ms: u64,

    /// Bound on the force-close fallback, in milliseconds
    #[serde(default = "default_force_close_timeout_ms")]
    pub force_close_timeout_ms: u64,

    /// Hard ceiling on the whole drain, in milliseconds
    #[serde(default = "default_hard_ceiling_ms")]
    pub hard_ceiling_ms: u64,
}

fn default_graceful_timeout_ms() -> u64 {
    2000
}

fn default_hard_ceiling_ms() -> u64 {
    5000
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout_ms: default_graceful_timeout_ms(),
            force_close_timeout_ms: default_force_close_timeout_ms(),
            hard_ceiling_ms: default_hard_ceiling_ms(),
        }
    }
}

impl ShutdownConfig {
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }

    pub fn force_close_timeout(&self) -> Duration {
        Duration::from_millis(self.force_close_timeout_ms)
    }

    pub fn hard_ceiling(&self) -> Duration {
        Duration::from_millis(self.hard_ceiling_ms)
    }
}
