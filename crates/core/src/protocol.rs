//! Requests sent from a session to the inference engine

use serde::{Deserialize, Serialize};

use crate::events::{ContentType, Role};

/// Audio format of an audio content block (input or output)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    /// MIME type of the samples
    #[serde(default = "default_media_type")]
    pub media_type: String,

    /// Transfer encoding of chunks on the wire
    #[serde(default = "default_encoding")]
    pub encoding: String,

    /// Sample rate in Hz
    #[serde(default = "default_input_sample_rate")]
    pub sample_rate_hertz: u32,

    /// Bit depth
    #[serde(default = "default_sample_size_bits")]
    pub sample_size_bits: u16,

    /// Number of channels
    #[serde(default = "default_channel_count")]
    pub channel_count: u16,
}

fn default_media_type() -> String {
    "audio/lpcm".to_string()
}

fn default_encoding() -> String {
    "base64".to_string()
}

fn default_input_sample_rate() -> u32 {
    16000
}

fn default_sample_size_bits() -> u16 {
    16
}

fn default_channel_count() -> u16 {
    1
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            media_type: default_media_type(),
            encoding: default_encoding(),
            sample_rate_hertz: default_input_sample_rate(),
            sample_size_bits: default_sample_size_bits(),
            channel_count: default_channel_count(),
        }
    }
}

impl AudioFormat {
    /// Default format for engine speech output (24 kHz mono)
    pub fn output_default() -> Self {
        Self {
            sample_rate_hertz: 24000,
            ..Self::default()
        }
    }
}

/// Sampling parameters for the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_top_p() -> f32 {
    0.9
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            temperature: default_temperature(),
        }
    }
}

/// A tool advertised to the engine at prompt start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool input
    pub input_schema: serde_json::Value,
}

/// A request on the duplex channel, in issue order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineRequest {
    #[serde(rename_all = "camelCase")]
    SessionStart { inference: InferenceConfig },

    #[serde(rename_all = "camelCase")]
    PromptStart {
        prompt_name: String,
        voice_id: String,
        audio_output: AudioFormat,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tools: Vec<ToolSpec>,
    },

    #[serde(rename_all = "camelCase")]
    ContentStart {
        prompt_name: String,
        content_name: String,
        content_type: ContentType,
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_input: Option<AudioFormat>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    TextInput {
        prompt_name: String,
        content_name: String,
        content: String,
    },

    #[serde(rename_all = "camelCase")]
    AudioInput {
        prompt_name: String,
        content_name: String,
        /// Base64-encoded chunk
        content: String,
    },

    #[serde(rename_all = "camelCase")]
    ToolResult {
        prompt_name: String,
        content_name: String,
        /// JSON-encoded result
        content: String,
    },

    #[serde(rename_all = "camelCase")]
    ContentEnd {
        prompt_name: String,
        content_name: String,
    },

    #[serde(rename_all = "camelCase")]
    PromptEnd { prompt_name: String },

    SessionEnd,
}

impl EngineRequest {
    /// Audio chunks are the only requests that may be shed under backpressure
    pub fn is_audio_chunk(&self) -> bool {
        matches!(self, EngineRequest::AudioInput { .. })
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            EngineRequest::SessionStart { .. } => "sessionStart",
            EngineRequest::PromptStart { .. } => "promptStart",
            EngineRequest::ContentStart { .. } => "contentStart",
            EngineRequest::TextInput { .. } => "textInput",
            EngineRequest::AudioInput { .. } => "audioInput",
            EngineRequest::ToolResult { .. } => "toolResult",
            EngineRequest::ContentEnd { .. } => "contentEnd",
            EngineRequest::PromptEnd { .. } => "promptEnd",
            EngineRequest::SessionEnd => "sessionEnd",
        }
    }
}
