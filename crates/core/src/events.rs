//! Events produced by the inference engine and forwarded to the caller
//!
//! Every outbound event is a variant of [`SessionEvent`]; the JSON form is
//! tagged with `type` so browser callers can switch on the event name.

use serde::{Deserialize, Serialize};

/// Speaker role attached to content blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// Kind of payload carried by a content block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentType {
    Audio,
    Text,
    Tool,
}

/// Name of an event, used as the subscription key on the event bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    ContentStart,
    TextOutput,
    AudioOutput,
    ToolUse,
    ToolResult,
    ContentEnd,
    Error,
    StreamComplete,
}

impl EventName {
    /// All event names, in table order
    pub const ALL: [EventName; 8] = [
        EventName::ContentStart,
        EventName::TextOutput,
        EventName::AudioOutput,
        EventName::ToolUse,
        EventName::ToolResult,
        EventName::ContentEnd,
        EventName::Error,
        EventName::StreamComplete,
    ];

    /// Wire name of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::ContentStart => "contentStart",
            EventName::TextOutput => "textOutput",
            EventName::AudioOutput => "audioOutput",
            EventName::ToolUse => "toolUse",
            EventName::ToolResult => "toolResult",
            EventName::ContentEnd => "contentEnd",
            EventName::Error => "error",
            EventName::StreamComplete => "streamComplete",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event on a session's outbound stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// The engine opened a content block
    #[serde(rename_all = "camelCase")]
    ContentStart {
        content_id: String,
        role: Role,
        content_type: ContentType,
    },

    /// Text produced by the engine (transcripts or assistant replies)
    #[serde(rename_all = "camelCase")]
    TextOutput {
        content_id: String,
        role: Role,
        content: String,
    },

    /// Base64-encoded audio produced by the engine
    #[serde(rename_all = "camelCase")]
    AudioOutput { content_id: String, content: String },

    /// The engine asks for a tool to be run
    #[serde(rename_all = "camelCase")]
    ToolUse {
        content_id: String,
        tool_name: String,
        tool_use_id: String,
        /// JSON-encoded tool input
        content: String,
    },

    /// A tool result was sent back to the engine
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_use_id: String,
        tool_name: String,
        result: serde_json::Value,
    },

    /// A content block finished
    #[serde(rename_all = "camelCase")]
    ContentEnd {
        content_id: String,
        content_type: ContentType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
    },

    /// A per-session failure
    #[serde(rename_all = "camelCase")]
    Error {
        source: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },

    /// The engine finished the stream
    StreamComplete,
}

impl SessionEvent {
    /// Subscription key of this event
    pub fn name(&self) -> EventName {
        match self {
            SessionEvent::ContentStart { .. } => EventName::ContentStart,
            SessionEvent::TextOutput { .. } => EventName::TextOutput,
            SessionEvent::AudioOutput { .. } => EventName::AudioOutput,
            SessionEvent::ToolUse { .. } => EventName::ToolUse,
            SessionEvent::ToolResult { .. } => EventName::ToolResult,
            SessionEvent::ContentEnd { .. } => EventName::ContentEnd,
            SessionEvent::Error { .. } => EventName::Error,
            SessionEvent::StreamComplete => EventName::StreamComplete,
        }
    }

    /// Content id for events scoped to a content block
    pub fn content_id(&self) -> Option<&str> {
        match self {
            SessionEvent::ContentStart { content_id, .. }
            | SessionEvent::TextOutput { content_id, .. }
            | SessionEvent::AudioOutput { content_id, .. }
            | SessionEvent::ToolUse { content_id, .. }
            | SessionEvent::ContentEnd { content_id, .. } => Some(content_id),
            _ => None,
        }
    }

    /// Build an error event from a source tag and an error
    pub fn error(source: impl Into<String>, err: &crate::Error) -> Self {
        SessionEvent::Error {
            source: source.into(),
            message: err.to_string(),
            details: Some(serde_json::json!({ "kind": err.kind() })),
        }
    }
}
