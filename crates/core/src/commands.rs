//! Inbound client commands
//!
//! A connection decodes caller frames into [`ClientCommand`]s and feeds them,
//! one at a time, to its [`CommandHandler`]. Failures of a single command are
//! reported to the caller as `error` events on the session bus; they never
//! end the connection.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::events::Role;
use crate::protocol::AudioFormat;
use crate::registry::{SessionHandle, SessionRegistry};
use crate::session::CloseOutcome;
use crate::tools::{KnowledgeBase, KNOWLEDGE_TOOL_NAME};
use crate::{Error, Result};

/// A command sent by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientCommand {
    /// Open the prompt, initiating the session if needed
    PromptStart,

    /// Set or refresh the system instruction
    #[serde(rename_all = "camelCase")]
    SystemPrompt {
        content: String,
        #[serde(default)]
        prompt_id: Option<String>,
    },

    /// Open an audio content block
    AudioStart {
        #[serde(default)]
        config: AudioFormat,
    },

    /// One base64-encoded audio chunk
    AudioInput { data: String },

    /// Typed question answered from the knowledge base
    UserText { text: String },

    /// End audio and prompt, then close the session
    StopAudio,
}

impl ClientCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientCommand::PromptStart => "promptStart",
            ClientCommand::SystemPrompt { .. } => "systemPrompt",
            ClientCommand::AudioStart { .. } => "audioStart",
            ClientCommand::AudioInput { .. } => "audioInput",
            ClientCommand::UserText { .. } => "userText",
            ClientCommand::StopAudio => "stopAudio",
        }
    }
}

/// What the connection should do after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Continue,
    /// The session was closed on request; stop reading from the caller
    Closed,
}

/// Applies client commands to one session
pub struct CommandHandler {
    session: SessionHandle,
    registry: Arc<SessionRegistry>,
    knowledge: Arc<dyn KnowledgeBase>,
}

impl CommandHandler {
    pub fn new(
        session: SessionHandle,
        registry: Arc<SessionRegistry>,
        knowledge: Arc<dyn KnowledgeBase>,
    ) -> Self {
        Self {
            session,
            registry,
            knowledge,
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Apply one command; failures become `error` events
    pub async fn handle(&self, command: ClientCommand) -> CommandOutcome {
        self.touch();
        let kind = command.kind();
        tracing::trace!(session_id = %self.session.id(), command = kind, "Client command");

        match self.apply(command).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.session.emit_error(kind, &e);
                CommandOutcome::Continue
            }
        }
    }

    /// Apply a raw audio chunk received as a binary frame
    pub async fn handle_audio(&self, chunk: &[u8]) -> CommandOutcome {
        self.touch();
        if let Err(e) = self.session.stream_audio(chunk).await {
            self.session.emit_error("audioInput", &e);
        }
        CommandOutcome::Continue
    }

    /// Report an undecodable caller frame
    pub fn reject(&self, err: &Error) {
        self.session.emit_error("clientCommand", err);
    }

    /// Bounded cleanup after the caller went away, then deregistration
    pub async fn disconnect(&self) -> Result<CloseOutcome> {
        let id = self.session.id().to_string();
        let outcome = self.session.cleanup_on_disconnect().await;
        self.registry.remove_session(&self.session);
        match &outcome {
            Ok(how) => tracing::info!(session_id = %id, outcome = ?how, "Caller disconnected, session cleaned up"),
            Err(e) => tracing::error!(session_id = %id, "Disconnect cleanup failed: {}", e),
        }
        outcome
    }

    fn touch(&self) {
        if let Err(e) = self.registry.touch(self.session.id()) {
            tracing::debug!(session_id = %self.session.id(), "Activity not recorded: {}", e);
        }
    }

    async fn apply(&self, command: ClientCommand) -> Result<CommandOutcome> {
        match command {
            ClientCommand::PromptStart => {
                self.session.start_prompt().await?;
            }
            ClientCommand::SystemPrompt { content, prompt_id } => {
                self.session.setup_system_prompt(prompt_id, content).await?;
            }
            ClientCommand::AudioStart { config } => {
                self.session.start_prompt().await?;
                self.session.setup_start_audio(config).await?;
            }
            ClientCommand::AudioInput { data } => {
                let chunk = base64::engine::general_purpose::STANDARD
                    .decode(data.as_bytes())
                    .map_err(|e| Error::InvalidPayload(format!("audioInput is not base64: {}", e)))?;
                self.session.stream_audio(&chunk).await?;
            }
            ClientCommand::UserText { text } => {
                self.answer(&text).await?;
            }
            ClientCommand::StopAudio => {
                self.session.close().await?;
                return Ok(CommandOutcome::Closed);
            }
        }
        Ok(CommandOutcome::Continue)
    }

    /// Knowledge lookup, inject the answer, wait for its contentEnd, end prompt
    async fn answer(&self, question: &str) -> Result<()> {
        self.session.start_prompt().await?;

        let answer = self.knowledge.query(question).await.map_err(|e| match e {
            Error::ToolInvocation { .. } => e,
            other => Error::ToolInvocation {
                tool: KNOWLEDGE_TOOL_NAME.to_string(),
                message: other.to_string(),
            },
        })?;

        let content_id = uuid::Uuid::new_v4().to_string();
        let wait = self
            .session
            .send_text_content(content_id, &answer, Role::Assistant)
            .await?;
        wait.wait_timeout(self.session.config().content_end_timeout())
            .await?;

        self.session.end_prompt().await
    }
}
