//! Configuration for the voxrelay gateway
//!
//! Configuration is loaded from a TOML file and then overridden by
//! `VOXRELAY_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use voxrelay_core::{ReaperConfig, SessionConfig, ShutdownConfig};

/// Main configuration for the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Inference engine connection
    #[serde(default)]
    pub engine: EngineConfig,

    /// Knowledge lookup service
    #[serde(default)]
    pub knowledge: KnowledgeConfig,

    /// Per-session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Inactivity reaper
    #[serde(default)]
    pub reaper: ReaperConfig,

    /// Shutdown drain
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP/WebSocket port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_format: LogFormat::default(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Inference engine connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// WebSocket URL of the engine's bidirectional stream endpoint
    #[serde(default = "default_engine_url")]
    pub url: String,

    /// Bound on opening one duplex channel
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_engine_url() -> String {
    "ws://127.0.0.1:9100/v1/stream".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: default_engine_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl EngineConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Knowledge lookup service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Retrieval endpoint; without one every lookup finds nothing
    #[serde(default)]
    pub url: Option<String>,

    /// Number of passages to retrieve
    #[serde(default = "default_top_k")]
    pub top_k: u32,

    /// Request timeout in milliseconds
    #[serde(default = "default_knowledge_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_top_k() -> u32 {
    3
}

fn default_knowledge_timeout_ms() -> u64 {
    5000
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            url: None,
            top_k: default_top_k(),
            timeout_ms: default_knowledge_timeout_ms(),
        }
    }
}

impl KnowledgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load the file if it exists, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.as_ref().exists() => Self::from_file(p)?,
            // Runs before tracing is up; callers report the missing file
            _ => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override fields from `VOXRELAY_*` variables looked up through `var`
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        // Server
        if let Some(host) = var("VOXRELAY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("VOXRELAY_PORT") {
            self.server.port = parse("VOXRELAY_PORT", &port)?;
        }
        if let Some(format) = var("VOXRELAY_LOG_FORMAT") {
            self.server.log_format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(ConfigError::Invalid {
                        key: "VOXRELAY_LOG_FORMAT",
                        value: other.to_string(),
                    })
                }
            };
        }

        // Engine
        if let Some(url) = var("VOXRELAY_ENGINE_URL") {
            self.engine.url = url;
        }

        // Knowledge
        if let Some(url) = var("VOXRELAY_KNOWLEDGE_URL") {
            self.knowledge.url = Some(url).filter(|u| !u.is_empty());
        }

        // Session
        if let Some(voice) = var("VOXRELAY_VOICE_ID") {
            self.session.voice_id = voice;
        }
        if let Some(prompt) = var("VOXRELAY_SYSTEM_PROMPT") {
            self.session.default_system_prompt = Some(prompt);
        }

        // Reaper
        if let Some(secs) = var("VOXRELAY_INACTIVITY_TIMEOUT_SECS") {
            self.reaper.inactivity_timeout_seconds = parse("VOXRELAY_INACTIVITY_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = var("VOXRELAY_REAPER_INTERVAL_SECS") {
            self.reaper.interval_seconds = parse("VOXRELAY_REAPER_INTERVAL_SECS", &secs)?;
        }

        // Shutdown
        if let Some(ms) = var("VOXRELAY_SHUTDOWN_CEILING_MS") {
            self.shutdown.hard_ceiling_ms = parse("VOXRELAY_SHUTDOWN_CEILING_MS", &ms)?;
        }

        Ok(())
    }

    /// Reject settings the gateway cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let engine = url::Url::parse(&self.engine.url).map_err(|e| ConfigError::Invalid {
            key: "engine.url",
            value: format!("{} ({})", self.engine.url, e),
        })?;
        if !matches!(engine.scheme(), "ws" | "wss") {
            return Err(ConfigError::Invalid {
                key: "engine.url",
                value: self.engine.url.clone(),
            });
        }
        if let Some(knowledge) = &self.knowledge.url {
            url::Url::parse(knowledge).map_err(|e| ConfigError::Invalid {
                key: "knowledge.url",
                value: format!("{} ({})", knowledge, e),
            })?;
        }
        if self.reaper.interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                key: "reaper.interval_seconds",
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}
