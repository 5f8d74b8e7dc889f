//! External collaborators: knowledge lookup and tool execution

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::protocol::ToolSpec;
use crate::{Error, Result};

/// Answer returned when the knowledge base has nothing for a question
pub const NO_ANSWER_FOUND: &str = "No se encontró una respuesta en la base de conocimiento.";

/// Tool name under which the knowledge base is advertised to the engine
pub const KNOWLEDGE_TOOL_NAME: &str = "knowledgeBaseLookup";

/// Text retrieval over a knowledge base
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Answer `question`; implementations return [`NO_ANSWER_FOUND`] rather
    /// than an error when nothing matches
    async fn query(&self, question: &str) -> Result<String>;
}

/// A tool call requested by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub tool_use_id: String,
    pub input: Value,
}

impl ToolInvocation {
    /// Build from the raw `toolUse` payload; non-JSON content is kept as a string
    pub fn from_tool_use(tool_name: &str, tool_use_id: &str, content: &str) -> Self {
        let input = serde_json::from_str(content).unwrap_or_else(|_| Value::String(content.to_string()));
        Self {
            tool_name: tool_name.to_string(),
            tool_use_id: tool_use_id.to_string(),
            input,
        }
    }
}

/// Runs tools on behalf of sessions
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Tools advertised to the engine at prompt start
    fn specs(&self) -> Vec<ToolSpec>;

    /// Run `invocation`; fails with `Error::ToolInvocation`
    async fn invoke(&self, invocation: &ToolInvocation) -> Result<Value>;
}

/// Exposes a [`KnowledgeBase`] as the `knowledgeBaseLookup` tool
pub struct KnowledgeBaseTool {
    knowledge: Arc<dyn KnowledgeBase>,
}

impl KnowledgeBaseTool {
    pub fn new(knowledge: Arc<dyn KnowledgeBase>) -> Self {
        Self { knowledge }
    }

    fn question(input: &Value) -> Option<&str> {
        match input {
            Value::String(s) => Some(s.as_str()),
            Value::Object(map) => ["query", "question", "text"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str)),
            _ => None,
        }
    }
}

#[async_trait]
impl ToolHandler for KnowledgeBaseTool {
    fn specs(&self) -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: KNOWLEDGE_TOOL_NAME.to_string(),
            description: "Look up an answer in the knowledge base".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "The user's question" }
                },
                "required": ["query"]
            }),
        }]
    }

    async fn invoke(&self, invocation: &ToolInvocation) -> Result<Value> {
        if invocation.tool_name != KNOWLEDGE_TOOL_NAME {
            return Err(Error::ToolInvocation {
                tool: invocation.tool_name.clone(),
                message: "unknown tool".to_string(),
            });
        }
        let question = Self::question(&invocation.input).ok_or_else(|| Error::ToolInvocation {
            tool: invocation.tool_name.clone(),
            message: "missing query in tool input".to_string(),
        })?;
        let answer = self.knowledge.query(question).await?;
        Ok(json!({ "answer": answer }))
    }
}
