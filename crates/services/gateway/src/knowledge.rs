//! Knowledge lookup over HTTP

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use voxrelay_core::{Error, KnowledgeBase, Result, KNOWLEDGE_TOOL_NAME, NO_ANSWER_FOUND};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    top_k: u32,
}

/// Retrieval service response; either field may be absent
#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    passages: Vec<String>,
}

/// Pick the text to read back to the caller
fn answer_from(response: QueryResponse) -> String {
    if let Some(answer) = response.answer.filter(|a| !a.trim().is_empty()) {
        return answer;
    }
    let passages: Vec<&str> = response
        .passages
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();
    if passages.is_empty() {
        NO_ANSWER_FOUND.to_string()
    } else {
        passages.join("\n")
    }
}

fn lookup_error(message: impl ToString) -> Error {
    Error::ToolInvocation {
        tool: KNOWLEDGE_TOOL_NAME.to_string(),
        message: message.to_string(),
    }
}

/// Knowledge base behind a JSON retrieval endpoint
pub struct HttpKnowledgeBase {
    client: reqwest::Client,
    url: String,
    top_k: u32,
}

impl HttpKnowledgeBase {
    pub fn new(url: impl Into<String>, top_k: u32, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(lookup_error)?;
        Ok(Self {
            client,
            url: url.into(),
            top_k,
        })
    }
}

#[async_trait]
impl KnowledgeBase for HttpKnowledgeBase {
    async fn query(&self, question: &str) -> Result<String> {
        tracing::debug!(url = %self.url, "Querying knowledge base");

        let response = self
            .client
            .post(&self.url)
            .json(&QueryRequest {
                query: question,
                top_k: self.top_k,
            })
            .send()
            .await
            .map_err(lookup_error)?
            .error_for_status()
            .map_err(lookup_error)?;

        let body: QueryResponse = response.json().await.map_err(lookup_error)?;
        Ok(answer_from(body))
    }
}

/// Knowledge base used when no retrieval endpoint is configured
pub struct NullKnowledgeBase;

#[async_trait]
impl KnowledgeBase for NullKnowledgeBase {
    async fn query(&self, _question: &str) -> Result<String> {
        Ok(NO_ANSWER_FOUND.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_preferred_over_passages() {
        let response = QueryResponse {
            answer: Some("Abrimos a las 9.".to_string()),
            passages: vec!["Horario: 9 a 18".to_string()],
        };
        assert_eq!(answer_from(response), "Abrimos a las 9.");
    }

    #[test]
    fn test_passages_joined() {
        let response = QueryResponse {
            answer: Some("  ".to_string()),
            passages: vec!["uno".to_string(), "".to_string(), "dos".to_string()],
        };
        assert_eq!(answer_from(response), "uno\ndos");
    }

    #[test]
    fn test_empty_response_is_no_answer() {
        assert_eq!(answer_from(QueryResponse::default()), NO_ANSWER_FOUND);
        let parsed: QueryResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(answer_from(parsed), NO_ANSWER_FOUND);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_tool_error() {
        let kb = HttpKnowledgeBase::new("http://127.0.0.1:1/query", 3, Duration::from_secs(2)).unwrap();
        let err = kb.query("hola").await.unwrap_err();
        assert!(matches!(err, Error::ToolInvocation { ref tool, .. } if tool == KNOWLEDGE_TOOL_NAME));
    }

    #[tokio::test]
    async fn test_null_knowledge_base() {
        assert_eq!(NullKnowledgeBase.query("hola").await.unwrap(), NO_ANSWER_FOUND);
    }
}
