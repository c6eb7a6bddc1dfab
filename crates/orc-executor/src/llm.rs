//! LLM call dispatch (spec §4.7 step 2: "Dispatch: LLM steps call the
//! configured provider; tool steps resolve and invoke the MCP tool").
//!
//! Grounded on the direct `reqwest::Client` JSON-POST idiom `WebSearchTool`'s
//! MCP-call path used, generalized to a pluggable `LlmProvider` so tests
//! don't need a live HTTP endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::ExecutorError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub prompt: Value,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub output: Value,
    #[serde(default)]
    pub usage: TokenUsage,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, ExecutorError>;
}

/// Calls an OpenAI-compatible chat completion endpoint.
pub struct HttpLlmProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpLlmProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, ExecutorError> {
        let res = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| ExecutorError::Transient(e.to_string()))?;

        let status = res.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let body = res.text().await.unwrap_or_default();
            return Err(ExecutorError::Transient(format!(
                "llm provider returned {status}: {body}"
            )));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ExecutorError::Llm(format!(
                "llm provider returned {status}: {body}"
            )));
        }

        res.json::<LlmResponse>()
            .await
            .map_err(|e| ExecutorError::Llm(e.to_string()))
    }
}

/// Dispatches one LLM call, retrying transient failures up to
/// `max_attempts` times with the given fixed delay between attempts (spec
/// §4.7 step 2: retries are "bounded by max_retries over transient errors").
pub async fn dispatch_with_retry(
    provider: &dyn LlmProvider,
    request: &LlmRequest,
    max_attempts: u32,
    retry_delay: Duration,
) -> Result<LlmResponse, ExecutorError> {
    let mut attempt = 1;
    loop {
        match provider.complete(request).await {
            Ok(response) => return Ok(response),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                tracing::warn!(attempt, max_attempts, error = %err, "transient llm error, retrying");
                tokio::time::sleep(retry_delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
