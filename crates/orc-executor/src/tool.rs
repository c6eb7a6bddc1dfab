//! Tool-call dispatch to an external MCP-style endpoint (spec §4.7 step 2:
//! "tool steps resolve and invoke the MCP tool").
//!
//! Grounded on `WebSearchTool`'s JSON-RPC POST to `mcp.exa.ai/mcp`: same
//! request/response envelope, generalized to an arbitrary configured
//! endpoint instead of one hardcoded search server.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::ExecutorError;

#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool_name: &str, input: &Value) -> Result<Value, ExecutorError>;
}

#[derive(Serialize)]
struct McpToolCallRequest<'a> {
    jsonrpc: &'a str,
    id: u64,
    method: &'a str,
    params: McpToolCallParams<'a>,
}

#[derive(Serialize)]
struct McpToolCallParams<'a> {
    name: &'a str,
    arguments: &'a Value,
}

/// Invokes a tool through a single configured MCP server's `tools/call`
/// method over plain JSON (not the SSE-streamed variant).
pub struct McpToolInvoker {
    client: reqwest::Client,
    endpoint: String,
}

impl McpToolInvoker {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ToolInvoker for McpToolInvoker {
    async fn invoke(&self, tool_name: &str, input: &Value) -> Result<Value, ExecutorError> {
        let request = McpToolCallRequest {
            jsonrpc: "2.0",
            id: 1,
            method: "tools/call",
            params: McpToolCallParams {
                name: tool_name,
                arguments: input,
            },
        };

        let res = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ExecutorError::Mcp(e.to_string()))?;

        let status = res.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(ExecutorError::Transient(format!(
                "mcp server {status}: {body}"
            )));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ExecutorError::Mcp(format!("mcp server {status}: {body}")));
        }

        let body: Value = res
            .json()
            .await
            .map_err(|e| ExecutorError::Mcp(e.to_string()))?;

        body.get("result")
            .cloned()
            .ok_or_else(|| ExecutorError::Mcp(format!("tool '{tool_name}' returned no result")))
    }
}
