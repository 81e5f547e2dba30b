//! Client for the in-sandbox agent control plane.
//!
//! The agent exposes a small HTTP surface over the sandbox's endpoint:
//! `POST /execute` streaming SSE, `POST /exec` and `POST /exec/binary`
//! for subprocess execution (the file-sync fallback when direct mounts
//! are unavailable), and `GET /health`.

use anyhow::{Context, Result};
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use crate::endpoint::{EndpointClient, TransportEndpoint};
use crate::error::WorkspaceError;
use crate::events::AgentEvent;

/// MCP server wiring passed through to the agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// One turn's worth of agent options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl ExecuteRequest {
    pub fn from_input(input: &str) -> Self {
        Self {
            input: input.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize)]
struct ExecBody<'a> {
    cmd: &'a [String],
    timeout: u64,
}

/// `/exec` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecResponse {
    pub exit_code: i64,
    pub output: String,
}

/// Decoded agent event stream.
pub type AgentEventStream =
    Pin<Box<dyn Stream<Item = Result<AgentEvent, WorkspaceError>> + Send>>;

/// Client over either transport flavor.
#[derive(Clone, Default)]
pub struct AgentClient {
    client: EndpointClient,
}

impl AgentClient {
    pub fn new() -> Self {
        Self {
            client: EndpointClient::new(),
        }
    }

    /// Start one agent turn; the response is an SSE stream decoded into
    /// [`AgentEvent`]s. Transport errors surface as `agent-disconnect`.
    pub async fn execute(
        &self,
        endpoint: &TransportEndpoint,
        request: &ExecuteRequest,
    ) -> Result<AgentEventStream, WorkspaceError> {
        let bytes = self
            .client
            .post_stream(endpoint, "/execute", request)
            .await
            .map_err(|e| WorkspaceError::AgentDisconnect(e.to_string()))?;

        let events = bytes.eventsource().map(|frame| match frame {
            Ok(frame) => Ok(AgentEvent::from_sse(&frame.event, &frame.data)),
            Err(e) => Err(WorkspaceError::AgentDisconnect(e.to_string())),
        });
        Ok(Box::pin(events))
    }

    /// Run a subprocess inside the sandbox, combined output.
    pub async fn exec(
        &self,
        endpoint: &TransportEndpoint,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<ExecResponse> {
        self.client
            .post_json(
                endpoint,
                "/exec",
                &ExecBody {
                    cmd,
                    timeout: timeout.as_secs(),
                },
            )
            .await
            .context("agent /exec failed")
    }

    /// Run a subprocess, raw stdout bytes; the exit code rides in the
    /// `X-Exit-Code` response header.
    pub async fn exec_binary(
        &self,
        endpoint: &TransportEndpoint,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<(i64, Vec<u8>)> {
        let response = self
            .client
            .post_raw(
                endpoint,
                "/exec/binary",
                &ExecBody {
                    cmd,
                    timeout: timeout.as_secs(),
                },
            )
            .await
            .context("agent /exec/binary failed")?;
        let exit_code = response
            .headers
            .get("x-exit-code")
            .and_then(|v| v.parse().ok())
            .unwrap_or(-1);
        Ok((exit_code, response.body.to_vec()))
    }

    pub async fn health(&self, endpoint: &TransportEndpoint) -> bool {
        self.client.health(endpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_request_serialization() {
        let mut request = ExecuteRequest::from_input("fix the bug");
        request.model = Some("claude-sonnet".into());
        request.allowed_tools = vec!["bash".into(), "edit".into()];
        request.mcp_servers.push(McpServerConfig {
            name: "search".into(),
            url: "https://mcp.example.com/".into(),
            headers: HashMap::new(),
        });

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["input"], "fix the bug");
        assert_eq!(json["model"], "claude-sonnet");
        assert_eq!(json["allowed_tools"][1], "edit");
        assert_eq!(json["mcp_servers"][0]["name"], "search");
        // Absent optionals stay off the wire.
        assert!(json.get("system_prompt").is_none());
    }

    #[test]
    fn test_execute_request_minimal_deserialization() {
        let request: ExecuteRequest =
            serde_json::from_str(r#"{"input":"hello"}"#).unwrap();
        assert_eq!(request.input, "hello");
        assert!(request.allowed_tools.is_empty());
        assert!(request.model.is_none());
    }

    #[test]
    fn test_exec_body_shape() {
        let cmd = vec!["ls".to_string(), "-la".to_string()];
        let body = ExecBody {
            cmd: &cmd,
            timeout: 30,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["cmd"][0], "ls");
        assert_eq!(json["timeout"], 30);
    }
}
