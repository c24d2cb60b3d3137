//! Streamable-HTTP MCP client for invoking tools through a deployed gateway.

use crate::error::AuthError;
use crate::model::Credential;
use crate::token::TokenProvider;
use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use url::Url;

const JSON_MIME_TYPE: &str = "application/json";
const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
const PROTOCOL_VERSION: &str = "2025-03-26";

/// Built-in semantic search tool exposed by gateways that have it enabled.
pub const SEARCH_TOOL: &str = "x_amz_bedrock_agentcore_search";

#[derive(Error, Debug)]
pub enum McpError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("invalid gateway url '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("{method}: request failed: {source}")]
    Http {
        method: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method}: gateway returned HTTP {status}: {body}")]
    Status {
        method: String,
        status: u16,
        body: String,
    },

    #[error("{method}: unexpected content type {content_type:?}")]
    ContentType {
        method: String,
        content_type: Option<String>,
    },

    #[error("{method}: {message}")]
    Protocol { method: String, message: String },

    #[error("{method}: JSON-RPC error {code}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
}

/// What the server said about itself during `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
    pub protocol_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

/// Result of `tools/call`; text content is decoded as JSON when it parses.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub tool_name: String,
    pub arguments: Value,
    pub content: Vec<Value>,
    pub is_error: bool,
}

struct PostResponse {
    message: Option<Value>,
    session_id: Option<String>,
}

/// One MCP session against a gateway, authenticated with client-credentials tokens.
pub struct McpToolClient {
    http: reqwest::Client,
    endpoint: Url,
    tokens: TokenProvider,
    credential: Credential,
    session_id: Option<String>,
    server: ServerInfo,
    next_id: AtomicU64,
}

impl McpToolClient {
    /// The MCP endpoint for a gateway URL: `/mcp` is appended unless already there.
    ///
    /// # Errors
    ///
    /// Returns `McpError::InvalidUrl` when `gateway_url` is not an absolute http(s) URL.
    pub fn endpoint_url(gateway_url: &str) -> Result<Url, McpError> {
        let invalid = |message: String| McpError::InvalidUrl {
            url: gateway_url.to_string(),
            message,
        };
        let mut url = Url::parse(gateway_url.trim()).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }
        let path = url.path().trim_end_matches('/').to_string();
        if !path.ends_with("/mcp") {
            url.set_path(&format!("{path}/mcp"));
        }
        Ok(url)
    }

    /// Open a session: `initialize`, then `notifications/initialized`.
    ///
    /// # Errors
    ///
    /// Fails when no token can be obtained or the gateway refuses the handshake.
    pub async fn connect(
        http: reqwest::Client,
        gateway_url: &str,
        tokens: TokenProvider,
        credential: Credential,
    ) -> Result<Self, McpError> {
        let mut client = Self {
            http,
            endpoint: Self::endpoint_url(gateway_url)?,
            tokens,
            credential,
            session_id: None,
            server: ServerInfo::default(),
            next_id: AtomicU64::new(0),
        };

        let init = client.envelope(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        );
        let resp = client.post("initialize", &init).await?;
        let result = result_of("initialize", resp.message)?;
        client.session_id = resp.session_id;
        client.server = ServerInfo {
            name: str_at(&result, &["serverInfo", "name"]),
            version: str_at(&result, &["serverInfo", "version"]),
            protocol_version: str_at(&result, &["protocolVersion"]),
        };
        tracing::info!(
            endpoint = %client.endpoint,
            server = client.server.name.as_deref().unwrap_or("unknown"),
            session = client.session_id.is_some(),
            "MCP session initialized"
        );

        let note = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        client.post("notifications/initialized", &note).await?;
        Ok(client)
    }

    #[must_use]
    pub fn server_info(&self) -> &ServerInfo {
        &self.server
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// All tools, following `nextCursor` across pages.
    ///
    /// # Errors
    ///
    /// Fails on transport, HTTP or JSON-RPC errors.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = self.request("tools/list", params).await?;
            let page: Vec<ToolInfo> = serde_json::from_value(
                result.get("tools").cloned().unwrap_or_else(|| json!([])),
            )
            .map_err(|e| McpError::Protocol {
                method: "tools/list".to_string(),
                message: format!("invalid tools array: {e}"),
            })?;
            tools.extend(page);
            cursor = str_at(&result, &["nextCursor"]).filter(|c| !c.is_empty());
            if cursor.is_none() {
                return Ok(tools);
            }
        }
    }

    /// Invoke one tool.
    ///
    /// A tool-level failure is reported through `is_error`, not as `Err`.
    ///
    /// # Errors
    ///
    /// Fails on transport, HTTP or JSON-RPC errors.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpError> {
        let result = self
            .request(
                "tools/call",
                json!({ "name": name, "arguments": arguments.clone() }),
            )
            .await?;
        let content = result
            .get("content")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(decode_content).collect())
            .unwrap_or_default();
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if is_error {
            tracing::warn!(tool = name, "tool reported an error");
        }
        Ok(ToolCallResult {
            tool_name: name.to_string(),
            arguments,
            content,
            is_error,
        })
    }

    /// Semantic tool search. Gateways without search enabled yield an empty list.
    pub async fn search_tools(&self, query: &str) -> Vec<Value> {
        let result = match self.call_tool(SEARCH_TOOL, json!({ "query": query })).await {
            Ok(r) if !r.is_error => r,
            Ok(r) => {
                tracing::warn!(content = ?r.content, "semantic search not available");
                return Vec::new();
            }
            Err(err) => {
                tracing::warn!(error = %err, "semantic search not available");
                return Vec::new();
            }
        };
        let mut found = Vec::new();
        for item in result.content {
            match item {
                Value::Array(list) => found.extend(list),
                obj @ Value::Object(_) => found.push(obj),
                _ => {}
            }
        }
        found
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let msg = self.envelope(method, params);
        let resp = self.post(method, &msg).await?;
        result_of(method, resp.message)
    }

    fn envelope(&self, method: &str, params: Value) -> Value {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
    }

    async fn post(&self, method: &str, body: &Value) -> Result<PostResponse, McpError> {
        let token = self.tokens.get_token(&self.credential).await?;
        let http_err = |source| McpError::Http {
            method: method.to_string(),
            source,
        };

        let mut req = self
            .http
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, JSON_MIME_TYPE)
            .header(
                reqwest::header::ACCEPT,
                format!("{JSON_MIME_TYPE}, {EVENT_STREAM_MIME_TYPE}"),
            )
            .header(reqwest::header::AUTHORIZATION, token.authorization_header())
            .json(body);
        if let Some(sid) = &self.session_id {
            req = req.header(HEADER_SESSION_ID, sid.as_str());
        }

        let resp = req.send().await.map_err(http_err)?;
        let status = resp.status();
        let session_id = resp
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);

        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(PostResponse {
                message: None,
                session_id,
            });
        }
        if !status.is_success() {
            if status == reqwest::StatusCode::UNAUTHORIZED {
                self.tokens.invalidate(&self.credential).await;
            }
            let body = resp.text().await.unwrap_or_default();
            return Err(McpError::Status {
                method: method.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.split(';').next().unwrap_or(s).trim().to_ascii_lowercase());
        let message = match content_type.as_deref() {
            Some(EVENT_STREAM_MIME_TYPE) => Some(read_sse_response(method, resp).await?),
            Some(JSON_MIME_TYPE) => Some(resp.json::<Value>().await.map_err(http_err)?),
            _ => {
                return Err(McpError::ContentType {
                    method: method.to_string(),
                    content_type,
                });
            }
        };
        Ok(PostResponse {
            message,
            session_id,
        })
    }
}

/// First JSON-RPC response on the stream; server notifications before it are skipped.
async fn read_sse_response(method: &str, resp: reqwest::Response) -> Result<Value, McpError> {
    let protocol = |message: String| McpError::Protocol {
        method: method.to_string(),
        message,
    };
    let mut stream = sse_stream::SseStream::from_bytes_stream(resp.bytes_stream());
    while let Some(evt) = stream.next().await {
        let evt = evt.map_err(|e| protocol(format!("read SSE event: {e}")))?;
        let payload = evt.data.unwrap_or_default();
        if payload.trim().is_empty() {
            continue;
        }
        let msg: Value = serde_json::from_str(&payload)
            .map_err(|e| protocol(format!("parse SSE data as JSON-RPC: {e}")))?;
        if msg.get("result").is_some() || msg.get("error").is_some() {
            return Ok(msg);
        }
    }
    Err(protocol(
        "event-stream ended without a response".to_string(),
    ))
}

fn result_of(method: &str, message: Option<Value>) -> Result<Value, McpError> {
    let Some(mut msg) = message else {
        return Err(McpError::Protocol {
            method: method.to_string(),
            message: "expected a response, got 202 Accepted".to_string(),
        });
    };
    if let Some(err) = msg.get("error") {
        return Err(McpError::Rpc {
            method: method.to_string(),
            code: err.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: str_at(err, &["message"]).unwrap_or_default(),
        });
    }
    match msg.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(McpError::Protocol {
            method: method.to_string(),
            message: "response has neither result nor error".to_string(),
        }),
    }
}

fn decode_content(item: &Value) -> Value {
    match item.get("text").and_then(Value::as_str) {
        Some(text) => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        None => item.clone(),
    }
}

fn str_at(v: &Value, path: &[&str]) -> Option<String> {
    path.iter()
        .try_fold(v, |cur, key| cur.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}
