//! Shared types for the tool client.
//!
//! JSON-RPC 2.0 message types, tool protocol structures, and the result shape
//! handed back to callers.

use serde::{Deserialize, Serialize};

use super::errors::{ToolClientError, ToolFailure};

/// Protocol revision announced in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no `id`, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// Any line read from the server's stdout that parsed as JSON.
///
/// Fields are all optional: the line may be a response, a server-initiated
/// request, a notification, or unrelated JSON logging.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl IncomingMessage {
    /// The numeric id of a response addressed to us, if this is one.
    ///
    /// Server-initiated requests also carry ids; those are never correlated.
    pub fn response_id(&self) -> Option<u64> {
        if self.method.is_some() {
            return None;
        }
        self.id.as_ref().and_then(serde_json::Value::as_u64)
    }

    /// Convert into the outcome of the correlated call.
    pub fn into_reply(self) -> Result<serde_json::Value, ToolClientError> {
        if let Some(err) = self.error {
            return Err(ToolClientError::ProtocolError {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }

        self.result.ok_or(ToolClientError::ProtocolError {
            code: error_codes::INTERNAL_ERROR,
            message: "response missing both result and error".into(),
            data: None,
        })
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

// ─── Handshake ──────────────────────────────────────────────────────────────

/// Client identity sent during `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// `initialize` request parameters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: serde_json::Value,
    pub client_info: ClientInfo,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({}),
            client_info: ClientInfo::default(),
        }
    }
}

// ─── Tools ──────────────────────────────────────────────────────────────────

/// A tool advertised by the server in `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
}

impl ToolDescriptor {
    /// Structural check: every field listed in `inputSchema.required` is present.
    ///
    /// Full JSON Schema validation is left to the server.
    pub fn check_required(&self, arguments: &serde_json::Value) -> Result<(), ToolClientError> {
        let Some(required) = self
            .input_schema
            .get("required")
            .and_then(serde_json::Value::as_array)
        else {
            return Ok(());
        };

        let args_obj = arguments.as_object();
        for field_name in required.iter().filter_map(serde_json::Value::as_str) {
            let has_field = args_obj
                .map(|obj| obj.contains_key(field_name))
                .unwrap_or(false);
            if !has_field {
                return Err(ToolClientError::InvalidArguments {
                    tool: self.name.clone(),
                    reason: format!("missing required field: '{field_name}'"),
                });
            }
        }

        Ok(())
    }
}

/// `tools/list` result payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// One element of a `tools/call` result's `content` array.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// `tools/call` result envelope.
///
/// The tool's real payload is a second JSON document embedded as the `text`
/// of a `"text"` content block.
#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, rename = "isError", alias = "is_error")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Text of the first `"text"` content block.
    pub fn first_text(&self) -> Option<&str> {
        self.content
            .iter()
            .find(|block| block.kind == "text")
            .and_then(|block| block.text.as_deref())
    }
}

// ─── Session State ──────────────────────────────────────────────────────────

/// Lifecycle of a protocol session.
///
/// Transitions only move forward, except `Ready` ↔ `Degraded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Starting,
    Ready,
    /// Ready, but the last request(s) timed out.
    Degraded,
    Closed,
}

impl SessionState {
    /// Whether calls may be issued in this state.
    pub fn accepts_calls(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Degraded)
    }
}

// ─── Results ────────────────────────────────────────────────────────────────

/// Which path produced a `ToolResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServedBy {
    Protocol,
    Fallback,
}

/// Result of a tool invocation, identical in shape for both paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
    pub execution_time_ms: u64,
    pub served_by: ServedBy,
}

impl ToolResult {
    pub fn success(
        tool_name: &str,
        data: serde_json::Value,
        execution_time_ms: u64,
        served_by: ServedBy,
    ) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            success: true,
            data: Some(data),
            error: None,
            execution_time_ms,
            served_by,
        }
    }

    pub fn failure(
        tool_name: &str,
        error: &ToolClientError,
        execution_time_ms: u64,
        served_by: ServedBy,
    ) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            success: false,
            data: None,
            error: Some(ToolFailure::from(error)),
            execution_time_ms,
            served_by,
        }
    }
}

// ─── Standard Error Codes ───────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
