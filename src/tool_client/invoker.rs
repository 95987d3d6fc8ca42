//! Tool invocation: `invoke(name, args)` and `list_tools()`.
//!
//! `tools/call` results use a double-encoding convention: the response's
//! `result.content` is an array of blocks, and the first `"text"` block holds
//! the tool's actual payload as a second JSON document. Both decode stages
//! are checked; a malformed inner payload is a `ParseError`, never an empty
//! success.

use std::sync::Arc;
use std::time::Instant;

use super::arguments::ToolArguments;
use super::errors::ToolClientError;
use super::fallback::FallbackClient;
use super::pool::ConnectionPool;
use super::types::{CallToolResult, ServedBy, ToolDescriptor, ToolResult};

pub struct ToolInvoker {
    pool: Arc<ConnectionPool>,
    fallbacks: FallbackClient,
}

impl ToolInvoker {
    /// Invoker with the fallbacks declared in the pool's config.
    pub fn new(pool: Arc<ConnectionPool>) -> Result<Self, ToolClientError> {
        let fallbacks = FallbackClient::from_config(pool.config())?;
        Ok(Self::with_fallbacks(pool, fallbacks))
    }

    pub fn with_fallbacks(pool: Arc<ConnectionPool>, fallbacks: FallbackClient) -> Self {
        Self { pool, fallbacks }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Tool descriptors advertised by the server (TTL-cached by the pool).
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolClientError> {
        self.pool.list_tools().await
    }

    /// Invoke one tool. Never fails: every outcome is a `ToolResult`.
    pub async fn invoke(&self, tool_name: &str, arguments: serde_json::Value) -> ToolResult {
        let started = Instant::now();
        let elapsed = || started.elapsed().as_millis() as u64;

        let args = match ToolArguments::parse(tool_name, arguments) {
            Ok(args) => args,
            Err(err) => {
                tracing::warn!(tool = tool_name, error = %err, "rejected tool arguments");
                return ToolResult::failure(tool_name, &err, elapsed(), ServedBy::Protocol);
            }
        };

        match self.call_protocol(&args).await {
            Ok(data) => {
                tracing::info!(tool = tool_name, elapsed_ms = elapsed(), "tool call succeeded");
                ToolResult::success(tool_name, data, elapsed(), ServedBy::Protocol)
            }
            Err(err) if err.is_fallback_eligible() && self.fallbacks.has_fallback(tool_name) => {
                tracing::warn!(
                    tool = tool_name,
                    error = %err.one_line(),
                    kind = ?err.kind(),
                    "protocol path unavailable, using fallback"
                );
                self.fallbacks.run(&args, &err, started).await
            }
            Err(err) => {
                tracing::warn!(
                    tool = tool_name,
                    error = %err.one_line(),
                    kind = ?err.kind(),
                    elapsed_ms = elapsed(),
                    "tool call failed"
                );
                ToolResult::failure(tool_name, &err, elapsed(), ServedBy::Protocol)
            }
        }
    }

    async fn call_protocol(&self, args: &ToolArguments) -> Result<serde_json::Value, ToolClientError> {
        let tool = args.tool_name();
        let config = self.pool.config();
        let session = self.pool.session().await?;
        let wire_args = args.to_wire();

        if config.validate_tool_names {
            let tools = self.pool.list_tools().await?;
            let descriptor = tools
                .iter()
                .find(|t| t.name == tool)
                .ok_or_else(|| ToolClientError::UnknownTool {
                    name: tool.to_string(),
                })?;
            descriptor.check_required(&wire_args)?;
        }

        let timeout = config.timeout_for(tool);
        tracing::debug!(
            tool,
            session = %session.id(),
            timeout_ms = timeout.as_millis() as u64,
            "calling tool"
        );
        let raw = session
            .call(
                "tools/call",
                serde_json::json!({"name": tool, "arguments": wire_args}),
                timeout,
            )
            .await?;
        decode_tool_payload(tool, raw)
    }
}

/// Decode a `tools/call` result into the tool's own JSON payload.
///
/// Stage one parses the envelope; stage two parses the first text block as
/// JSON. An `isError` envelope, or an inner `{"success": false, "error": ..}`
/// object, becomes `ToolError`.
pub fn decode_tool_payload(
    tool_name: &str,
    raw: serde_json::Value,
) -> Result<serde_json::Value, ToolClientError> {
    let envelope: CallToolResult =
        serde_json::from_value(raw).map_err(|e| ToolClientError::ParseError {
            reason: format!("malformed tools/call result for '{tool_name}': {e}"),
        })?;

    if envelope.is_error {
        return Err(ToolClientError::ToolError {
            tool: tool_name.to_string(),
            message: envelope
                .first_text()
                .unwrap_or("tool reported an error")
                .to_string(),
        });
    }

    let text = envelope.first_text().ok_or_else(|| ToolClientError::ParseError {
        reason: format!("tools/call result for '{tool_name}' has no text content"),
    })?;

    let payload: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ToolClientError::ParseError {
            reason: format!("payload of '{tool_name}' is not JSON: {e}"),
        })?;

    if payload.get("success") == Some(&serde_json::Value::Bool(false)) {
        let message = match payload.get("error") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "tool reported failure".to_string(),
        };
        return Err(ToolClientError::ToolError {
            tool: tool_name.to_string(),
            message,
        });
    }

    Ok(payload)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
