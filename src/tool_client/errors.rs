//! Tool client error types.
//!
//! Low layers (supervisor, session) raise the detailed variants below. The
//! invoker collapses them onto [`ErrorKind`] before anything reaches a caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─── Taxonomy ────────────────────────────────────────────────────────────────

/// The caller-visible failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Executable missing, spawn failed, or the connection dropped.
    Unavailable,
    /// No readiness signal within the startup timeout.
    StartupTimeout,
    /// No correlated response within the request timeout.
    RequestTimeout,
    /// The server answered with an explicit JSON-RPC error envelope.
    ProtocolError,
    /// A response or the inner tool payload could not be decoded.
    ParseError,
    /// The tool ran (or was rejected up front) and reported failure.
    ToolError,
    /// Both the protocol path and the fallback path failed.
    FallbackExhausted,
}

impl ErrorKind {
    /// Whether this kind means "the channel was unavailable" rather than
    /// "the request was understood and refused".
    pub fn is_fallback_eligible(self) -> bool {
        matches!(
            self,
            ErrorKind::Unavailable | ErrorKind::StartupTimeout | ErrorKind::RequestTimeout
        )
    }
}

// ─── ToolClientError ─────────────────────────────────────────────────────────

/// Errors raised inside the tool client.
#[derive(Debug, Clone, Error)]
pub enum ToolClientError {
    /// The tool server could not be spawned or is not running.
    #[error("tool server '{server}' unavailable: {reason}")]
    Unavailable { server: String, reason: String },

    /// The tool server never signalled readiness.
    #[error("tool server '{server}' not ready after {timeout_ms}ms{stderr}")]
    StartupTimeout {
        server: String,
        timeout_ms: u64,
        /// Pre-formatted stderr suffix (empty when nothing was captured).
        stderr: String,
    },

    /// A request was not answered in time.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    RequestTimeout { method: String, timeout_ms: u64 },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ProtocolError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Malformed response envelope or inner tool payload.
    #[error("parse error: {reason}")]
    ParseError { reason: String },

    /// The tool executed and reported failure.
    #[error("tool '{tool}' failed: {message}")]
    ToolError { tool: String, message: String },

    /// The process exited or its pipes closed while requests were pending.
    #[error("connection lost to '{server}': {reason}")]
    ConnectionLost { server: String, reason: String },

    /// Protocol path and fallback path both failed.
    #[error("fallback exhausted for '{tool}': {primary}; fallback: {reason}")]
    FallbackExhausted {
        tool: String,
        primary: String,
        reason: String,
    },

    /// Arguments failed validation before reaching the wire.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The tool server does not advertise this tool.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl ToolClientError {
    /// Map onto the caller-visible taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolClientError::Unavailable { .. }
            | ToolClientError::ConnectionLost { .. }
            | ToolClientError::ConfigError { .. } => ErrorKind::Unavailable,
            ToolClientError::StartupTimeout { .. } => ErrorKind::StartupTimeout,
            ToolClientError::RequestTimeout { .. } => ErrorKind::RequestTimeout,
            ToolClientError::ProtocolError { .. } => ErrorKind::ProtocolError,
            ToolClientError::ParseError { .. } => ErrorKind::ParseError,
            ToolClientError::ToolError { .. }
            | ToolClientError::InvalidArguments { .. }
            | ToolClientError::UnknownTool { .. } => ErrorKind::ToolError,
            ToolClientError::FallbackExhausted { .. } => ErrorKind::FallbackExhausted,
        }
    }

    /// Shorthand for `self.kind().is_fallback_eligible()`.
    pub fn is_fallback_eligible(&self) -> bool {
        self.kind().is_fallback_eligible()
    }

    /// Render as a single diagnostic line.
    pub fn one_line(&self) -> String {
        one_line(&self.to_string())
    }
}

/// Collapse whitespace runs containing newlines so messages stay on one line.
pub(crate) fn one_line(message: &str) -> String {
    message.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ─── ToolFailure ─────────────────────────────────────────────────────────────

/// Structured failure carried inside a `ToolResult`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ToolClientError> for ToolFailure {
    fn from(err: &ToolClientError) -> Self {
        Self {
            kind: err.kind(),
            message: err.one_line(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
