//! Tool client: JSON-RPC over stdio to an external tool server.
//!
//! This module handles:
//! - Spawning and supervising the tool server process
//! - The `initialize` handshake, with response- or banner-based readiness
//! - Concurrent requests on one session, correlated by id
//! - A pooled session per client plus a TTL-cached tool list
//! - Decoding double-encoded `tools/call` payloads
//! - Direct-network fallbacks when the protocol path is unavailable
//!
//! Callers use [`ToolInvoker`] over a shared [`ConnectionPool`].

pub mod arguments;
pub mod config;
pub mod errors;
pub mod fallback;
pub mod invoker;
pub mod pool;
pub mod readiness;
pub mod session;
pub mod supervisor;
pub mod types;

// Re-exports for convenience
pub use arguments::{SearchPapersArgs, ToolArguments};
pub use config::{load_config, ToolClientConfig};
pub use errors::{ErrorKind, ToolClientError, ToolFailure};
pub use fallback::{FallbackClient, FallbackProvider, PaperRecord, PaperSearchFallback};
pub use invoker::{decode_tool_payload, ToolInvoker};
pub use pool::{CacheStatus, ConnectionPool};
pub use readiness::{BannerReadiness, ReadinessStrategy, ResponseReadiness};
pub use session::ProtocolSession;
pub use types::{ServedBy, SessionState, ToolDescriptor, ToolResult};
