//! toolrelay: a pooled client for tool servers that speak line-delimited
//! JSON-RPC over stdio.
//!
//! - [`tool_client`] launches the server, runs the handshake, multiplexes
//!   concurrent calls over one session and falls back to direct HTTP when
//!   the server is unavailable.
//! - [`logging`] installs the tracing subscriber used by the binary.

pub mod logging;
pub mod tool_client;
