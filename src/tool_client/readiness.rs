//! Readiness detection for freshly started tool servers.
//!
//! Servers disagree on how they announce themselves: some answer the
//! `initialize` handshake promptly, others only print a banner on stderr and
//! answer later (or never). A session is ready as soon as any configured
//! strategy confirms it.

use std::fmt;

/// Banner substring printed by common stdio tool servers once they are serving.
pub const DEFAULT_READINESS_MARKER: &str = "running on stdio";

/// One way of deciding that a started server is ready for calls.
pub trait ReadinessStrategy: fmt::Debug + Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether a successful, correlated `initialize` response confirms readiness.
    fn confirms_on_handshake(&self) -> bool {
        false
    }

    /// Whether this diagnostic (stderr) line confirms readiness.
    fn confirms_on_diagnostic(&self, _line: &str) -> bool {
        false
    }
}

/// Ready once the handshake response arrives.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseReadiness;

impl ReadinessStrategy for ResponseReadiness {
    fn name(&self) -> &'static str {
        "response"
    }

    fn confirms_on_handshake(&self) -> bool {
        true
    }
}

/// Ready once a stderr line contains the marker.
#[derive(Debug, Clone)]
pub struct BannerReadiness {
    marker: String,
}

impl BannerReadiness {
    pub fn new(marker: &str) -> Self {
        Self {
            marker: marker.to_string(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }
}

impl Default for BannerReadiness {
    fn default() -> Self {
        Self::new(DEFAULT_READINESS_MARKER)
    }
}

impl ReadinessStrategy for BannerReadiness {
    fn name(&self) -> &'static str {
        "banner"
    }

    fn confirms_on_diagnostic(&self, line: &str) -> bool {
        line.contains(&self.marker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_strategy() {
        let s = ResponseReadiness;
        assert!(s.confirms_on_handshake());
        assert!(!s.confirms_on_diagnostic(DEFAULT_READINESS_MARKER));
    }

    #[test]
    fn test_banner_strategy_matches_substring() {
        let s = BannerReadiness::default();
        assert!(!s.confirms_on_handshake());
        assert!(s.confirms_on_diagnostic("Paper Search MCP server running on stdio"));
        assert!(!s.confirms_on_diagnostic("loading model weights..."));
    }
}
