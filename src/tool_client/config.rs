//! Tool client configuration loading and validation.
//!
//! Reads `toolrelay.yaml` and resolves environment variables. The file names
//! the tool server to launch, the timeouts, readiness detection, and which
//! tools have a direct-network fallback.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::arguments::SEARCH_PAPERS;
use super::errors::ToolClientError;
use super::readiness::{
    BannerReadiness, ReadinessStrategy, ResponseReadiness, DEFAULT_READINESS_MARKER,
};

/// File name searched for when no explicit path is given.
pub const CONFIG_FILE_NAME: &str = "toolrelay.yaml";

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "TOOLRELAY_CONFIG";

/// Public Semantic Scholar API root.
pub const SEMANTIC_SCHOLAR_BASE_URL: &str = "https://api.semanticscholar.org";

// ─── Public Types ────────────────────────────────────────────────────────────

/// How to launch the tool server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Human-readable server name used in logs and errors.
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables forwarded to the child.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Session and request timeouts, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_startup_ms")]
    pub startup_ms: u64,
    #[serde(default = "default_request_ms")]
    pub request_ms: u64,
    #[serde(default = "default_list_tools_ms")]
    pub list_tools_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_startup_ms() -> u64 {
    10_000
}
fn default_request_ms() -> u64 {
    30_000
}
fn default_list_tools_ms() -> u64 {
    10_000
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup_ms: default_startup_ms(),
            request_ms: default_request_ms(),
            list_tools_ms: default_list_tools_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }
    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }
    pub fn list_tools(&self) -> Duration {
        Duration::from_millis(self.list_tools_ms)
    }
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Which readiness signals confirm a started session.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadinessConfig {
    /// A correlated `initialize` response confirms readiness.
    #[serde(default = "default_true")]
    pub response: bool,
    /// Marker substring on stderr that confirms readiness. `null` disables it.
    #[serde(default = "default_banner")]
    pub banner: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_banner() -> Option<String> {
    Some(DEFAULT_READINESS_MARKER.to_string())
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            response: true,
            banner: default_banner(),
        }
    }
}

impl ReadinessConfig {
    /// Build the configured strategies.
    pub fn strategies(&self) -> Vec<Arc<dyn ReadinessStrategy>> {
        let mut strategies: Vec<Arc<dyn ReadinessStrategy>> = Vec::new();
        if self.response {
            strategies.push(Arc::new(ResponseReadiness));
        }
        if let Some(marker) = self.banner.as_deref().filter(|m| !m.is_empty()) {
            strategies.push(Arc::new(BannerReadiness::new(marker)));
        }
        strategies
    }
}

/// A direct-network substitute for one tool.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackConfig {
    /// Paper search through the Semantic Scholar Graph API.
    SemanticScholar {
        #[serde(default = "default_semantic_scholar_url")]
        base_url: String,
        #[serde(default = "default_fallback_timeout_ms")]
        timeout_ms: u64,
        #[serde(default)]
        api_key: Option<String>,
    },
}

fn default_semantic_scholar_url() -> String {
    SEMANTIC_SCHOLAR_BASE_URL.to_string()
}
fn default_fallback_timeout_ms() -> u64 {
    10_000
}
fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_max_consecutive_timeouts() -> u32 {
    3
}

/// Top-level tool client configuration (mirrors `toolrelay.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct ToolClientConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Per-tool `tools/call` timeouts overriding `timeouts.request_ms`.
    #[serde(default)]
    pub tool_timeouts_ms: HashMap<String, u64>,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    /// Lifetime of the cached `tools/list` result.
    #[serde(default = "default_cache_ttl_secs")]
    pub tools_cache_ttl_secs: u64,
    /// Check tool names (and required fields) against `tools/list` before calling.
    #[serde(default = "default_true")]
    pub validate_tool_names: bool,
    /// Consecutive request timeouts after which a degraded session is replaced.
    #[serde(default = "default_max_consecutive_timeouts")]
    pub max_consecutive_timeouts: u32,
    #[serde(default)]
    pub fallbacks: HashMap<String, FallbackConfig>,
}

impl ToolClientConfig {
    /// Build a config in code with every optional setting at its default.
    pub fn for_command(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            server: ServerConfig {
                name: name.to_string(),
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                env: HashMap::new(),
                cwd: None,
            },
            timeouts: TimeoutConfig::default(),
            tool_timeouts_ms: HashMap::new(),
            readiness: ReadinessConfig::default(),
            tools_cache_ttl_secs: default_cache_ttl_secs(),
            validate_tool_names: true,
            max_consecutive_timeouts: default_max_consecutive_timeouts(),
            fallbacks: HashMap::new(),
        }
    }

    /// The `tools/call` timeout for one tool.
    pub fn timeout_for(&self, tool_name: &str) -> Duration {
        self.tool_timeouts_ms
            .get(tool_name)
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or_else(|| self.timeouts.request())
    }

    pub fn tools_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.tools_cache_ttl_secs)
    }

    /// Reject configs that cannot work.
    pub fn validate(&self) -> Result<(), ToolClientError> {
        let fail = |reason: String| Err(ToolClientError::ConfigError { reason });

        if self.server.command.trim().is_empty() {
            return fail(format!("server '{}' has an empty command", self.server.name));
        }

        let t = &self.timeouts;
        if t.startup_ms == 0
            || t.request_ms == 0
            || t.list_tools_ms == 0
            || t.shutdown_grace_ms == 0
        {
            return fail("timeouts must be greater than zero".into());
        }
        if let Some((tool, _)) = self.tool_timeouts_ms.iter().find(|(_, ms)| **ms == 0) {
            return fail(format!("timeout for tool '{tool}' must be greater than zero"));
        }

        if self.readiness.strategies().is_empty() {
            return fail("at least one readiness strategy must be enabled".into());
        }

        for (tool, fallback) in &self.fallbacks {
            match fallback {
                FallbackConfig::SemanticScholar { timeout_ms, .. } => {
                    if tool != SEARCH_PAPERS {
                        return fail(format!(
                            "semantic_scholar fallback only serves '{SEARCH_PAPERS}', not '{tool}'"
                        ));
                    }
                    if *timeout_ms == 0 {
                        return fail(format!("fallback timeout for '{tool}' must be greater than zero"));
                    }
                }
            }
        }

        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `TOOLRELAY_CONFIG`, then walks upward from `start` looking for
/// `toolrelay.yaml`, then falls back to the platform config directory.
pub fn find_config_path(start: &Path) -> Result<PathBuf, ToolClientError> {
    // 1. Explicit env var
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(path);
        if candidate.exists() {
            return Ok(candidate);
        }
        return Err(ToolClientError::ConfigError {
            reason: format!(
                "{CONFIG_ENV_VAR} points at {}, which does not exist",
                candidate.display()
            ),
        });
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    // 3. Platform config dir
    if let Some(config_dir) = dirs::config_dir() {
        let candidate = config_dir.join("toolrelay").join("config.yaml");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(ToolClientError::ConfigError {
        reason: format!("could not find {CONFIG_FILE_NAME}"),
    })
}

/// Load, interpolate, parse and validate a config file.
pub fn load_config(path: &Path) -> Result<ToolClientConfig, ToolClientError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ToolClientError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_config(&raw)
}

/// Parse config text (after `${VAR}` interpolation) and validate it.
pub fn parse_config(raw: &str) -> Result<ToolClientConfig, ToolClientError> {
    let interpolated = interpolate_env_vars(raw);

    let config: ToolClientConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| ToolClientError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
