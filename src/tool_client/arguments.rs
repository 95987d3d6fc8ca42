//! Typed tool arguments.
//!
//! Arguments arrive as untyped JSON. Tools known in advance get a validated
//! variant; everything else passes through as an opaque JSON object. Either
//! way, validation happens before a byte reaches the wire.

use serde::{Deserialize, Serialize};

use super::errors::ToolClientError;

/// Name of the academic paper search tool.
pub const SEARCH_PAPERS: &str = "search_papers";

/// Default and upper bound for `max_results`.
const DEFAULT_MAX_RESULTS: u32 = 10;
const MAX_RESULTS_LIMIT: u32 = 100;

fn default_max_results() -> u32 {
    DEFAULT_MAX_RESULTS
}

/// Arguments for `search_papers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPapersArgs {
    pub query: String,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
}

/// Validated arguments for one tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArguments {
    SearchPapers(SearchPapersArgs),
    Opaque {
        tool: String,
        arguments: serde_json::Map<String, serde_json::Value>,
    },
}

impl ToolArguments {
    /// Validate raw arguments for `tool_name`.
    pub fn parse(tool_name: &str, arguments: serde_json::Value) -> Result<Self, ToolClientError> {
        let invalid = |reason: String| ToolClientError::InvalidArguments {
            tool: tool_name.to_string(),
            reason,
        };

        if tool_name.trim().is_empty() {
            return Err(invalid("tool name is empty".into()));
        }

        match tool_name {
            SEARCH_PAPERS => {
                let args: SearchPapersArgs =
                    serde_json::from_value(arguments).map_err(|e| invalid(e.to_string()))?;
                if args.query.trim().is_empty() {
                    return Err(invalid("query is empty".into()));
                }
                if !(1..=MAX_RESULTS_LIMIT).contains(&args.max_results) {
                    return Err(invalid(format!(
                        "max_results must be between 1 and {MAX_RESULTS_LIMIT}, got {}",
                        args.max_results
                    )));
                }
                Ok(ToolArguments::SearchPapers(args))
            }
            _ => match arguments {
                serde_json::Value::Null => Ok(ToolArguments::Opaque {
                    tool: tool_name.to_string(),
                    arguments: serde_json::Map::new(),
                }),
                serde_json::Value::Object(map) => Ok(ToolArguments::Opaque {
                    tool: tool_name.to_string(),
                    arguments: map,
                }),
                other => Err(invalid(format!(
                    "arguments must be a JSON object, got {}",
                    json_type_name(&other)
                ))),
            },
        }
    }

    /// The tool these arguments belong to.
    pub fn tool_name(&self) -> &str {
        match self {
            ToolArguments::SearchPapers(_) => SEARCH_PAPERS,
            ToolArguments::Opaque { tool, .. } => tool,
        }
    }

    /// The `arguments` value written into `tools/call`.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            ToolArguments::SearchPapers(args) => serde_json::json!({
                "query": args.query,
                "max_results": args.max_results,
            }),
            ToolArguments::Opaque { arguments, .. } => {
                serde_json::Value::Object(arguments.clone())
            }
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
