use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use toolrelay::logging::{init_tracing, LogOptions};
use toolrelay::tool_client::config::{find_config_path, load_config, CONFIG_ENV_VAR};
use toolrelay::tool_client::{ConnectionPool, ToolInvoker};

/// Talk to a stdio tool server: list its tools or invoke one.
#[derive(Debug, Parser)]
#[command(name = "toolrelay", version, about)]
struct Cli {
    /// Config file (defaults to $TOOLRELAY_CONFIG, then ./toolrelay.yaml upward).
    #[arg(long, global = true, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Write logs to <DIR>/toolrelay.log instead of stderr.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the tools the server advertises.
    ListTools {
        /// Bypass the tool cache.
        #[arg(long)]
        refresh: bool,
    },
    /// Invoke one tool and print the result.
    Invoke {
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&LogOptions {
        log_dir: cli.log_dir.clone(),
        json: cli.json_logs,
    })?;

    let path = match cli.config {
        Some(path) => path,
        None => find_config_path(&std::env::current_dir()?)?,
    };
    let config =
        load_config(&path).with_context(|| format!("loading config from {}", path.display()))?;
    tracing::debug!(config = %path.display(), server = %config.server.name, "config loaded");

    let pool = Arc::new(ConnectionPool::new(config));
    let invoker = ToolInvoker::new(Arc::clone(&pool))?;

    let succeeded = match cli.command {
        Command::ListTools { refresh } => {
            let listed = if refresh {
                pool.refresh_tools().await
            } else {
                invoker.list_tools().await
            };
            match listed {
                Ok(tools) => {
                    let status = pool.cache_status().await;
                    let out = serde_json::json!({"tools": tools, "cache": status});
                    println!("{}", serde_json::to_string_pretty(&out)?);
                    true
                }
                Err(e) => {
                    eprintln!("error: {}", e.one_line());
                    false
                }
            }
        }
        Command::Invoke { tool, args } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            let result = invoker.invoke(&tool, arguments).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            result.success
        }
    };

    pool.close().await;
    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
