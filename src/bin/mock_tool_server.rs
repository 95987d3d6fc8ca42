//! Scriptable stdio tool server used by the integration tests.
//!
//! Behavior is controlled through environment variables:
//! - `MOCK_TOOL_SPAWN_LOG`: append one line per process start to this file
//! - `MOCK_TOOL_SKIP_HANDSHAKE=1`: never answer `initialize`
//! - `MOCK_TOOL_BANNER`: readiness banner printed on stderr (empty disables)
//! - `MOCK_TOOL_CALL_DELAY_MS`: delay before answering `search_papers`/`echo`
//!
//! Tools: `search_papers`, `echo`, `hang` (never answers), `crash` (exits),
//! `reject` (error envelope), `fail` (`isError`), `garbled` (inner text is
//! not JSON).

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

const DEFAULT_BANNER: &str = "mock paper server running on stdio";

type Stdout = Arc<Mutex<tokio::io::Stdout>>;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    if let Ok(path) = std::env::var("MOCK_TOOL_SPAWN_LOG") {
        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(log, "spawned {}", std::process::id())?;
    }

    let skip_handshake = std::env::var("MOCK_TOOL_SKIP_HANDSHAKE").is_ok_and(|v| v == "1");
    let banner = std::env::var("MOCK_TOOL_BANNER").unwrap_or_else(|_| DEFAULT_BANNER.to_string());
    let delay = std::env::var("MOCK_TOOL_CALL_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO);

    let stdout: Stdout = Arc::new(Mutex::new(tokio::io::stdout()));
    // Non-protocol noise the client must ignore.
    write_line(&stdout, "mock tool server booting").await?;
    if !banner.is_empty() {
        eprintln!("{banner}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("ignoring unparseable input");
            continue;
        };
        let Some(id) = message.get("id").cloned() else {
            // Notification.
            continue;
        };
        let method = message["method"].as_str().unwrap_or_default().to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let stdout = Arc::clone(&stdout);

        match method.as_str() {
            "initialize" if skip_handshake => {}
            "initialize" => {
                let result = json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "mock-tool-server", "version": "0.1.0"}
                });
                reply(&stdout, &id, Ok(result)).await?;
            }
            "tools/list" => reply(&stdout, &id, Ok(json!({"tools": tool_list()}))).await?,
            "tools/call" => {
                tokio::spawn(async move {
                    if let Some(outcome) = call_tool(&params, delay).await {
                        let _ = reply(&stdout, &id, outcome).await;
                    }
                });
            }
            other => {
                let err = (-32601, format!("method not found: {other}"));
                reply(&stdout, &id, Err(err)).await?;
            }
        }
    }
    Ok(())
}

fn tool_list() -> Value {
    let any_object = json!({"type": "object"});
    json!([
        {
            "name": "search_papers",
            "description": "Search academic papers",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "max_results": {"type": "integer"}
                },
                "required": ["query"]
            }
        },
        {"name": "echo", "description": "Echo the arguments", "inputSchema": any_object},
        {"name": "hang", "description": "Never answers", "inputSchema": any_object},
        {"name": "crash", "description": "Exits the server", "inputSchema": any_object},
        {"name": "reject", "description": "Returns an error envelope", "inputSchema": any_object},
        {"name": "fail", "description": "Reports a tool failure", "inputSchema": any_object},
        {"name": "garbled", "description": "Returns a non-JSON payload", "inputSchema": any_object}
    ])
}

/// Run one tool. `None` means the request is never answered.
async fn call_tool(params: &Value, delay: Duration) -> Option<Result<Value, (i64, String)>> {
    let name = params["name"].as_str().unwrap_or_default();
    let args = &params["arguments"];

    match name {
        "search_papers" => {
            tokio::time::sleep(delay).await;
            let query = args["query"].as_str().unwrap_or_default();
            let count = args["max_results"].as_u64().unwrap_or(10).min(5);
            let papers: Vec<Value> = (1..=count)
                .map(|i| {
                    json!({
                        "id": format!("mock-{i}"),
                        "title": format!("{query} study {i}"),
                        "authors": ["A. Author", "B. Author"],
                        "abstract": format!("Abstract {i}"),
                        "year": 2020 + i,
                        "url": format!("https://papers.example.org/mock-{i}")
                    })
                })
                .collect();
            Some(Ok(text_content(&Value::Array(papers).to_string(), false)))
        }
        "echo" => {
            tokio::time::sleep(delay).await;
            Some(Ok(text_content(&args.to_string(), false)))
        }
        "hang" => None,
        "crash" => {
            eprintln!("crashing on request");
            std::process::exit(3);
        }
        "reject" => Some(Err((-32602, "rejected by mock server".to_string()))),
        "fail" => Some(Ok(text_content("quota exceeded", true))),
        "garbled" => Some(Ok(text_content("Results: {not json", false))),
        other => Some(Err((-32602, format!("unknown tool: {other}")))),
    }
}

fn text_content(text: &str, is_error: bool) -> Value {
    json!({"content": [{"type": "text", "text": text}], "isError": is_error})
}

async fn reply(stdout: &Stdout, id: &Value, outcome: Result<Value, (i64, String)>) -> std::io::Result<()> {
    let message = match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => {
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
        }
    };
    write_line(stdout, &message.to_string()).await
}

async fn write_line(stdout: &Stdout, line: &str) -> std::io::Result<()> {
    let mut out = stdout.lock().await;
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}
