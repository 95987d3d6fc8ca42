//! Direct-network substitutes for tools whose protocol path is unavailable.
//!
//! A fallback only runs after a channel failure (unavailable, startup or
//! request timeout). It produces a `ToolResult` shaped exactly like the
//! protocol path, marked `served_by: "fallback"`, and never returns an error
//! past this boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::arguments::{ToolArguments, SEARCH_PAPERS};
use super::config::{FallbackConfig, ToolClientConfig};
use super::errors::ToolClientError;
use super::types::{ServedBy, ToolResult};

/// Fields requested from the paper search endpoint.
const PAPER_FIELDS: &str = "title,abstract,year,authors,url";

// ─── Paper Records ───────────────────────────────────────────────────────────

/// One paper, as returned by `search_papers` on either path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(rename = "abstract", default)]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Semantic Scholar `/graph/v1/paper/search` response.
#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<ApiPaper>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiPaper {
    paper_id: Option<String>,
    title: Option<String>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    year: Option<i32>,
    #[serde(default)]
    authors: Vec<ApiAuthor>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiAuthor {
    name: Option<String>,
}

impl ApiPaper {
    fn into_record(self) -> Option<PaperRecord> {
        Some(PaperRecord {
            id: self.paper_id?,
            title: self.title.unwrap_or_default(),
            authors: self.authors.into_iter().filter_map(|a| a.name).collect(),
            abstract_text: self.abstract_text,
            year: self.year,
            url: self.url,
        })
    }
}

// ─── Providers ───────────────────────────────────────────────────────────────

/// Performs one tool's operation without the tool server.
#[async_trait]
pub trait FallbackProvider: Send + Sync {
    /// Short name for logs and error messages.
    fn name(&self) -> &'static str;

    /// Upper bound for one `execute` call.
    fn timeout(&self) -> Duration;

    async fn execute(&self, arguments: &ToolArguments) -> Result<serde_json::Value, ToolClientError>;
}

/// `search_papers` through the Semantic Scholar Graph API.
pub struct PaperSearchFallback {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl PaperSearchFallback {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ToolClientError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ToolClientError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self::with_client(client, base_url, api_key, timeout))
    }

    /// Use a caller-supplied HTTP client.
    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            timeout,
        }
    }

    async fn search(&self, query: &str, limit: u32) -> Result<Vec<PaperRecord>, ToolClientError> {
        let unavailable = |reason: String| ToolClientError::Unavailable {
            server: self.name().to_string(),
            reason,
        };

        let url = format!("{}/graph/v1/paper/search", self.base_url);
        let limit_param = limit.to_string();
        let mut request = self.client.get(&url).query(&[
            ("query", query),
            ("limit", limit_param.as_str()),
            ("fields", PAPER_FIELDS),
        ]);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| unavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(unavailable(format!("HTTP {status}: {snippet}")));
        }

        let parsed: SearchResponse =
            response
                .json()
                .await
                .map_err(|e| ToolClientError::ParseError {
                    reason: format!("malformed paper search response: {e}"),
                })?;

        Ok(parsed
            .data
            .into_iter()
            .filter_map(ApiPaper::into_record)
            .take(limit as usize)
            .collect())
    }
}

#[async_trait]
impl FallbackProvider for PaperSearchFallback {
    fn name(&self) -> &'static str {
        "semantic_scholar"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self, arguments: &ToolArguments) -> Result<serde_json::Value, ToolClientError> {
        let ToolArguments::SearchPapers(args) = arguments else {
            return Err(ToolClientError::ToolError {
                tool: arguments.tool_name().to_string(),
                message: format!("{} only serves '{SEARCH_PAPERS}'", self.name()),
            });
        };
        let records = self.search(&args.query, args.max_results).await?;
        tracing::debug!(provider = self.name(), records = records.len(), "paper search answered");
        serde_json::to_value(records).map_err(|e| ToolClientError::ParseError {
            reason: format!("failed to encode paper records: {e}"),
        })
    }
}

// ─── FallbackClient ──────────────────────────────────────────────────────────

/// Fallback providers keyed by tool name.
#[derive(Clone, Default)]
pub struct FallbackClient {
    providers: HashMap<String, Arc<dyn FallbackProvider>>,
}

impl FallbackClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the providers declared in `config.fallbacks`.
    pub fn from_config(config: &ToolClientConfig) -> Result<Self, ToolClientError> {
        let mut client = Self::new();
        for (tool, fallback) in &config.fallbacks {
            let provider: Arc<dyn FallbackProvider> = match fallback {
                FallbackConfig::SemanticScholar {
                    base_url,
                    timeout_ms,
                    api_key,
                } => Arc::new(PaperSearchFallback::new(
                    base_url,
                    api_key.clone(),
                    Duration::from_millis(*timeout_ms),
                )?),
            };
            client = client.with_provider(tool, provider);
        }
        Ok(client)
    }

    pub fn with_provider(mut self, tool: &str, provider: Arc<dyn FallbackProvider>) -> Self {
        self.providers.insert(tool.to_string(), provider);
        self
    }

    pub fn has_fallback(&self, tool: &str) -> bool {
        self.providers.contains_key(tool)
    }

    /// Serve `arguments` through the tool's fallback after `primary` failed.
    ///
    /// `started` is when the original invocation began, so the reported
    /// execution time covers both paths.
    pub async fn run(
        &self,
        arguments: &ToolArguments,
        primary: &ToolClientError,
        started: Instant,
    ) -> ToolResult {
        let tool = arguments.tool_name();
        let elapsed = || started.elapsed().as_millis() as u64;
        let exhausted = |reason: String| ToolClientError::FallbackExhausted {
            tool: tool.to_string(),
            primary: primary.one_line(),
            reason,
        };

        let Some(provider) = self.providers.get(tool) else {
            let err = exhausted("no fallback declared".into());
            return ToolResult::failure(tool, &err, elapsed(), ServedBy::Fallback);
        };

        let timeout = provider.timeout();
        let outcome = tokio::time::timeout(timeout, provider.execute(arguments)).await;

        match outcome {
            Ok(Ok(data)) => {
                tracing::info!(tool, provider = provider.name(), elapsed_ms = elapsed(), "served by fallback");
                ToolResult::success(tool, data, elapsed(), ServedBy::Fallback)
            }
            Ok(Err(e)) => {
                let err = exhausted(e.one_line());
                tracing::warn!(tool, provider = provider.name(), error = %err, "fallback failed");
                ToolResult::failure(tool, &err, elapsed(), ServedBy::Fallback)
            }
            Err(_) => {
                let err = exhausted(format!(
                    "{} timed out after {}ms",
                    provider.name(),
                    timeout.as_millis()
                ));
                tracing::warn!(tool, provider = provider.name(), error = %err, "fallback failed");
                ToolResult::failure(tool, &err, elapsed(), ServedBy::Fallback)
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool_client::errors::ErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Serve one canned HTTP response and report the request head.
    async fn canned_http(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        (format!("http://{addr}"), rx)
    }

    fn provider(base_url: &str, api_key: Option<&str>, timeout: Duration) -> PaperSearchFallback {
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        PaperSearchFallback::with_client(client, base_url, api_key.map(String::from), timeout)
    }

    fn search(query: &str, max_results: u32) -> ToolArguments {
        ToolArguments::parse(
            SEARCH_PAPERS,
            serde_json::json!({"query": query, "max_results": max_results}),
        )
        .unwrap()
    }

    fn primary_failure() -> ToolClientError {
        ToolClientError::Unavailable {
            server: "papers".into(),
            reason: "executable 'paper-server' not found".into(),
        }
    }

    const THREE_PAPERS: &str = r#"{"total": 3, "data": [
        {"paperId": "a1", "title": "Attention Is All You Need", "year": 2017,
         "authors": [{"authorId": "1", "name": "Ashish Vaswani"}], "abstract": "Transformers.",
         "url": "https://www.semanticscholar.org/paper/a1"},
        {"paperId": "b2", "title": "BERT", "year": 2019, "authors": [], "abstract": null},
        {"paperId": null, "title": "no id, skipped"},
        {"paperId": "c3", "title": "GPT-3"}
    ]}"#;

    #[tokio::test]
    async fn test_paper_search_maps_records() {
        let (url, head) = canned_http("200 OK", THREE_PAPERS).await;
        let p = provider(&url, Some("secret"), Duration::from_secs(5));

        let data = p.execute(&search("transformer models", 3)).await.unwrap();
        let records: Vec<PaperRecord> = serde_json::from_value(data).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].id, "a1");
        assert_eq!(records[0].authors, vec!["Ashish Vaswani".to_string()]);
        assert_eq!(records[0].year, Some(2017));
        assert_eq!(records[2].title, "GPT-3");

        let head = head.await.unwrap().to_lowercase();
        assert!(head.starts_with("get /graph/v1/paper/search?"));
        assert!(head.contains("query=transformer+models"));
        assert!(head.contains("limit=3"));
        assert!(head.contains("x-api-key: secret"));
    }

    #[test]
    fn test_record_shape_uses_abstract_key() {
        let record = PaperRecord {
            id: "a1".into(),
            title: "T".into(),
            authors: vec![],
            abstract_text: Some("x".into()),
            year: None,
            url: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["abstract"], "x");
        assert!(json.get("abstract_text").is_none());
    }

    #[tokio::test]
    async fn test_run_success_is_marked_fallback() {
        let (url, _head) = canned_http("200 OK", THREE_PAPERS).await;
        let client = FallbackClient::new().with_provider(
            SEARCH_PAPERS,
            Arc::new(provider(&url, None, Duration::from_secs(5))),
        );
        assert!(client.has_fallback(SEARCH_PAPERS));

        let result = client
            .run(&search("transformers", 10), &primary_failure(), Instant::now())
            .await;
        assert!(result.success);
        assert_eq!(result.served_by, ServedBy::Fallback);
        assert_eq!(result.data.unwrap().as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_run_http_error_is_exhausted() {
        let (url, _head) = canned_http("429 Too Many Requests", r#"{"message":"slow down"}"#).await;
        let client = FallbackClient::new().with_provider(
            SEARCH_PAPERS,
            Arc::new(provider(&url, None, Duration::from_secs(5))),
        );
        let result = client
            .run(&search("transformers", 10), &primary_failure(), Instant::now())
            .await;
        assert!(!result.success);
        assert_eq!(result.served_by, ServedBy::Fallback);
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::FallbackExhausted);
        assert!(error.message.contains("not found"));
        assert!(error.message.contains("429"));
    }

    #[tokio::test]
    async fn test_run_times_out() {
        // Accepts the connection but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let client = FallbackClient::new().with_provider(
            SEARCH_PAPERS,
            Arc::new(provider(&url, None, Duration::from_millis(200))),
        );
        let started = Instant::now();
        let result = client
            .run(&search("transformers", 10), &primary_failure(), started)
            .await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.error.unwrap().kind, ErrorKind::FallbackExhausted);
    }

    #[tokio::test]
    async fn test_run_without_provider() {
        let result = FallbackClient::new()
            .run(&search("x", 1), &primary_failure(), Instant::now())
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().message.contains("no fallback declared"));
    }

    #[tokio::test]
    async fn test_wrong_tool_is_rejected() {
        let p = provider("http://127.0.0.1:9", None, Duration::from_secs(1));
        let args = ToolArguments::parse("echo", serde_json::json!({})).unwrap();
        let err = p.execute(&args).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolError);
    }

    #[test]
    fn test_from_config_builds_declared_providers() {
        let mut config = ToolClientConfig::for_command("papers", "paper-server", &[]);
        config.fallbacks.insert(
            SEARCH_PAPERS.to_string(),
            FallbackConfig::SemanticScholar {
                base_url: "https://api.example.org".into(),
                timeout_ms: 1000,
                api_key: None,
            },
        );
        let client = FallbackClient::from_config(&config).unwrap();
        assert!(client.has_fallback(SEARCH_PAPERS));
        assert!(!client.has_fallback("echo"));
    }
}
