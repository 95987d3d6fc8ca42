//! Connection pool: one live session per pool, plus a TTL-cached tool list.
//!
//! The pool is an explicit service object. Share it as `Arc<ConnectionPool>`;
//! nothing here is global, so tests can run many pools side by side.
//!
//! Session initialization is a single spawned task behind a shared future.
//! Every concurrent caller awaits that same future, so a cold pool spawns
//! exactly one process no matter how many calls arrive at once. Calls on a
//! live session run fully concurrently; only the stdin write is serialized.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;

use super::config::ToolClientConfig;
use super::errors::ToolClientError;
use super::session::ProtocolSession;
use super::supervisor::ProcessSupervisor;
use super::types::{ListToolsResult, ToolDescriptor};

type InitResult = Result<Arc<ProtocolSession>, ToolClientError>;
type SharedInit = Shared<BoxFuture<'static, InitResult>>;

/// The pool's single session slot.
enum Slot {
    Empty,
    Starting { generation: u64, init: SharedInit },
    Live { generation: u64, session: Arc<ProtocolSession> },
}

// ─── Tool Cache ──────────────────────────────────────────────────────────────

/// A successful `tools/list` result and when it was fetched.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub tools: Vec<ToolDescriptor>,
    pub timestamp: DateTime<Utc>,
    fetched: Instant,
}

impl CacheEntry {
    fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self {
            tools,
            timestamp: Utc::now(),
            fetched: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.fetched.elapsed()
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

/// Snapshot of the tool cache, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub cached: bool,
    pub fresh: bool,
    pub tool_count: usize,
    pub fetched_at: Option<DateTime<Utc>>,
    pub age_secs: Option<u64>,
    pub ttl_secs: u64,
}

// ─── ConnectionPool ──────────────────────────────────────────────────────────

pub struct ConnectionPool {
    config: Arc<ToolClientConfig>,
    supervisor: Arc<ProcessSupervisor>,
    slot: Mutex<Slot>,
    generation: AtomicU64,
    /// Held across the `tools/list` round trip so concurrent misses share one.
    cache: tokio::sync::Mutex<Option<CacheEntry>>,
    list_round_trips: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(config: ToolClientConfig) -> Self {
        let supervisor = ProcessSupervisor::new(config.timeouts.shutdown_grace());
        Self {
            config: Arc::new(config),
            supervisor: Arc::new(supervisor),
            slot: Mutex::new(Slot::Empty),
            generation: AtomicU64::new(0),
            cache: tokio::sync::Mutex::new(None),
            list_round_trips: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &ToolClientConfig {
        &self.config
    }

    /// Tool server processes spawned by this pool so far.
    pub fn spawn_count(&self) -> usize {
        self.supervisor.spawn_count()
    }

    /// `tools/list` round trips actually sent to the server.
    pub fn list_round_trips(&self) -> usize {
        self.list_round_trips.load(Ordering::SeqCst)
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Sessions ───────────────────────────────────────────────────────

    /// Return the healthy live session, starting or replacing it if needed.
    pub async fn session(&self) -> Result<Arc<ProtocolSession>, ToolClientError> {
        let (generation, init) = {
            let mut slot = self.lock_slot();
            match &*slot {
                Slot::Live { session, .. } if session.is_healthy() => {
                    return Ok(Arc::clone(session));
                }
                // An init that already failed is not worth re-awaiting.
                Slot::Starting { generation, init }
                    if !matches!(init.peek(), Some(Err(_))) =>
                {
                    (*generation, init.clone())
                }
                _ => {
                    let stale = match std::mem::replace(&mut *slot, Slot::Empty) {
                        Slot::Live { session, .. } => Some(session),
                        _ => None,
                    };
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let init = self.spawn_init(generation, stale);
                    *slot = Slot::Starting {
                        generation,
                        init: init.clone(),
                    };
                    (generation, init)
                }
            }
        };

        let result = init.await;
        self.settle(generation, &result);
        result
    }

    /// Start a session in its own task, closing `stale` first so at most one
    /// tool server is ever alive per pool.
    fn spawn_init(&self, generation: u64, stale: Option<Arc<ProtocolSession>>) -> SharedInit {
        let supervisor = Arc::clone(&self.supervisor);
        let config = Arc::clone(&self.config);
        let server = config.server.name.clone();

        let task = tokio::spawn(async move {
            if let Some(stale) = stale {
                tracing::info!(
                    server = %stale.server_name(),
                    session = %stale.id(),
                    state = ?stale.state(),
                    generation,
                    "replacing unhealthy session"
                );
                stale.close().await;
            }
            let session = Arc::new(ProtocolSession::launch(&supervisor, &config)?);
            session.initialize().await?;
            tracing::info!(server = %config.server.name, session = %session.id(), generation, "session ready");
            Ok(session)
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(ToolClientError::Unavailable {
                    server,
                    reason: format!("session start task failed: {e}"),
                }),
            }
        }
        .boxed()
        .shared()
    }

    /// Publish an init outcome, unless a newer generation owns the slot.
    fn settle(&self, generation: u64, result: &InitResult) {
        let mut slot = self.lock_slot();
        let current = match &*slot {
            Slot::Starting { generation: g, .. } => *g == generation,
            _ => false,
        };
        if !current {
            return;
        }
        *slot = match result {
            Ok(session) => Slot::Live {
                generation,
                session: Arc::clone(session),
            },
            Err(_) => Slot::Empty,
        };
    }

    /// Generation of the live session, if any.
    pub fn live_generation(&self) -> Option<u64> {
        match &*self.lock_slot() {
            Slot::Live { generation, .. } => Some(*generation),
            _ => None,
        }
    }

    // ─── Tool Cache ─────────────────────────────────────────────────────

    /// Tool descriptors, from cache while within the TTL.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolClientError> {
        let ttl = self.config.tools_cache_ttl();
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.as_ref().filter(|entry| entry.is_fresh(ttl)) {
            tracing::trace!(tools = entry.tools.len(), "tool cache hit");
            return Ok(entry.tools.clone());
        }

        let entry = self.fetch_tools().await?;
        let tools = entry.tools.clone();
        *cache = Some(entry);
        Ok(tools)
    }

    /// Fetch a fresh tool list regardless of the cache and store it.
    pub async fn refresh_tools(&self) -> Result<Vec<ToolDescriptor>, ToolClientError> {
        let mut cache = self.cache.lock().await;
        let entry = self.fetch_tools().await?;
        let tools = entry.tools.clone();
        *cache = Some(entry);
        Ok(tools)
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.take();
        tracing::debug!("tool cache cleared");
    }

    pub async fn cache_status(&self) -> CacheStatus {
        let ttl = self.config.tools_cache_ttl();
        let cache = self.cache.lock().await;
        match cache.as_ref() {
            Some(entry) => CacheStatus {
                cached: true,
                fresh: entry.is_fresh(ttl),
                tool_count: entry.tools.len(),
                fetched_at: Some(entry.timestamp),
                age_secs: Some(entry.age().as_secs()),
                ttl_secs: ttl.as_secs(),
            },
            None => CacheStatus {
                cached: false,
                fresh: false,
                tool_count: 0,
                fetched_at: None,
                age_secs: None,
                ttl_secs: ttl.as_secs(),
            },
        }
    }

    async fn fetch_tools(&self) -> Result<CacheEntry, ToolClientError> {
        let session = self.session().await?;
        let started = Instant::now();
        self.list_round_trips.fetch_add(1, Ordering::SeqCst);
        let raw = session
            .call(
                "tools/list",
                serde_json::json!({}),
                self.config.timeouts.list_tools(),
            )
            .await?;
        let listed: ListToolsResult =
            serde_json::from_value(raw).map_err(|e| ToolClientError::ParseError {
                reason: format!("malformed tools/list result: {e}"),
            })?;
        tracing::info!(
            server = %self.config.server.name,
            tools = listed.tools.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tool list refreshed"
        );
        Ok(CacheEntry::new(listed.tools))
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Start the session and fill the tool cache ahead of the first call.
    pub async fn warm_up(&self) -> Result<usize, ToolClientError> {
        self.list_tools().await.map(|tools| tools.len())
    }

    /// Shut down the live (or starting) session and drop the cache.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.lock_slot(), Slot::Empty);
        // Invalidate any init still in flight.
        self.generation.fetch_add(1, Ordering::SeqCst);

        match previous {
            Slot::Live { session, .. } => session.close().await,
            Slot::Starting { init, .. } => {
                if let Ok(session) = init.await {
                    session.close().await;
                }
            }
            Slot::Empty => {}
        }
        self.cache.lock().await.take();
        tracing::debug!(server = %self.config.server.name, "pool closed");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
