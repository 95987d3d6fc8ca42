//! Protocol session over one tool server.
//!
//! Speaks line-delimited JSON-RPC 2.0: each request is one JSON document plus
//! a trailing newline on stdin, each response one line on stdout. Many calls
//! may be in flight at once; responses are routed back by `id`. Stdout lines
//! that are not JSON, or that match no pending request, are discarded as
//! noise. Stderr is only scanned for the readiness banner and logged.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::config::ToolClientConfig;
use super::errors::ToolClientError;
use super::readiness::ReadinessStrategy;
use super::supervisor::{ProcessControl, ProcessSupervisor};
use super::types::{
    IncomingMessage, InitializeParams, JsonRpcNotification, JsonRpcRequest, SessionState,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Stderr lines retained for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Stderr context is truncated to this many bytes in error messages.
const STDERR_CONTEXT_MAX: usize = 2000;

/// Longest stdout/stderr line kept; longer lines are dropped as noise.
pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type Reply = Result<serde_json::Value, ToolClientError>;

// ─── Options ─────────────────────────────────────────────────────────────────

/// Per-session settings, usually derived from [`ToolClientConfig`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub server_name: String,
    pub startup_timeout: Duration,
    pub handshake: InitializeParams,
    pub readiness: Vec<Arc<dyn ReadinessStrategy>>,
    pub max_consecutive_timeouts: u32,
    pub max_line_bytes: usize,
}

impl SessionOptions {
    pub fn from_config(config: &ToolClientConfig) -> Self {
        Self {
            server_name: config.server.name.clone(),
            startup_timeout: config.timeouts.startup(),
            handshake: InitializeParams::default(),
            readiness: config.readiness.strategies(),
            max_consecutive_timeouts: config.max_consecutive_timeouts.max(1),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

// ─── Pending Requests ────────────────────────────────────────────────────────

/// One in-flight call awaiting its correlated response.
struct PendingRequest {
    method: String,
    issued_at: Instant,
    timeout: Option<Duration>,
    slot: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct PendingInner {
    requests: HashMap<u64, PendingRequest>,
    /// Set once the session is closed; later registrations fail with it.
    closed: Option<ToolClientError>,
}

#[derive(Default)]
struct PendingTable {
    inner: Mutex<PendingInner>,
}

impl PendingTable {
    fn lock(&self) -> MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: u64, request: PendingRequest) -> Result<(), ToolClientError> {
        let mut inner = self.lock();
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        inner.requests.insert(id, request);
        Ok(())
    }

    fn take(&self, id: u64) -> Option<PendingRequest> {
        self.lock().requests.remove(&id)
    }

    fn remove(&self, id: u64) {
        self.lock().requests.remove(&id);
    }

    /// Reject every pending request and refuse new ones.
    fn fail_all(&self, err: &ToolClientError) -> usize {
        let drained: Vec<(u64, PendingRequest)> = {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(err.clone());
            }
            inner.requests.drain().collect()
        };
        let count = drained.len();
        for (id, request) in drained {
            tracing::debug!(
                id,
                method = %request.method,
                age_ms = request.issued_at.elapsed().as_millis() as u64,
                timeout_ms = request.timeout.map(|t| t.as_millis() as u64),
                "rejecting pending request"
            );
            let _ = request.slot.send(Err(err.clone()));
        }
        count
    }

    fn len(&self) -> usize {
        self.lock().requests.len()
    }
}

/// Receiving end of one pending request.
///
/// Dropping it (timeout, caller cancellation) removes the request from the
/// pending table, so a late response is discarded as unmatched.
struct PendingReply {
    id: u64,
    rx: oneshot::Receiver<Reply>,
    shared: Arc<SessionShared>,
}

impl PendingReply {
    async fn recv(&mut self) -> Reply {
        match (&mut self.rx).await {
            Ok(reply) => reply,
            Err(_) => Err(self.shared.lost("request dropped without a response")),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.shared.pending.remove(self.id);
    }
}

// ─── Shared State ────────────────────────────────────────────────────────────

/// State shared between the session handle and its I/O tasks.
struct SessionShared {
    server: String,
    session_id: Uuid,
    state: watch::Sender<SessionState>,
    pending: PendingTable,
    banner_seen: watch::Sender<bool>,
    consecutive_timeouts: AtomicU32,
    stderr_tail: Mutex<VecDeque<String>>,
    readiness: Vec<Arc<dyn ReadinessStrategy>>,
    ready_source: OnceLock<ReadySource>,
    /// Whole frames queued for the writer task. `None` once closed.
    outbox: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl SessionShared {
    /// Queue one complete frame for stdin.
    ///
    /// Only the writer task touches stdin, so a caller that gives up after
    /// this point can never leave half a frame on the pipe.
    fn enqueue(&self, frame: String) -> Result<(), ToolClientError> {
        let outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = outbox.as_ref().ok_or_else(|| self.lost("stdin closed"))?;
        sender
            .send(frame)
            .map_err(|_| self.lost("stdin writer stopped"))
    }

    fn lost(&self, reason: &str) -> ToolClientError {
        ToolClientError::ConnectionLost {
            server: self.server.clone(),
            reason: reason.to_string(),
        }
    }

    /// The server went away: close the session and reject everything in flight.
    fn connection_lost(&self, reason: &str) {
        if let Some(rejected) = self.shut(reason) {
            tracing::warn!(
                server = %self.server,
                session = %self.session_id,
                reason,
                rejected,
                "tool server connection lost"
            );
        }
    }

    /// Move to `Closed` and fail pending requests. Returns `None` if the
    /// session was already closed, otherwise how many requests were rejected.
    fn shut(&self, reason: &str) -> Option<usize> {
        let was_open = self.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
        let rejected = self.pending.fail_all(&self.lost(reason));
        // Dropping the sender lets the writer drain and close stdin.
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner).take();
        was_open.then_some(rejected)
    }

    /// Route one stdout line to its pending request, or drop it as noise.
    fn dispatch_line(&self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }

        let message: IncomingMessage = match serde_json::from_str(trimmed) {
            Ok(message) => message,
            Err(_) => {
                tracing::debug!(server = %self.server, line = trimmed, "non-protocol stdout line");
                return;
            }
        };

        let Some(id) = message.response_id() else {
            tracing::debug!(
                server = %self.server,
                method = ?message.method,
                "ignoring server-initiated message"
            );
            return;
        };

        let Some(request) = self.pending.take(id) else {
            tracing::debug!(server = %self.server, id, "discarding unmatched response");
            return;
        };
        self.mark_alive();
        tracing::trace!(
            server = %self.server,
            id,
            method = %request.method,
            elapsed_ms = request.issued_at.elapsed().as_millis() as u64,
            "response correlated"
        );
        // The caller may have given up already.
        let _ = request.slot.send(message.into_reply());
    }

    /// A correlated response proves the server is alive.
    fn mark_alive(&self) {
        self.consecutive_timeouts.store(0, Ordering::SeqCst);
        self.state.send_if_modified(|state| {
            if *state == SessionState::Degraded {
                *state = SessionState::Ready;
                true
            } else {
                false
            }
        });
    }

    fn note_timeout(&self) -> u32 {
        let count = self.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_if_modified(|state| {
            if *state == SessionState::Ready {
                *state = SessionState::Degraded;
                true
            } else {
                false
            }
        });
        count
    }

    fn observe_stderr(&self, line: &str) {
        tracing::debug!(server = %self.server, line, "tool server stderr");

        {
            let mut tail = self.stderr_tail.lock().unwrap_or_else(PoisonError::into_inner);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
        }

        if self
            .readiness
            .iter()
            .any(|strategy| strategy.confirms_on_diagnostic(line))
        {
            self.banner_seen.send_if_modified(|seen| {
                let changed = !*seen;
                *seen = true;
                changed
            });
        }
    }

    /// Captured stderr formatted as an error-message suffix.
    fn stderr_suffix(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.is_empty() {
            return String::new();
        }
        let mut joined = tail.iter().map(String::as_str).collect::<Vec<_>>().join(" / ");
        if joined.len() > STDERR_CONTEXT_MAX {
            let mut cut = STDERR_CONTEXT_MAX;
            while !joined.is_char_boundary(cut) {
                cut -= 1;
            }
            joined.truncate(cut);
            joined.push_str("...(truncated)");
        }
        format!(" | stderr: {joined}")
    }
}

// ─── I/O Tasks ───────────────────────────────────────────────────────────────

/// Outcome of one capped line read.
#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    /// A complete line (including `\n`) is in the buffer.
    Line,
    /// A line longer than the cap was consumed and discarded.
    Oversize,
    Eof,
}

/// Read up to the next `\n`, buffering at most `max` bytes.
///
/// An oversize line is still consumed to its end so framing stays intact.
/// A partial line at EOF is dropped.
async fn read_line_capped<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<LineRead> {
    buf.clear();
    let mut oversize = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(LineRead::Eof);
        }
        let (used, done) = match available.iter().position(|b| *b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        if !oversize {
            if buf.len() + used > max {
                oversize = true;
                buf.clear();
            } else {
                buf.extend_from_slice(&available[..used]);
            }
        }
        reader.consume(used);
        if done {
            return Ok(if oversize { LineRead::Oversize } else { LineRead::Line });
        }
    }
}

async fn read_stdout(shared: Arc<SessionShared>, reader: BoxReader, max_line: usize) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        match read_line_capped(&mut reader, &mut buf, max_line).await {
            Ok(LineRead::Line) => shared.dispatch_line(&String::from_utf8_lossy(&buf)),
            Ok(LineRead::Oversize) => {
                tracing::debug!(server = %shared.server, max_line, "dropping oversize stdout line");
            }
            Ok(LineRead::Eof) => {
                shared.connection_lost("stdout closed");
                break;
            }
            Err(e) => {
                shared.connection_lost(&format!("failed to read stdout: {e}"));
                break;
            }
        }
    }
}

async fn read_stderr(shared: Arc<SessionShared>, reader: BoxReader, max_line: usize) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        match read_line_capped(&mut reader, &mut buf, max_line).await {
            Ok(LineRead::Line) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    shared.observe_stderr(line);
                }
            }
            Ok(LineRead::Oversize) => {
                tracing::debug!(server = %shared.server, max_line, "dropping oversize stderr line");
            }
            Ok(LineRead::Eof) | Err(_) => break,
        }
    }
}

/// Sole owner of stdin: writes queued frames whole, in order.
async fn write_frames(
    shared: Arc<SessionShared>,
    mut writer: BoxWriter,
    mut frames: mpsc::UnboundedReceiver<String>,
) {
    while let Some(frame) = frames.recv().await {
        let written = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            shared.connection_lost(&format!("failed to write to stdin: {e}"));
            return;
        }
    }
    // Queue closed: the session is shutting down.
    let _ = writer.shutdown().await;
}

// ─── ProtocolSession ─────────────────────────────────────────────────────────

/// How `initialize` confirmed readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadySource {
    Handshake,
    Banner,
}

/// One JSON-RPC session with one tool server.
pub struct ProtocolSession {
    shared: Arc<SessionShared>,
    next_id: AtomicU64,
    options: SessionOptions,
    process: Option<ProcessControl>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProtocolSession {
    /// Spawn the configured tool server and wrap it in an uninitialized session.
    pub fn launch(
        supervisor: &ProcessSupervisor,
        config: &ToolClientConfig,
    ) -> Result<Self, ToolClientError> {
        let handle = supervisor.start(&config.server)?;
        let stderr = handle.stderr.map(|s| Box::new(s) as BoxReader);
        let mut session = Self::from_streams(
            SessionOptions::from_config(config),
            Box::new(handle.stdin),
            Box::new(handle.stdout),
            stderr,
        );

        let mut exit = handle.control.exit_watch();
        let shared = Arc::clone(&session.shared);
        session.push_task(tokio::spawn(async move {
            let status = exit.wait().await;
            shared.connection_lost(&format!("process exited ({status})"));
        }));
        session.process = Some(handle.control);
        Ok(session)
    }

    /// Build a session over arbitrary streams (no process attached).
    pub fn from_streams(
        options: SessionOptions,
        writer: BoxWriter,
        reader: BoxReader,
        diagnostics: Option<BoxReader>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Uninitialized);
        let (banner_seen, _) = watch::channel(false);
        let (outbox, frames) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            server: options.server_name.clone(),
            session_id: Uuid::new_v4(),
            state,
            pending: PendingTable::default(),
            banner_seen,
            consecutive_timeouts: AtomicU32::new(0),
            stderr_tail: Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)),
            readiness: options.readiness.clone(),
            ready_source: OnceLock::new(),
            outbox: Mutex::new(Some(outbox)),
        });

        let max_line = options.max_line_bytes;
        let mut tasks = vec![
            tokio::spawn(write_frames(Arc::clone(&shared), writer, frames)),
            tokio::spawn(read_stdout(Arc::clone(&shared), reader, max_line)),
        ];
        if let Some(diagnostics) = diagnostics {
            tasks.push(tokio::spawn(read_stderr(Arc::clone(&shared), diagnostics, max_line)));
        }

        Self {
            shared,
            next_id: AtomicU64::new(1),
            options,
            process: None,
            tasks: Mutex::new(tasks),
        }
    }

    fn push_task(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    pub fn id(&self) -> Uuid {
        self.shared.session_id
    }

    pub fn server_name(&self) -> &str {
        &self.shared.server
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Alive process, accepting calls, and not stuck timing out.
    pub fn is_healthy(&self) -> bool {
        if self.process.as_ref().is_some_and(ProcessControl::has_exited) {
            return false;
        }
        match self.state() {
            SessionState::Ready => true,
            SessionState::Degraded => {
                self.shared.consecutive_timeouts.load(Ordering::SeqCst)
                    < self.options.max_consecutive_timeouts
            }
            _ => false,
        }
    }

    // ─── Handshake ──────────────────────────────────────────────────────

    /// Perform the `initialize` handshake and wait for readiness.
    ///
    /// Runs the handshake at most once per session. Concurrent or repeated
    /// callers wait for the first attempt's outcome.
    pub async fn initialize(&self) -> Result<ReadySource, ToolClientError> {
        let first = self.shared.state.send_if_modified(|state| {
            if *state == SessionState::Uninitialized {
                *state = SessionState::Starting;
                true
            } else {
                false
            }
        });
        if !first {
            return self.wait_until_started().await;
        }

        let startup = self.options.startup_timeout;
        let deadline = tokio::time::Instant::now() + startup;
        let params = serde_json::to_value(&self.options.handshake).map_err(|e| {
            ToolClientError::ParseError {
                reason: format!("failed to serialize initialize params: {e}"),
            }
        })?;

        tracing::debug!(server = %self.shared.server, session = %self.id(), "sending initialize");
        let outcome = tokio::time::timeout_at(deadline, self.await_readiness(params)).await;

        match outcome {
            Ok(Ok((source, pending))) => {
                let _ = self.shared.ready_source.set(source);
                self.shared.state.send_if_modified(|state| {
                    if *state == SessionState::Starting {
                        *state = SessionState::Ready;
                        true
                    } else {
                        false
                    }
                });
                if self.state() == SessionState::Closed {
                    return Err(self.startup_failure(self.shared.lost("closed during startup")));
                }
                tracing::info!(
                    server = %self.shared.server,
                    session = %self.id(),
                    source = ?source,
                    "tool server ready"
                );
                match pending {
                    None => self.send_initialized().await,
                    Some(pending) => self.finish_handshake_later(pending, deadline),
                }
                Ok(source)
            }
            Ok(Err(err)) => {
                let err = self.startup_failure(err);
                tracing::warn!(server = %self.shared.server, error = %err, "initialize failed");
                self.close().await;
                Err(err)
            }
            Err(_) => {
                let err = ToolClientError::StartupTimeout {
                    server: self.shared.server.clone(),
                    timeout_ms: startup.as_millis() as u64,
                    stderr: self.shared.stderr_suffix(),
                };
                tracing::warn!(server = %self.shared.server, error = %err, "startup timed out");
                self.close().await;
                Err(err)
            }
        }
    }

    /// Send the handshake and wait for whichever readiness signal comes first.
    ///
    /// When the banner wins, the still-pending handshake reply is returned so
    /// the `initialized` notification can follow once it arrives.
    async fn await_readiness(
        &self,
        params: serde_json::Value,
    ) -> Result<(ReadySource, Option<PendingReply>), ToolClientError> {
        let confirms_on_handshake = self
            .options
            .readiness
            .iter()
            .any(|strategy| strategy.confirms_on_handshake());

        let mut pending = self.dispatch("initialize", params, None)?;
        let mut banner = self.shared.banner_seen.subscribe();
        let mut state = self.shared.state.subscribe();
        let mut handshake_done = false;

        loop {
            tokio::select! {
                reply = pending.recv(), if !handshake_done => {
                    let result = reply?;
                    tracing::debug!(server = %self.shared.server, server_info = ?result.get("serverInfo"), "initialize answered");
                    handshake_done = true;
                    if confirms_on_handshake {
                        return Ok((ReadySource::Handshake, None));
                    }
                }
                seen = async { banner.wait_for(|seen| *seen).await.is_ok() } => {
                    if seen {
                        let rest = (!handshake_done).then_some(pending);
                        return Ok((ReadySource::Banner, rest));
                    }
                }
                closed = async { state.wait_for(|s| *s == SessionState::Closed).await.is_ok() } => {
                    if closed {
                        return Err(self.shared.lost("closed during startup"));
                    }
                }
            }
        }
    }

    /// Complete the handshake in the background after a banner-confirmed start.
    fn finish_handshake_later(&self, mut pending: PendingReply, deadline: tokio::time::Instant) {
        let shared = Arc::clone(&self.shared);
        let server = self.shared.server.clone();
        self.push_task(tokio::spawn(async move {
            match tokio::time::timeout_at(deadline, pending.recv()).await {
                Ok(Ok(_)) => {
                    let note = JsonRpcNotification::new("notifications/initialized", None);
                    if let Ok(line) = encode_line(&note) {
                        let _ = shared.enqueue(line);
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(server = %server, error = %e, "late initialize response failed");
                }
                Err(_) => {
                    tracing::debug!(server = %server, "initialize never answered; relying on banner");
                }
            }
        }));
    }

    async fn send_initialized(&self) {
        if let Err(e) = self.notify("notifications/initialized", None).await {
            tracing::warn!(server = %self.shared.server, error = %e, "failed to send initialized");
        }
    }

    async fn wait_until_started(&self) -> Result<ReadySource, ToolClientError> {
        let mut state = self.shared.state.subscribe();
        let settled = state
            .wait_for(|s| !matches!(s, SessionState::Uninitialized | SessionState::Starting))
            .await
            .map(|s| *s);
        match settled {
            Ok(s) if s.accepts_calls() => Ok(self
                .shared
                .ready_source
                .get()
                .copied()
                .unwrap_or(ReadySource::Handshake)),
            _ => Err(ToolClientError::Unavailable {
                server: self.shared.server.clone(),
                reason: "session failed to start".into(),
            }),
        }
    }

    /// Attach stderr context to connection failures seen during startup.
    fn startup_failure(&self, err: ToolClientError) -> ToolClientError {
        match err {
            ToolClientError::ConnectionLost { server, reason } => ToolClientError::Unavailable {
                server,
                reason: format!("{reason} before becoming ready{}", self.shared.stderr_suffix()),
            },
            other => other,
        }
    }

    // ─── Calls ──────────────────────────────────────────────────────────

    /// Issue one request and wait for its correlated response.
    ///
    /// A timeout removes only this request; other calls and the process are
    /// unaffected. A late response for it is discarded.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, ToolClientError> {
        match self.state() {
            SessionState::Ready | SessionState::Degraded => {}
            SessionState::Closed => return Err(self.shared.lost("session closed")),
            SessionState::Uninitialized | SessionState::Starting => {
                return Err(ToolClientError::Unavailable {
                    server: self.shared.server.clone(),
                    reason: "session is not initialized".into(),
                })
            }
        }

        let exchange = async {
            let mut pending = self.dispatch(method, params, Some(timeout))?;
            pending.recv().await
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(reply) => reply,
            Err(_) => {
                let streak = self.shared.note_timeout();
                tracing::warn!(
                    server = %self.shared.server,
                    session = %self.id(),
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    consecutive_timeouts = streak,
                    "request timed out"
                );
                Err(ToolClientError::RequestTimeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification (no id, no response).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ToolClientError> {
        let line = encode_line(&JsonRpcNotification::new(method, params))?;
        self.shared.enqueue(line)
    }

    /// Register a pending request and queue it for stdin.
    fn dispatch(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<PendingReply, ToolClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.register(
            id,
            PendingRequest {
                method: method.to_string(),
                issued_at: Instant::now(),
                timeout,
                slot: tx,
            },
        )?;
        let pending = PendingReply {
            id,
            rx,
            shared: Arc::clone(&self.shared),
        };

        let line = encode_line(&JsonRpcRequest::new(id, method, Some(params)))?;
        self.shared.enqueue(line)?;
        tracing::trace!(server = %self.shared.server, id, method, "request queued");
        Ok(pending)
    }

    // ─── Shutdown ───────────────────────────────────────────────────────

    /// Close the session: reject pending calls, close stdin, stop the process.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        if let Some(rejected) = self.shared.shut("session closed") {
            tracing::debug!(server = %self.shared.server, session = %self.id(), rejected, "closing session");
        }
        if let Some(process) = &self.process {
            process.terminate().await;
        }
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for ProtocolSession {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
        // `process` drops after this, which kills the child if still running.
    }
}

// ─── Framing ─────────────────────────────────────────────────────────────────

/// Serialize one message as a single newline-terminated line.
fn encode_line<T: serde::Serialize>(message: &T) -> Result<String, ToolClientError> {
    let mut json = serde_json::to_string(message).map_err(|e| ToolClientError::ParseError {
        reason: format!("failed to serialize request: {e}"),
    })?;
    json.push('\n');
    Ok(json)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool_client::errors::ErrorKind;
    use crate::tool_client::readiness::{BannerReadiness, ResponseReadiness};
    use tokio::io::{AsyncBufReadExt, DuplexStream};

    /// The far side of a duplex-backed session.
    struct FakeServer {
        requests: tokio::io::Lines<BufReader<DuplexStream>>,
        stdout: DuplexStream,
        stderr: DuplexStream,
    }

    impl FakeServer {
        async fn next_request(&mut self) -> serde_json::Value {
            let line = self.requests.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, line: &str) {
            self.stdout.write_all(line.as_bytes()).await.unwrap();
            self.stdout.write_all(b"\n").await.unwrap();
        }

        async fn respond(&mut self, id: &serde_json::Value, result: serde_json::Value) {
            let line = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result});
            self.send(&line.to_string()).await;
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.stdout.write_all(bytes).await.unwrap();
        }

        async fn banner(&mut self, text: &str) {
            self.stderr.write_all(text.as_bytes()).await.unwrap();
            self.stderr.write_all(b"\n").await.unwrap();
        }
    }

    fn options(readiness: Vec<Arc<dyn ReadinessStrategy>>, startup: Duration) -> SessionOptions {
        SessionOptions {
            server_name: "fake".into(),
            startup_timeout: startup,
            handshake: InitializeParams::default(),
            readiness,
            max_consecutive_timeouts: 2,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    fn both() -> Vec<Arc<dyn ReadinessStrategy>> {
        vec![Arc::new(ResponseReadiness), Arc::new(BannerReadiness::default())]
    }

    fn pair(opts: SessionOptions) -> (ProtocolSession, FakeServer) {
        pair_with_capacity(opts, 64 * 1024)
    }

    fn pair_with_capacity(opts: SessionOptions, capacity: usize) -> (ProtocolSession, FakeServer) {
        let (client_in, server_in) = tokio::io::duplex(capacity);
        let (server_out, client_out) = tokio::io::duplex(capacity);
        let (server_err, client_err) = tokio::io::duplex(capacity);
        let session = ProtocolSession::from_streams(
            opts,
            Box::new(client_in),
            Box::new(client_out),
            Some(Box::new(client_err)),
        );
        let server = FakeServer {
            requests: BufReader::new(server_in).lines(),
            stdout: server_out,
            stderr: server_err,
        };
        (session, server)
    }

    /// Session that completed the handshake via a correlated response.
    async fn ready_pair() -> (Arc<ProtocolSession>, FakeServer) {
        ready_pair_with(options(both(), Duration::from_secs(5)), 64 * 1024).await
    }

    async fn ready_pair_with(
        opts: SessionOptions,
        capacity: usize,
    ) -> (Arc<ProtocolSession>, FakeServer) {
        let (session, mut server) = pair_with_capacity(opts, capacity);
        let session = Arc::new(session);
        let init = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.initialize().await }
        });
        let req = server.next_request().await;
        assert_eq!(req["method"], "initialize");
        assert_eq!(req["params"]["protocolVersion"], crate::tool_client::types::PROTOCOL_VERSION);
        server.respond(&req["id"], serde_json::json!({"capabilities": {}})).await;
        assert_eq!(init.await.unwrap().unwrap(), ReadySource::Handshake);
        let note = server.next_request().await;
        assert_eq!(note["method"], "notifications/initialized");
        assert!(note.get("id").is_none());
        (session, server)
    }

    #[tokio::test]
    async fn test_handshake_readiness() {
        let (session, _server) = ready_pair().await;
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.is_healthy());
    }

    #[tokio::test]
    async fn test_banner_readiness_without_handshake_response() {
        let (session, mut server) = pair(options(both(), Duration::from_secs(5)));
        let session = Arc::new(session);
        let init = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.initialize().await }
        });
        let _req = server.next_request().await;
        server.banner("Paper Search MCP server running on stdio").await;
        assert_eq!(init.await.unwrap().unwrap(), ReadySource::Banner);
        assert_eq!(session.state(), SessionState::Ready);
        // Later callers report how the session actually became ready.
        assert_eq!(session.initialize().await.unwrap(), ReadySource::Banner);
    }

    #[tokio::test]
    async fn test_banner_only_strategy_ignores_handshake_response() {
        let banner_only: Vec<Arc<dyn ReadinessStrategy>> =
            vec![Arc::new(BannerReadiness::new("READY"))];
        let (session, mut server) = pair(options(banner_only, Duration::from_secs(5)));
        let session = Arc::new(session);
        let init = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.initialize().await }
        });
        let req = server.next_request().await;
        server.respond(&req["id"], serde_json::json!({})).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.state(), SessionState::Starting);
        server.banner("READY").await;
        assert_eq!(init.await.unwrap().unwrap(), ReadySource::Banner);
    }

    #[tokio::test]
    async fn test_startup_timeout_closes_session() {
        let (session, mut server) = pair(options(both(), Duration::from_millis(200)));
        server.banner("importing torch...").await;
        let err = session.initialize().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StartupTimeout);
        assert!(err.to_string().contains("importing torch"));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_handshake_happens_once() {
        let (session, mut server) = ready_pair().await;
        session.initialize().await.unwrap();
        // No second initialize request: the next frame is the call below.
        let call = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                session
                    .call("tools/list", serde_json::json!({}), Duration::from_secs(5))
                    .await
            }
        });
        let req = server.next_request().await;
        assert_eq!(req["method"], "tools/list");
        server.respond(&req["id"], serde_json::json!({"tools": []})).await;
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_responses_and_noise() {
        let (session, mut server) = ready_pair().await;

        let first = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                session
                    .call("tools/call", serde_json::json!({"n": 1}), Duration::from_secs(5))
                    .await
            }
        });
        let req1 = server.next_request().await;
        let second = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                session
                    .call("tools/call", serde_json::json!({"n": 2}), Duration::from_secs(5))
                    .await
            }
        });
        let req2 = server.next_request().await;
        assert_ne!(req1["id"], req2["id"]);

        server.send("INFO starting worker pool").await;
        server.send("{\"truncated\": ").await;
        server.send(r#"{"jsonrpc":"2.0","id":9999,"result":"nobody"}"#).await;
        server.send(r#"{"jsonrpc":"2.0","id":1,"method":"roots/list"}"#).await;
        server.respond(&req2["id"], serde_json::json!("two")).await;
        server.respond(&req1["id"], serde_json::json!("one")).await;

        assert_eq!(first.await.unwrap().unwrap(), serde_json::json!("one"));
        assert_eq!(second.await.unwrap().unwrap(), serde_json::json!("two"));
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_error_envelope_rejects_only_that_call() {
        let (session, mut server) = ready_pair().await;
        let call = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                session
                    .call("tools/call", serde_json::json!({}), Duration::from_secs(5))
                    .await
            }
        });
        let req = server.next_request().await;
        let line = serde_json::json!({
            "jsonrpc": "2.0",
            "id": req["id"],
            "error": {"code": -32602, "message": "unknown tool"}
        });
        server.send(&line.to_string()).await;
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
        assert!(session.is_healthy());
    }

    #[tokio::test]
    async fn test_timeout_isolated_from_other_requests() {
        let (session, mut server) = ready_pair().await;

        let slow = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                session
                    .call("tools/call", serde_json::json!({"slow": true}), Duration::from_millis(150))
                    .await
            }
        });
        let slow_req = server.next_request().await;
        let fast = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                session
                    .call("tools/call", serde_json::json!({}), Duration::from_secs(5))
                    .await
            }
        });
        let fast_req = server.next_request().await;

        let err = slow.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RequestTimeout);
        assert_eq!(session.state(), SessionState::Degraded);
        assert!(session.is_healthy());

        // Late answer for the timed-out request is discarded.
        server.respond(&slow_req["id"], serde_json::json!("late")).await;
        server.respond(&fast_req["id"], serde_json::json!("fast")).await;
        assert_eq!(fast.await.unwrap().unwrap(), serde_json::json!("fast"));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_repeated_timeouts_make_session_unhealthy() {
        let (session, mut server) = ready_pair().await;
        for _ in 0..2 {
            let call = tokio::spawn({
                let session = Arc::clone(&session);
                async move {
                    session
                        .call("tools/call", serde_json::json!({}), Duration::from_millis(50))
                        .await
                }
            });
            let _ = server.next_request().await;
            assert!(call.await.unwrap().is_err());
        }
        assert_eq!(session.state(), SessionState::Degraded);
        assert!(!session.is_healthy());
    }

    #[tokio::test]
    async fn test_stdout_eof_rejects_pending_with_connection_lost() {
        let (session, mut server) = ready_pair().await;
        let calls: Vec<_> = (0..3)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    session
                        .call("tools/call", serde_json::json!({}), Duration::from_secs(30))
                        .await
                })
            })
            .collect();
        for _ in 0..3 {
            let _ = server.next_request().await;
        }
        drop(server);

        for call in calls {
            let err = tokio::time::timeout(Duration::from_secs(2), call)
                .await
                .unwrap()
                .unwrap()
                .unwrap_err();
            assert!(err.to_string().contains("connection lost"));
            assert_eq!(err.kind(), ErrorKind::Unavailable);
        }
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_healthy());
    }

    #[tokio::test]
    async fn test_call_after_close_fails_fast() {
        let (session, _server) = ready_pair().await;
        session.close().await;
        session.close().await;
        let err = session
            .call("tools/list", serde_json::json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolClientError::ConnectionLost { .. }));
    }

    #[tokio::test]
    async fn test_call_before_initialize_is_rejected() {
        let (session, _server) = pair(options(both(), Duration::from_secs(1)));
        let err = session
            .call("tools/list", serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_timed_out_large_frame_does_not_corrupt_next_request() {
        let (session, mut server) =
            ready_pair_with(options(both(), Duration::from_secs(5)), 256).await;

        // The server is not reading, so this frame cannot fit the pipe in time.
        let blob = "x".repeat(4096);
        let err = session
            .call("tools/call", serde_json::json!({"blob": blob}), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RequestTimeout);

        let next = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                session
                    .call("tools/call", serde_json::json!({"n": 2}), Duration::from_secs(5))
                    .await
            }
        });
        let large = server.next_request().await;
        assert_eq!(large["params"]["blob"].as_str().map(str::len), Some(4096));
        let req = server.next_request().await;
        assert_eq!(req["params"]["n"], 2);
        server.respond(&req["id"], serde_json::json!({"ok": true})).await;
        assert_eq!(next.await.unwrap().unwrap(), serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_invalid_utf8_noise_is_discarded() {
        let (session, mut server) = ready_pair().await;
        server.send_raw(b"\xff\xfe junk\n").await;

        let call = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                session
                    .call("tools/list", serde_json::json!({}), Duration::from_secs(5))
                    .await
            }
        });
        let req = server.next_request().await;
        server.respond(&req["id"], serde_json::json!({"tools": []})).await;
        assert_eq!(call.await.unwrap().unwrap(), serde_json::json!({"tools": []}));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_oversize_line_is_dropped() {
        let mut opts = options(both(), Duration::from_secs(5));
        opts.max_line_bytes = 512;
        let (session, mut server) = ready_pair_with(opts, 64 * 1024).await;
        server.send(&"y".repeat(2000)).await;
        server.banner(&"z".repeat(2000)).await;

        let call = tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                session
                    .call("tools/list", serde_json::json!({}), Duration::from_secs(5))
                    .await
            }
        });
        let req = server.next_request().await;
        server.respond(&req["id"], serde_json::json!({"tools": []})).await;
        assert_eq!(call.await.unwrap().unwrap(), serde_json::json!({"tools": []}));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_read_line_capped_keeps_framing() {
        let input: &[u8] = b"short\nthis line is too long\nok\ntail";
        let mut reader = BufReader::with_capacity(4, input);
        let mut buf = Vec::new();
        assert_eq!(read_line_capped(&mut reader, &mut buf, 8).await.unwrap(), LineRead::Line);
        assert_eq!(buf, b"short\n");
        assert_eq!(read_line_capped(&mut reader, &mut buf, 8).await.unwrap(), LineRead::Oversize);
        assert_eq!(read_line_capped(&mut reader, &mut buf, 8).await.unwrap(), LineRead::Line);
        assert_eq!(buf, b"ok\n");
        assert_eq!(read_line_capped(&mut reader, &mut buf, 8).await.unwrap(), LineRead::Eof);
    }

    #[test]
    fn test_encode_line_is_newline_terminated() {
        let line = encode_line(&JsonRpcRequest::new(1, "tools/list", None)).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }
}
