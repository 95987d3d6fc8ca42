//! Tool server process supervision.
//!
//! Spawns the server as a child process with piped stdio, watches for its
//! exit, and terminates it (graceful signal, bounded wait, then kill). The
//! `Child` itself lives in a monitor task; callers hold a [`ProcessControl`].

use std::fmt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

use super::config::ServerConfig;
use super::errors::ToolClientError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// How long to wait for the process to disappear after a force kill.
const KILL_WAIT: Duration = Duration::from_secs(2);

// ─── ProcessExit ─────────────────────────────────────────────────────────────

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

// ─── ExitWatch ───────────────────────────────────────────────────────────────

/// Exit notification for one process. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<ProcessExit>>,
}

impl ExitWatch {
    /// The exit status, if the process has already exited.
    pub fn exited(&self) -> Option<ProcessExit> {
        *self.rx.borrow()
    }

    /// Wait until the process exits.
    pub async fn wait(&mut self) -> ProcessExit {
        match self.rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or_else(ProcessExit::unknown),
            // Monitor task is gone; nothing left to wait for.
            Err(_) => ProcessExit::unknown(),
        }
    }
}

// ─── ProcessHandle ───────────────────────────────────────────────────────────

/// A freshly started tool server: its three pipes plus lifecycle control.
pub struct ProcessHandle {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
    pub control: ProcessControl,
}

/// Lifecycle control for one supervised process.
///
/// Dropping the control kills the process.
pub struct ProcessControl {
    server: String,
    pid: Option<u32>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit: ExitWatch,
    terminated: AtomicBool,
    grace: Duration,
}

impl ProcessControl {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.exited().is_some()
    }

    /// Stop the process: graceful signal, wait out the grace period, then kill.
    ///
    /// Idempotent. Only the first call acts; later calls return immediately.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(exit) = self.exit.exited() {
            tracing::debug!(server = %self.server, %exit, "process already exited");
            return;
        }

        self.send_stop_signal();

        let mut exit = self.exit.clone();
        if let Ok(status) = tokio::time::timeout(self.grace, exit.wait()).await {
            tracing::info!(server = %self.server, exit = %status, "tool server stopped");
            return;
        }

        tracing::warn!(
            server = %self.server,
            grace_ms = self.grace.as_millis() as u64,
            "tool server ignored stop request, killing"
        );
        self.force_kill();
        let _ = tokio::time::timeout(KILL_WAIT, exit.wait()).await;
    }

    fn force_kill(&self) {
        let sender = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
    }

    #[cfg(unix)]
    fn send_stop_signal(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            tracing::debug!(server = %self.server, pid, error = %e, "SIGTERM failed");
        }
    }

    // Closing stdin is the only portable stop request.
    #[cfg(not(unix))]
    fn send_stop_signal(&self) {}
}

// ─── ProcessSupervisor ───────────────────────────────────────────────────────

/// Spawns tool server processes and counts how many it has started.
#[derive(Debug)]
pub struct ProcessSupervisor {
    grace: Duration,
    spawned: AtomicUsize,
}

impl ProcessSupervisor {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            spawned: AtomicUsize::new(0),
        }
    }

    /// Number of processes successfully spawned so far.
    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Spawn the tool server described by `config`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, config: &ServerConfig) -> Result<ProcessHandle, ToolClientError> {
        let name = config.name.as_str();
        let unavailable = |reason: String| ToolClientError::Unavailable {
            server: name.to_string(),
            reason,
        };

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        // Wire stdio for JSON-RPC; stderr carries diagnostics and the banner.
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                unavailable(format!("executable '{}' not found", config.command))
            } else {
                unavailable(format!("failed to spawn '{}': {e}", config.command))
            }
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| unavailable("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| unavailable("failed to capture stdout".into()))?;
        let stderr = child.stderr.take();

        let pid = child.id();
        self.spawned.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            server = name,
            command = %config.command,
            pid = ?pid,
            "spawned tool server"
        );

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let server = name.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                // Explicit kill, or the control was dropped.
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(server = %server, error = %e, "kill failed");
                    }
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => ProcessExit::from(status),
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "failed to reap tool server");
                    ProcessExit::unknown()
                }
            };
            tracing::info!(server = %server, %exit, "tool server exited");
            let _ = exit_tx.send(Some(exit));
        });

        Ok(ProcessHandle {
            stdin,
            stdout,
            stderr,
            control: ProcessControl {
                server: name.to_string(),
                pid,
                kill_tx: Mutex::new(Some(kill_tx)),
                exit: ExitWatch { rx: exit_rx },
                terminated: AtomicBool::new(false),
                grace: self.grace,
            },
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sh(script: &str) -> ServerConfig {
        ServerConfig {
            name: "test".into(),
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: HashMap::new(),
            cwd: None,
        }
    }

    #[tokio::test]
    async fn test_missing_executable_is_unavailable() {
        let supervisor = ProcessSupervisor::new(Duration::from_secs(1));
        let config = ServerConfig {
            command: "/nonexistent/tool-server".into(),
            ..sh("")
        };
        let err = supervisor.start(&config).err().unwrap();
        assert!(matches!(err, ToolClientError::Unavailable { .. }));
        assert!(err.to_string().contains("not found"));
        assert_eq!(supervisor.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_exit_notification() {
        let supervisor = ProcessSupervisor::new(Duration::from_secs(1));
        let handle = supervisor.start(&sh("exit 3")).unwrap();
        let mut exit = handle.control.exit_watch();
        let status = tokio::time::timeout(Duration::from_secs(5), exit.wait())
            .await
            .unwrap();
        assert_eq!(status.code, Some(3));
        assert!(handle.control.has_exited());
        assert_eq!(supervisor.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_terminate_is_graceful_and_idempotent() {
        let supervisor = ProcessSupervisor::new(Duration::from_secs(2));
        let handle = supervisor.start(&sh("sleep 30")).unwrap();

        handle.control.terminate().await;
        assert!(handle.control.has_exited());
        // Second call is a no-op.
        handle.control.terminate().await;
    }

    #[tokio::test]
    async fn test_terminate_force_kills_after_grace() {
        let supervisor = ProcessSupervisor::new(Duration::from_millis(200));
        let handle = supervisor
            .start(&sh("trap '' TERM; while true; do sleep 1; done"))
            .unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let start = std::time::Instant::now();
        handle.control.terminate().await;
        assert!(handle.control.has_exited());
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(handle.control.exit_watch().exited().unwrap().signal, Some(9));
    }

    #[tokio::test]
    async fn test_drop_kills_process() {
        let supervisor = ProcessSupervisor::new(Duration::from_secs(1));
        let handle = supervisor.start(&sh("sleep 30")).unwrap();
        let mut exit = handle.control.exit_watch();
        drop(handle);
        let status = tokio::time::timeout(Duration::from_secs(5), exit.wait())
            .await
            .unwrap();
        assert_eq!(status.signal, Some(9));
    }

    #[test]
    fn test_exit_display() {
        let code = ProcessExit {
            code: Some(1),
            signal: None,
        };
        let signal = ProcessExit {
            code: None,
            signal: Some(15),
        };
        assert_eq!(code.to_string(), "exit code 1");
        assert_eq!(signal.to_string(), "signal 15");
        assert_eq!(ProcessExit::unknown().to_string(), "unknown status");
    }
}
