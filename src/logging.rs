//! Tracing setup.
//!
//! Logs go to stderr, or to `toolrelay.log` in a log directory. File logs are
//! rotated on startup (`toolrelay.log` → `.1` → `.2` → `.3`) and flushed
//! after every write so nothing is lost if the process dies.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "toolrelay=info,warn";

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "toolrelay.log";

/// Rotated log files kept beside the current one.
const KEEP_ROTATED: u32 = 3;

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Write to `<dir>/toolrelay.log` instead of stderr.
    pub log_dir: Option<PathBuf>,
    /// Emit one JSON object per event.
    pub json: bool,
}

/// Install the global subscriber. Returns the log file path, if any.
pub fn init_tracing(options: &LogOptions) -> anyhow::Result<Option<PathBuf>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (writer, log_path) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(LOG_FILE_NAME);
            rotate_log_file(&path, KEEP_ROTATED);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            (BoxMakeWriter::new(FlushingWriter::new(file)), Some(path))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);

    let installed = if options.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path,
        pid = std::process::id(),
        "toolrelay starting"
    );
    Ok(log_path)
}

/// Rotate `base` → `base.1` → … → `base.{keep}`, deleting the oldest.
fn rotate_log_file(base: &Path, keep: u32) {
    let _ = std::fs::remove_file(format!("{}.{keep}", base.display()));

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base.display());
        let to = format!("{}.{}", base.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base.exists() {
        let _ = std::fs::rename(base, format!("{}.1", base.display()));
    }
}

/// File writer that flushes after every write.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = file.write(buf)?;
        file.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        file.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
