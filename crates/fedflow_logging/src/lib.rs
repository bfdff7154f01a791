//! Shared logging utilities for Fedflow binaries.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "fedflow_coordinator=info,fedflow_protocol=info";
const MAX_LOG_FILES: usize = 3;
const MAX_LOG_FILE_SIZE: u64 = 5 * 1024 * 1024;

/// Initialize tracing with a size-rotated file writer under the Fedflow
/// home directory plus a filtered stderr layer.
pub fn init_logging(app_name: &str, verbose: bool) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = SharedLogWriter::open(log_dir, app_name)
        .context("Failed to initialize rotating log writer")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// The Fedflow home directory: `$FEDFLOW_HOME` or `~/.fedflow`.
pub fn fedflow_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("FEDFLOW_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fedflow")
}

/// The tracing log directory: `<home>/logs`.
pub fn logs_dir() -> PathBuf {
    fedflow_home().join("logs")
}

fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Append-only log file that rotates by size, keeping a fixed number of
/// numbered predecessors (`app.log`, `app.log.1`, ...).
struct RotatingLogFile {
    dir: PathBuf,
    base: String,
    file: File,
    written: u64,
}

impl RotatingLogFile {
    fn open(dir: PathBuf, base: &str) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let base = sanitize(base);
        let (file, written) = Self::open_active(&dir, &base)?;
        let mut log = Self {
            dir,
            base,
            file,
            written,
        };
        if log.written > MAX_LOG_FILE_SIZE {
            log.rotate()?;
        }
        Ok(log)
    }

    fn open_active(dir: &std::path::Path, base: &str) -> io::Result<(File, u64)> {
        let path = dir.join(format!("{base}.log"));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let size = file.metadata()?.len();
        Ok((file, size))
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let numbered = |idx: usize| self.dir.join(format!("{}.log.{}", self.base, idx));
        let oldest = numbered(MAX_LOG_FILES - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for idx in (1..MAX_LOG_FILES - 1).rev() {
            let src = numbered(idx);
            if src.exists() {
                fs::rename(&src, numbered(idx + 1))?;
            }
        }
        let active = self.dir.join(format!("{}.log", self.base));
        if active.exists() {
            fs::rename(&active, numbered(1))?;
        }

        let (file, written) = Self::open_active(&self.dir, &self.base)?;
        self.file = file;
        self.written = written;
        Ok(())
    }
}

impl Write for RotatingLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > MAX_LOG_FILE_SIZE {
            self.rotate()?;
        }
        let bytes = self.file.write(buf)?;
        self.written += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[derive(Clone)]
struct SharedLogWriter {
    inner: Arc<Mutex<RotatingLogFile>>,
}

impl SharedLogWriter {
    fn open(dir: PathBuf, base: &str) -> Result<Self> {
        let file = RotatingLogFile::open(dir, base)
            .with_context(|| format!("Failed to open log file for {base}"))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

struct SharedLogWriterGuard {
    inner: Arc<Mutex<RotatingLogFile>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedLogWriter {
    type Writer = SharedLogWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedLogWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedLogWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.flush()
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
