//! Transfer log sinks.
//!
//! The relay reports every transfer and session event to one
//! [`TransferSink`]. Sinks never fail observably: write errors are reported
//! through tracing and dropped.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

/// Timestamp format used by [`FileSink`] (`16-Oct-2026 14:03:07`).
pub const TIMESTAMP_FORMAT: &str = "%d-%b-%Y %X";

/// Destination for transfer log entries.
pub trait TransferSink: Send + Sync {
    /// Record one entry.
    fn log(&self, message: &str);
}

/// Writes `[relay]: <message>` lines to stdout.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new() -> Self {
        Self
    }
}

impl TransferSink for ConsoleSink {
    fn log(&self, message: &str) {
        let mut out = io::stdout().lock();
        if let Err(e) = writeln!(out, "[relay]: {message}").and_then(|()| out.flush()) {
            warn!(error = %e, "Console sink write failed");
        }
    }
}

/// Appends `[<timestamp>]<message>` lines to a file, flushing every entry.
///
/// Writes block the calling task. Each entry is one short line, so the
/// relay loop pays a single small `write` + `flush` per transfer.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    /// Open `path` for appending, creating it if missing.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        file.write_all(line.as_bytes())?;
        file.flush()
    }
}

impl TransferSink for FileSink {
    fn log(&self, message: &str) {
        let now = chrono::Local::now().format(TIMESTAMP_FORMAT);
        let line = format!("[{now}]{message}\n");

        if let Err(e) = self.append(&line) {
            warn!(path = %self.path.display(), error = %e, "File sink write failed");
        }
    }
}
