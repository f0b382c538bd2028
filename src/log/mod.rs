//! Append-only run log.
//!
//! Every narration event of a run is appended to one log file, prefixed with
//! a timestamp and severity. The text format mirrors the update scripts' own
//! logs (`2025-01-01 12:00:00.000 [INFO] message`); the JSON-lines format
//! writes one self-contained object per event for grepping and post-processing.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::{NarrationEvent, Severity};
use crate::sink::{Delivery, Sink, SinkError};

/// On-disk format of the run log.
#[derive(Debug, Default, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// A structured record in a JSON-lines log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry<'a> {
    /// RFC 3339 local timestamp.
    pub timestamp: String,
    pub severity: Severity,
    #[serde(flatten)]
    pub event: &'a NarrationEvent,
}

/// Sink writing an append-only log file.
pub struct LogFileSink {
    writer: BufWriter<File>,
    path: PathBuf,
    format: LogFormat,
}

impl LogFileSink {
    /// Open (or create) the log at `path`, creating parent directories.
    /// Appends to an existing file.
    pub fn new(path: &Path, format: LogFormat) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            format,
        })
    }

    /// Open `<dir>/<stem>-<YYYYmmdd-HHMMSS>.log`.
    pub fn timestamped(dir: &Path, stem: &str, format: LogFormat) -> Result<Self> {
        let name = format!("{stem}-{}.log", Local::now().format("%Y%m%d-%H%M%S"));
        Self::new(&dir.join(name), format)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn render(&self, event: &NarrationEvent) -> Result<String, SinkError> {
        match self.format {
            LogFormat::Text => Ok(format!(
                "{} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                event.severity(),
                event.summary()
            )),
            LogFormat::Json => {
                let entry = LogEntry {
                    timestamp: Local::now().to_rfc3339_opts(SecondsFormat::Millis, false),
                    severity: event.severity(),
                    event,
                };
                serde_json::to_string(&entry).map_err(|e| SinkError::Other(e.to_string()))
            }
        }
    }
}

impl Sink for LogFileSink {
    fn name(&self) -> &str {
        "log"
    }

    fn publish(&mut self, event: &NarrationEvent) -> Result<Delivery, SinkError> {
        let line = self.render(event)?;
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        debug!(path = %self.path.display(), "run log entry written");
        Ok(Delivery::Delivered)
    }
}
