//! Append-only JSONL structured logs.
//!
//! The supervisor persists two recovery-relevant log streams under
//! `<state_root>/logs/`: `supervisor.jsonl` (scheduler actions, crash
//! records, verification outcomes) and `events.jsonl` (worker boot
//! records, per-task metrics). One JSON object per line, flushed on
//! every write so records survive an in-place process replacement.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::{AppError, Result};

/// An append-only JSONL log file.
///
/// Every record is stamped with a `ts` field (ISO 8601 UTC) if the
/// serialized object does not already carry one.
pub struct JsonlLog {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<fs::File>>>,
}

impl JsonlLog {
    /// Open (create if absent) a JSONL log at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the parent directory cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::Io(format!(
                    "failed to create log directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        Ok(Self {
            path,
            writer: Mutex::new(None),
        })
    }

    /// The log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a serializable record as one JSON line, stamping `ts`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] on serialization or write failure.
    pub fn append(&self, record: &impl Serialize) -> Result<()> {
        let mut value = serde_json::to_value(record)
            .map_err(|err| AppError::Io(format!("failed to serialize log record: {err}")))?;
        if let Value::Object(ref mut map) = value {
            map.entry("ts")
                .or_insert_with(|| json!(Utc::now().to_rfc3339()));
        }

        let mut guard = self
            .writer
            .lock()
            .map_err(|_| AppError::Io("log writer mutex poisoned".to_owned()))?;

        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|err| {
                    AppError::Io(format!("failed to open log {}: {err}", self.path.display()))
                })?;
            *guard = Some(BufWriter::new(file));
        }

        if let Some(writer) = guard.as_mut() {
            let line = value.to_string();
            writeln!(writer, "{line}")
                .and_then(|()| writer.flush())
                .map_err(|err| {
                    warn!(%err, path = %self.path.display(), "log append failed");
                    AppError::Io(format!("log write failed: {err}"))
                })?;
        }

        Ok(())
    }

    /// Best-effort append: failures are logged via tracing and swallowed.
    ///
    /// Used on paths where a logging failure must never abort the
    /// operation being logged (crash handling, shutdown).
    pub fn append_lossy(&self, record: &impl Serialize) {
        if let Err(err) = self.append(record) {
            warn!(%err, "dropped jsonl log record");
        }
    }
}
