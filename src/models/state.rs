//! Persisted supervisor state record.
//!
//! The only mutable state besides the queue snapshot that survives an
//! in-place process replacement: identity of the current code revision,
//! the inbound-message cursor, the messaging session, and cumulative
//! spend. Written atomically on every change.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::{AppError, Result};

/// Durable supervisor state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SupervisorState {
    /// Commit hash the running code was loaded from.
    #[serde(default)]
    pub current_sha: String,
    /// Branch the checkout is on.
    #[serde(default)]
    pub current_branch: String,
    /// Operator chat; `None` until an operator binds the instance.
    #[serde(default)]
    pub owner_chat_id: Option<i64>,
    /// Messaging session identifier, rotated across restarts.
    #[serde(default)]
    pub session_id: String,
    /// Inbound-message cursor carried across process replacement.
    #[serde(default)]
    pub inbox_offset: i64,
    /// Whether autonomous evolution cycles are admitted.
    #[serde(default)]
    pub evolution_enabled: bool,
    /// Cumulative spend in USD across all sources.
    #[serde(default)]
    pub spent_usd: f64,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self {
            current_sha: String::new(),
            current_branch: String::new(),
            owner_chat_id: None,
            session_id: Uuid::new_v4().simple().to_string(),
            inbox_offset: 0,
            evolution_enabled: false,
            spent_usd: 0.0,
        }
    }
}

/// Loads and atomically persists [`SupervisorState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Create a store over the given state file path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state, or defaults when no file exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] when the file exists but cannot be read
    /// or parsed.
    pub fn load(&self) -> Result<SupervisorState> {
        if !self.path.exists() {
            return Ok(SupervisorState::default());
        }
        let raw = fs::read_to_string(&self.path).map_err(|err| {
            AppError::Io(format!(
                "failed to read state {}: {err}",
                self.path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            AppError::Io(format!(
                "failed to parse state {}: {err}",
                self.path.display()
            ))
        })
    }

    /// Persist the state atomically via temp-file rename.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] on any write or rename failure.
    pub fn save(&self, state: &SupervisorState) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| AppError::Io("state path has no parent directory".into()))?;
        fs::create_dir_all(parent)
            .map_err(|err| AppError::Io(format!("failed to create state dir: {err}")))?;

        let serialized = serde_json::to_string_pretty(state)
            .map_err(|err| AppError::Io(format!("failed to serialize state: {err}")))?;

        let mut tmp = NamedTempFile::new_in(parent)
            .map_err(|err| AppError::Io(format!("failed to create temp state file: {err}")))?;
        tmp.write_all(serialized.as_bytes())
            .map_err(|err| AppError::Io(format!("failed to write temp state file: {err}")))?;
        tmp.persist(&self.path).map_err(|err| {
            AppError::Io(format!(
                "failed to persist state to {}: {err}",
                self.path.display()
            ))
        })?;
        Ok(())
    }
}
