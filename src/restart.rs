//! Restart/upgrade protocol: verification records and in-place
//! process replacement.
//!
//! Before a restart the expected commit hash is persisted; whichever
//! process boots next claims the record via an atomic rename (only one
//! claimant can win) and compares its own checkout against the
//! expectation. Replacement loads new code into the same process
//! identity so two supervisors never race on the same inbox cursor.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::{AppError, Result};

/// File name of a pending (unclaimed) verification record.
pub const PENDING_VERIFY_FILE: &str = "pending_restart_verify.json";

/// Expectation written before a restart is initiated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RestartVerification {
    /// Commit hash the next boot is expected to run.
    pub expected_sha: String,
    /// Branch the next boot is expected to be on.
    pub expected_branch: String,
    /// Why the restart was requested.
    pub reason: String,
    /// Record creation timestamp.
    pub ts: String,
}

/// Result of claiming and checking a verification record at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    /// Whether observed and expected hashes matched.
    pub ok: bool,
    /// Hash the record expected.
    pub expected_sha: String,
    /// Hash actually checked out at boot.
    pub observed_sha: String,
    /// Reason carried from the restart request.
    pub reason: String,
}

fn pending_path(state_dir: &Path) -> PathBuf {
    state_dir.join(PENDING_VERIFY_FILE)
}

/// Write a verification record unless one is already pending.
///
/// An existing record belongs to a restart already in flight; a second
/// writer must not clobber its expectation.
///
/// # Errors
///
/// Returns [`AppError::Restart`] on serialization or write failure.
pub fn write_verification(
    state_dir: &Path,
    expected_sha: &str,
    expected_branch: &str,
    reason: &str,
) -> Result<bool> {
    let path = pending_path(state_dir);
    if path.exists() {
        return Ok(false);
    }
    fs::create_dir_all(state_dir)
        .map_err(|err| AppError::Restart(format!("failed to create state dir: {err}")))?;

    let record = RestartVerification {
        expected_sha: expected_sha.to_owned(),
        expected_branch: expected_branch.to_owned(),
        reason: reason.to_owned(),
        ts: Utc::now().to_rfc3339(),
    };
    let serialized = serde_json::to_string_pretty(&record)
        .map_err(|err| AppError::Restart(format!("failed to serialize verification: {err}")))?;

    let mut tmp = NamedTempFile::new_in(state_dir)
        .map_err(|err| AppError::Restart(format!("failed to create temp verification: {err}")))?;
    tmp.write_all(serialized.as_bytes())
        .map_err(|err| AppError::Restart(format!("failed to write verification: {err}")))?;
    tmp.persist(&path)
        .map_err(|err| AppError::Restart(format!("failed to persist verification: {err}")))?;

    info!(expected_sha, reason, "restart verification recorded");
    Ok(true)
}

/// Whether an unclaimed verification record exists.
#[must_use]
pub fn has_pending_verification(state_dir: &Path) -> bool {
    pending_path(state_dir).exists()
}

/// Atomically claim the pending verification record and compare hashes.
///
/// The record is renamed to a process-tagged name so exactly one
/// claimant wins; the claimed file is deleted after reading. Returns
/// `None` when no record is pending or another process claimed first.
pub fn claim_verification(state_dir: &Path, observed_sha: &str) -> Option<VerifyOutcome> {
    let pending = pending_path(state_dir);
    let claimed = state_dir.join(format!(
        "pending_restart_verify.claimed.{}.json",
        std::process::id()
    ));

    // Rename is the atomic claim: losers get NotFound.
    if let Err(err) = fs::rename(&pending, &claimed) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(%err, "failed to claim restart verification");
        }
        return None;
    }

    let outcome = fs::read_to_string(&claimed)
        .ok()
        .and_then(|raw| serde_json::from_str::<RestartVerification>(&raw).ok())
        .map(|record| VerifyOutcome {
            ok: !record.expected_sha.is_empty() && record.expected_sha == observed_sha,
            expected_sha: record.expected_sha,
            observed_sha: observed_sha.to_owned(),
            reason: record.reason,
        });

    if let Err(err) = fs::remove_file(&claimed) {
        warn!(%err, "failed to delete claimed verification record");
    }

    outcome
}

/// Replace the current process image in place with a fresh invocation
/// of the same executable.
///
/// Keeps the process identity (no child spawn), so the replacement
/// inherits pid and never races the old instance on shared cursors.
///
/// # Errors
///
/// Returns [`AppError::Restart`] when the exec fails or the platform
/// does not support in-place replacement.
pub fn exec_replace(args: &[String]) -> Result<()> {
    let exe = std::env::current_exe()
        .map_err(|err| AppError::Restart(format!("cannot resolve current executable: {err}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        info!(exe = %exe.display(), "replacing process image");
        // exec only returns on failure.
        let err = std::process::Command::new(exe).args(args).exec();
        Err(AppError::Restart(format!("exec failed: {err}")))
    }

    #[cfg(not(unix))]
    {
        let _ = args;
        Err(AppError::Restart(
            "in-place process replacement requires unix".into(),
        ))
    }
}
