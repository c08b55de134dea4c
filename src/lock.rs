//! Cross-process exclusive lock over repository-mutating operations.
//!
//! Realized as a marker file created with a failure-on-exists primitive
//! in durable shared storage, so it is visible to every process on the
//! host and survives crashes of its holder. A marker older than the
//! staleness threshold is treated as abandoned and force-reclaimed.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tracing::{info, warn};

use crate::{AppError, Result};

const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Exclusive marker-file lock serializing repository writes host-wide.
#[derive(Debug, Clone)]
pub struct RepoMutationLock {
    path: PathBuf,
    stale_after: Duration,
    acquire_timeout: Duration,
}

impl RepoMutationLock {
    /// Build a lock over `path` with the given staleness threshold and
    /// overall acquisition bound.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration, acquire_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
            acquire_timeout,
        }
    }

    /// The marker file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, waiting until it is free or reclaimable.
    ///
    /// Loops on an atomic create-exclusive; an existing marker older
    /// than the staleness threshold is removed as abandoned. Backs off
    /// between attempts and gives up after the acquisition bound.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Lock`] on timeout or unrecoverable I/O failure.
    pub async fn acquire(&self) -> Result<MutationGuard> {
        let deadline = tokio::time::Instant::now() + self.acquire_timeout;
        loop {
            if self.reclaim_if_stale()? {
                continue;
            }
            match self.try_create_marker() {
                Ok(true) => {
                    return Ok(MutationGuard {
                        path: self.path.clone(),
                        released: false,
                    });
                }
                Ok(false) => {}
                Err(err) => return Err(err),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::Lock(format!(
                    "timed out acquiring {}",
                    self.path.display()
                )));
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
    }

    /// One non-blocking acquisition attempt.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Lock`] on unrecoverable I/O failure.
    pub fn try_acquire(&self) -> Result<Option<MutationGuard>> {
        if self.reclaim_if_stale()? {
            // Marker was stale and has been removed; fall through to create.
        }
        if self.try_create_marker()? {
            Ok(Some(MutationGuard {
                path: self.path.clone(),
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Returns true if a stale marker was removed.
    fn reclaim_if_stale(&self) -> Result<bool> {
        let Ok(meta) = fs::metadata(&self.path) else {
            return Ok(false);
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok());
        if let Some(age) = age {
            if age > self.stale_after {
                warn!(
                    path = %self.path.display(),
                    age_secs = age.as_secs(),
                    "reclaiming stale mutation lock"
                );
                match fs::remove_file(&self.path) {
                    Ok(()) => return Ok(true),
                    // Lost the race to another reclaimer.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(true),
                    Err(err) => {
                        return Err(AppError::Lock(format!(
                            "failed to remove stale lock: {err}"
                        )))
                    }
                }
            }
        }
        Ok(false)
    }

    /// Returns true when this process created the marker.
    fn try_create_marker(&self) -> Result<bool> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| AppError::Lock(format!("failed to create lock dir: {err}")))?;
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                let stamp = format!("locked_at={}\n", Utc::now().to_rfc3339());
                if let Err(err) = file.write_all(stamp.as_bytes()) {
                    warn!(%err, "failed to stamp lock marker");
                }
                info!(path = %self.path.display(), "mutation lock acquired");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(AppError::Lock(format!("failed to create lock: {err}"))),
        }
    }
}

/// RAII guard for a held mutation lock; releases on drop.
#[derive(Debug)]
pub struct MutationGuard {
    path: PathBuf,
    released: bool,
}

impl MutationGuard {
    /// Explicitly release the lock, surfacing any deletion error.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Lock`] if the marker cannot be deleted.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::Lock(format!("failed to release lock: {err}"))),
        }
    }
}

impl Drop for MutationGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(%err, path = %self.path.display(), "failed to release mutation lock on drop");
            }
        }
    }
}
