//! Git subprocess helpers for the self-modifying repository.

use std::path::Path;

use tokio::process::Command;
use tracing::info;

use crate::lock::RepoMutationLock;
use crate::{AppError, Result};

/// Branch and commit hash of the current checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadInfo {
    /// Current branch name (`HEAD` when detached).
    pub branch: String,
    /// Full commit hash.
    pub sha: String,
}

/// Run one git command, returning trimmed stdout.
///
/// # Errors
///
/// Returns [`AppError::Git`] when the command cannot be spawned or
/// exits non-zero.
pub async fn git(repo: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .await
        .map_err(|err| AppError::Git(format!("failed to run git {args:?}: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::Git(format!(
            "git {args:?} failed: {}",
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

/// Read the branch and commit hash of `repo`'s HEAD.
///
/// # Errors
///
/// Returns [`AppError::Git`] when either rev-parse fails.
pub async fn head_info(repo: &Path) -> Result<HeadInfo> {
    let sha = git(repo, &["rev-parse", "HEAD"]).await?;
    let branch = git(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    Ok(HeadInfo { branch, sha })
}

/// Fast-forward the stable branch pointer to the dev branch head.
///
/// Holds the mutation lock for the full fetch+push, then returns the
/// new stable commit hash.
///
/// # Errors
///
/// Returns [`AppError::Lock`] if the lock cannot be acquired and
/// [`AppError::Git`] on any git failure.
pub async fn promote_to_stable(
    repo: &Path,
    lock: &RepoMutationLock,
    branch_dev: &str,
    branch_stable: &str,
) -> Result<String> {
    let guard = lock.acquire().await?;

    let result = async {
        git(repo, &["fetch", "origin"]).await?;
        git(
            repo,
            &["push", "origin", &format!("{branch_dev}:{branch_stable}")],
        )
        .await?;
        git(repo, &["rev-parse", &format!("origin/{branch_stable}")]).await
    }
    .await;

    guard.release()?;

    let new_sha = result?;
    info!(branch_dev, branch_stable, sha = %new_sha, "stable branch promoted");
    Ok(new_sha)
}
