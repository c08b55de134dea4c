//! Unit tests for the git subprocess helpers, run against throwaway
//! repositories created with the system git binary.

use std::path::Path;
use std::time::Duration;

use moltd::gitops::{git, head_info, promote_to_stable};
use moltd::lock::RepoMutationLock;

/// Initialize a repository with one commit on branch `molt`.
async fn init_repo(dir: &Path) {
    git(dir, &["init", "--initial-branch", "molt"])
        .await
        .expect("git init");
    git(dir, &["config", "user.email", "moltd@localhost"])
        .await
        .expect("set email");
    git(dir, &["config", "user.name", "moltd"])
        .await
        .expect("set name");
    std::fs::write(dir.join("README.md"), "seed\n").expect("write seed file");
    git(dir, &["add", "."]).await.expect("git add");
    git(dir, &["commit", "-m", "seed"]).await.expect("commit");
}

#[tokio::test]
async fn head_info_reports_branch_and_full_sha() {
    let scratch = tempfile::tempdir().expect("tempdir");
    init_repo(scratch.path()).await;

    let head = head_info(scratch.path()).await.expect("head info");
    assert_eq!(head.branch, "molt");
    assert_eq!(head.sha.len(), 40);
    assert!(head.sha.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn git_surfaces_failures_with_stderr_detail() {
    let scratch = tempfile::tempdir().expect("tempdir");
    // Not a repository; rev-parse must fail loudly.
    let err = git(scratch.path(), &["rev-parse", "HEAD"])
        .await
        .expect_err("rev-parse outside a repo fails");
    assert!(err.to_string().contains("rev-parse"));
}

#[tokio::test]
async fn promote_fast_forwards_stable_on_the_remote() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let remote_dir = scratch.path().join("remote.git");
    let work_dir = scratch.path().join("work");
    std::fs::create_dir_all(&remote_dir).expect("create remote dir");
    std::fs::create_dir_all(&work_dir).expect("create work dir");

    git(&remote_dir, &["init", "--bare"]).await.expect("bare init");
    init_repo(&work_dir).await;
    git(
        &work_dir,
        &["remote", "add", "origin", &remote_dir.display().to_string()],
    )
    .await
    .expect("add remote");
    git(&work_dir, &["push", "origin", "molt"])
        .await
        .expect("push dev branch");

    let lock = RepoMutationLock::new(
        scratch.path().join("locks").join("git.lock"),
        Duration::from_secs(600),
        Duration::from_secs(5),
    );
    let promoted = promote_to_stable(&work_dir, &lock, "molt", "molt-stable")
        .await
        .expect("promotion succeeds");

    let dev_sha = git(&work_dir, &["rev-parse", "molt"]).await.expect("dev sha");
    assert_eq!(promoted, dev_sha);
    let stable_sha = git(&remote_dir, &["rev-parse", "molt-stable"])
        .await
        .expect("stable sha on remote");
    assert_eq!(stable_sha, dev_sha);

    // The lock must have been released after promotion.
    assert!(lock.try_acquire().expect("lock probe").is_some());
}
