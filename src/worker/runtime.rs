//! Worker process main loop.
//!
//! A worker is this same executable re-invoked with the `worker`
//! subcommand; its contract with the supervisor is pure stdio: NDJSON
//! task records arrive on stdin (a `{"type":"shutdown"}` sentinel
//! exits), NDJSON events leave on stdout. Identity and paths come from
//! `MOLTD_*` environment variables injected by the spawner. A
//! heartbeat ticker keeps `task_heartbeat` flowing for the whole life
//! of a task so the supervisor's staleness clocks stay honest.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::Executor;
use crate::gitops;
use crate::logs::JsonlLog;
use crate::models::{Task, WorkerEvent};
use crate::pool::codec::EventCodec;
use crate::restart;
use crate::{AppError, Result};

const DEFAULT_HEARTBEAT_SECONDS: u64 = 30;
const OUT_CHANNEL_CAPACITY: usize = 64;

/// Environment injected by the spawner, with safe defaults for manual
/// invocation.
struct WorkerEnv {
    worker_id: u32,
    repo_dir: PathBuf,
    state_root: Option<PathBuf>,
    heartbeat: Duration,
}

impl WorkerEnv {
    fn from_process_env() -> Self {
        let worker_id = env::var("MOLTD_WORKER_ID")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let repo_dir = env::var("MOLTD_REPO_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let state_root = env::var("MOLTD_STATE_ROOT").ok().map(PathBuf::from);
        let heartbeat = env::var("MOLTD_HEARTBEAT_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_HEARTBEAT_SECONDS);
        Self {
            worker_id,
            repo_dir,
            state_root,
            // tokio intervals reject a zero period.
            heartbeat: Duration::from_secs(heartbeat.max(1)),
        }
    }
}

/// Run the worker loop until the shutdown sentinel or stdin EOF.
///
/// # Errors
///
/// Returns an error when the executor fails unrecoverably; the process
/// then exits non-zero and the supervisor handles the death as a crash.
pub async fn run_worker(executor: Arc<dyn Executor>) -> Result<()> {
    let worker_env = WorkerEnv::from_process_env();
    info!(worker_id = worker_env.worker_id, "worker starting");

    let (out_tx, out_rx) = mpsc::channel::<WorkerEvent>(OUT_CHANNEL_CAPACITY);
    let writer = tokio::spawn(write_events(out_rx));

    announce_boot(&worker_env, &out_tx).await?;

    let result = task_loop(&worker_env, executor, &out_tx).await;

    drop(out_tx);
    if let Err(err) = writer.await {
        warn!(%err, "event writer task failed");
    }
    info!(worker_id = worker_env.worker_id, "worker exiting");
    result
}

/// Serialize events from the channel onto stdout, one line each.
async fn write_events(mut out_rx: mpsc::Receiver<WorkerEvent>) {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = out_rx.recv().await {
        let Ok(line) = serde_json::to_string(&event) else {
            error!(event = event.tag(), "failed to serialize outbound event");
            continue;
        };
        if stdout.write_all(line.as_bytes()).await.is_err()
            || stdout.write_all(b"\n").await.is_err()
            || stdout.flush().await.is_err()
        {
            // Supervisor closed the pipe; nowhere left to report to.
            break;
        }
    }
}

/// Emit the boot event and verify any pending restart expectation.
async fn announce_boot(worker_env: &WorkerEnv, out_tx: &mpsc::Sender<WorkerEvent>) -> Result<()> {
    let head = match gitops::head_info(&worker_env.repo_dir).await {
        Ok(head) => head,
        Err(err) => {
            warn!(%err, "worker could not resolve repo HEAD");
            gitops::HeadInfo {
                branch: String::new(),
                sha: String::new(),
            }
        }
    };

    out_tx
        .send(WorkerEvent::WorkerBoot {
            worker_id: worker_env.worker_id,
            pid: std::process::id(),
            git_sha: head.sha.clone(),
            git_branch: head.branch.clone(),
        })
        .await
        .map_err(|_| AppError::Event("boot event channel closed".into()))?;

    // Whichever process boots first after a restart claims the record.
    if let Some(state_root) = &worker_env.state_root {
        let state_dir = state_root.join("state");
        if let Some(outcome) = restart::claim_verification(&state_dir, &head.sha) {
            let log = JsonlLog::open(state_root.join("logs").join("events.jsonl"))?;
            log.append_lossy(&json!({
                "type": "restart_verify",
                "worker_id": worker_env.worker_id,
                "ok": outcome.ok,
                "expected_sha": outcome.expected_sha,
                "observed_sha": outcome.observed_sha,
                "reason": outcome.reason,
            }));
        }
    }
    Ok(())
}

/// Read NDJSON task records from stdin and run them through the
/// executor.
async fn task_loop(
    worker_env: &WorkerEnv,
    executor: Arc<dyn Executor>,
    out_tx: &mpsc::Sender<WorkerEvent>,
) -> Result<()> {
    let mut frames = FramedRead::new(tokio::io::stdin(), EventCodec::new());
    while let Some(frame) = frames.next().await {
        let line = match frame {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, "bad frame on worker stdin");
                continue;
            }
        };
        if is_shutdown_sentinel(&line) {
            info!("shutdown sentinel received");
            break;
        }
        let task: Task = match serde_json::from_str(&line) {
            Ok(task) => task,
            Err(err) => {
                warn!(%err, "discarding unparseable task record");
                continue;
            }
        };
        run_task(worker_env, &executor, out_tx, task).await?;
    }
    Ok(())
}

fn is_shutdown_sentinel(line: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from))
        .as_deref()
        == Some("shutdown")
}

/// Execute one task with a heartbeat ticker running alongside.
async fn run_task(
    worker_env: &WorkerEnv,
    executor: &Arc<dyn Executor>,
    out_tx: &mpsc::Sender<WorkerEvent>,
    task: Task,
) -> Result<()> {
    debug!(task_id = %task.id, kind = task.kind.as_str(), "task received");
    let hb_cancel = CancellationToken::new();
    let hb = tokio::spawn(heartbeat_loop(
        task.id.clone(),
        out_tx.clone(),
        worker_env.heartbeat,
        hb_cancel.clone(),
    ));

    let outcome = executor.handle(task.clone()).await;
    hb_cancel.cancel();
    if let Err(err) = hb.await {
        warn!(%err, "heartbeat task failed");
    }

    match outcome {
        Ok(events) => {
            for mut event in events {
                if let WorkerEvent::TaskDone { worker_id, .. } = &mut event {
                    *worker_id = worker_env.worker_id;
                }
                if out_tx.send(event).await.is_err() {
                    return Err(AppError::Event("event channel closed mid-task".into()));
                }
            }
            Ok(())
        }
        Err(err) => {
            error!(%err, task_id = %task.id, "executor failed");
            if let Some(state_root) = &worker_env.state_root {
                if let Ok(log) = JsonlLog::open(state_root.join("logs").join("events.jsonl")) {
                    log.append_lossy(&json!({
                        "type": "worker_crash",
                        "worker_id": worker_env.worker_id,
                        "task_id": task.id,
                        "error": err.to_string(),
                    }));
                }
            }
            // Exit non-zero; the supervisor requeues the task as a
            // busy crash.
            Err(err)
        }
    }
}

async fn heartbeat_loop(
    task_id: String,
    out_tx: mpsc::Sender<WorkerEvent>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    // The first tick of a tokio interval fires immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let beat = WorkerEvent::TaskHeartbeat {
                    task_id: task_id.clone(),
                    phase: None,
                };
                if out_tx.send(beat).await.is_err() {
                    break;
                }
            }
        }
    }
}
