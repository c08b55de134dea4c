//! Worker process spawner.
//!
//! Spawns one OS-isolated worker per slot with `kill_on_drop(true)` and
//! a stripped environment (allowlist only), so freshly-pushed code is
//! loaded from disk and supervisor secrets never leak into workers. A
//! reader task pumps the worker's stdout NDJSON lines into the shared
//! event channel; stderr is drained into the tracing log.

use std::process::Stdio;

use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::pool::codec::EventCodec;
use crate::{AppError, Result};

/// Environment variables inherited by a spawned worker process.
///
/// Everything else is stripped via `env_clear()`; worker-specific
/// variables are injected explicitly below.
pub const ALLOWED_ENV_VARS: &[&str] = &["PATH", "HOME", "RUST_LOG", "TMPDIR", "LANG", "TERM"];

/// A live worker slot.
#[derive(Debug)]
pub struct WorkerHandle {
    /// Slot id, stable across respawns.
    pub id: u32,
    /// Child process; `kill_on_drop` keeps teardown safe.
    pub child: Child,
    /// Sender for NDJSON lines to the worker's stdin.
    pub input: mpsc::Sender<String>,
    /// Task currently held by this worker, if any.
    pub busy_task_id: Option<String>,
}

impl WorkerHandle {
    /// Whether the worker process is still alive.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit code of a dead worker, if it exited normally.
    pub fn exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        }
    }
}

/// Spawn one worker for `slot`, wiring stdout into `event_tx`.
///
/// # Errors
///
/// Returns [`AppError::Pool`] when the process cannot be spawned or its
/// stdio pipes are unavailable.
pub fn spawn_worker(
    slot: u32,
    config: &GlobalConfig,
    event_tx: mpsc::Sender<String>,
) -> Result<WorkerHandle> {
    let (program, args) = worker_invocation(config)?;

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .env_clear()
        .current_dir(&config.repo_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for key in ALLOWED_ENV_VARS {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    cmd.env("MOLTD_WORKER_ID", slot.to_string())
        .env("MOLTD_REPO_DIR", &config.repo_dir)
        .env("MOLTD_STATE_ROOT", &config.state_root)
        .env(
            "MOLTD_HEARTBEAT_SECONDS",
            config.timeouts.heartbeat_interval_seconds.to_string(),
        );

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Pool(format!("failed to spawn worker {slot}: {err}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Pool(format!("worker {slot} has no stdout pipe")))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Pool(format!("worker {slot} has no stdin pipe")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Pool(format!("worker {slot} has no stderr pipe")))?;

    info!(
        worker_id = slot,
        pid = child.id().unwrap_or(0),
        program,
        "worker process spawned"
    );

    // Outbound pump: worker stdout lines into the shared event channel.
    tokio::spawn(async move {
        let mut frames = FramedRead::new(stdout, EventCodec::new());
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(line) => {
                    if event_tx.send(line).await.is_err() {
                        // Supervisor dropped the channel; pool is being replaced.
                        break;
                    }
                }
                Err(err) => {
                    warn!(worker_id = slot, %err, "worker stdout frame error");
                }
            }
        }
        debug!(worker_id = slot, "worker stdout pump finished");
    });

    // Inbound pump: queued lines onto the worker's stdin.
    let (input_tx, mut input_rx) = mpsc::channel::<String>(32);
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        let mut stdin = stdin;
        while let Some(line) = input_rx.recv().await {
            let framed = format!("{line}\n");
            if stdin.write_all(framed.as_bytes()).await.is_err() {
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
        debug!(worker_id = slot, "worker stdin pump finished");
    });

    // Stderr drain: surface worker diagnostics in the supervisor log.
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(worker_id = slot, "worker stderr: {line}");
        }
    });

    Ok(WorkerHandle {
        id: slot,
        child,
        input: input_tx,
        busy_task_id: None,
    })
}

/// Resolve the worker command: configured override, or this executable
/// re-invoked with the `worker` subcommand.
fn worker_invocation(config: &GlobalConfig) -> Result<(String, Vec<String>)> {
    if let Some((program, rest)) = config.worker_command.split_first() {
        return Ok((program.clone(), rest.to_vec()));
    }
    let exe = std::env::current_exe()
        .map_err(|err| AppError::Pool(format!("cannot resolve current executable: {err}")))?;
    Ok((
        exe.to_string_lossy().into_owned(),
        vec!["worker".to_owned()],
    ))
}
