//! Worker pool lifecycle: spawn, respawn, assign, shutdown.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::GlobalConfig;
use crate::models::Task;
use crate::pool::spawner::{spawn_worker, WorkerHandle};
use crate::{AppError, Result};

/// Capacity of the shared worker-event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Description of one dead worker found by a liveness sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadWorker {
    /// Slot that died.
    pub worker_id: u32,
    /// Exit code if the process exited normally.
    pub exit_code: Option<i32>,
    /// Task the worker held when it died, if any.
    pub busy_task_id: Option<String>,
}

/// Fixed-size pool of OS-isolated worker processes.
///
/// The pool owns the worker table and the spawn-grace clock. The shared
/// outbound event channel is recreated on every `spawn_all` so events
/// from a torn-down pool can never reach the new one.
pub struct WorkerPool {
    workers: HashMap<u32, WorkerHandle>,
    event_tx: Option<mpsc::Sender<String>>,
    last_spawn: Option<Instant>,
    spawn_grace: Duration,
    join_timeout: Duration,
}

impl WorkerPool {
    /// Create an empty pool (no processes yet).
    #[must_use]
    pub fn new(spawn_grace: Duration, join_timeout: Duration) -> Self {
        Self {
            workers: HashMap::new(),
            event_tx: None,
            last_spawn: None,
            spawn_grace,
            join_timeout,
        }
    }

    /// Number of worker slots currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the pool has no workers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Whether the pool is inside its spawn-grace window.
    #[must_use]
    pub fn in_spawn_grace(&self) -> bool {
        self.last_spawn
            .is_some_and(|t| t.elapsed() < self.spawn_grace)
    }

    /// A sender into the current shared event channel, if a pool is up.
    #[must_use]
    pub fn event_sender(&self) -> Option<mpsc::Sender<String>> {
        self.event_tx.clone()
    }

    /// Tear down any existing pool and spawn `n` fresh workers.
    ///
    /// Creates a brand-new shared event channel and process set so the
    /// workers load freshly-pushed code with no stale in-memory state,
    /// then starts the grace window during which liveness checks are
    /// suspended. Returns the receiver side of the new channel.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Pool`] if any worker fails to spawn.
    pub async fn spawn_all(
        &mut self,
        n: u32,
        config: &GlobalConfig,
    ) -> Result<mpsc::Receiver<String>> {
        if !self.workers.is_empty() {
            self.shutdown().await;
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.event_tx = Some(event_tx.clone());

        for slot in 0..n {
            let handle = spawn_worker(slot, config, event_tx.clone())?;
            self.workers.insert(slot, handle);
        }
        self.last_spawn = Some(Instant::now());
        info!(count = n, "worker pool spawned");
        Ok(event_rx)
    }

    /// Replace exactly one dead worker's process, leaving the rest of
    /// the pool untouched.
    ///
    /// Current behavior: resets the *global* spawn-grace window rather
    /// than a per-worker one, giving the whole pool fresh grace.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Pool`] if no pool is up or the spawn fails.
    pub fn respawn(&mut self, slot: u32, config: &GlobalConfig) -> Result<()> {
        let event_tx = self
            .event_tx
            .clone()
            .ok_or_else(|| AppError::Pool("respawn with no active pool".into()))?;
        let handle = spawn_worker(slot, config, event_tx)?;
        self.workers.insert(slot, handle);
        self.last_spawn = Some(Instant::now());
        info!(worker_id = slot, "worker respawned");
        Ok(())
    }

    /// Slot ids of workers not currently holding a task.
    #[must_use]
    pub fn idle_worker_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .workers
            .values()
            .filter(|w| w.busy_task_id.is_none())
            .map(|w| w.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of workers whose process is alive right now.
    pub fn alive_count(&mut self) -> usize {
        self.workers
            .values_mut()
            .map(WorkerHandle::is_alive)
            .filter(|alive| *alive)
            .count()
    }

    /// Sweep for dead workers, returning what was found.
    pub fn find_dead(&mut self) -> Vec<DeadWorker> {
        let mut dead = Vec::new();
        for worker in self.workers.values_mut() {
            if !worker.is_alive() {
                dead.push(DeadWorker {
                    worker_id: worker.id,
                    exit_code: worker.exit_code(),
                    busy_task_id: worker.busy_task_id.clone(),
                });
            }
        }
        dead.sort_by_key(|d| d.worker_id);
        dead
    }

    /// Send a task record down a worker's inbound channel and mark it busy.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Pool`] if the slot is unknown, already busy,
    /// or its channel is closed.
    pub async fn send_task(&mut self, slot: u32, task: &Task) -> Result<()> {
        let worker = self
            .workers
            .get_mut(&slot)
            .ok_or_else(|| AppError::Pool(format!("unknown worker {slot}")))?;
        if worker.busy_task_id.is_some() {
            return Err(AppError::Pool(format!("worker {slot} is busy")));
        }
        let line = serde_json::to_string(task)
            .map_err(|err| AppError::Pool(format!("failed to serialize task: {err}")))?;
        worker
            .input
            .send(line)
            .await
            .map_err(|_| AppError::Pool(format!("worker {slot} channel closed")))?;
        worker.busy_task_id = Some(task.id.clone());
        Ok(())
    }

    /// Clear a worker's busy flag if it matches `task_id`.
    pub fn mark_idle(&mut self, slot: u32, task_id: &str) {
        if let Some(worker) = self.workers.get_mut(&slot) {
            if worker.busy_task_id.as_deref() == Some(task_id) {
                worker.busy_task_id = None;
            }
        }
    }

    /// Forcibly kill one worker's process (hard-timeout path).
    ///
    /// The slot stays in the table; the next health sweep sees it dead
    /// and routes it through the ordinary crash handling.
    pub fn kill_worker(&mut self, slot: u32) {
        if let Some(worker) = self.workers.get_mut(&slot) {
            if let Err(err) = worker.child.start_kill() {
                warn!(worker_id = slot, %err, "failed to kill worker");
            }
        }
    }

    /// Terminate every worker with a bounded join, clearing the table.
    ///
    /// Sends the shutdown sentinel first so idle workers can exit
    /// cleanly, then kills whatever remains after the join timeout.
    pub async fn shutdown(&mut self) {
        let sentinel = json!({"type": "shutdown"}).to_string();
        for worker in self.workers.values() {
            let _ = worker.input.try_send(sentinel.clone());
        }

        for (slot, mut worker) in self.workers.drain() {
            let waited = tokio::time::timeout(self.join_timeout, worker.child.wait()).await;
            match waited {
                Ok(Ok(status)) => {
                    info!(worker_id = slot, ?status, "worker exited");
                }
                Ok(Err(err)) => {
                    warn!(worker_id = slot, %err, "worker wait failed");
                }
                Err(_) => {
                    warn!(worker_id = slot, "worker join timed out, killing");
                    let _ = worker.child.start_kill();
                    let _ = worker.child.wait().await;
                }
            }
        }
        self.event_tx = None;
        info!("worker pool shut down");
    }
}
