//! Ordered task queue with a running table and crash-safe persistence.
//!
//! Pending tasks are FIFO by `enqueue_seq` (crash-recovered tasks
//! re-enter at the front). Every mutating operation writes a full
//! snapshot atomically so a supervisor replacement loses no work.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::models::{RunningEntry, Task, TaskKind};
use crate::{AppError, Result};

/// Maximum delivery attempts before a crashed task is dropped for good.
pub const MAX_ATTEMPTS: u32 = 2;

/// Serialized queue state written after every mutating operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct QueueSnapshot {
    /// Pending tasks in admission order.
    pub pending: Vec<Task>,
    /// Running table keyed by task id.
    pub running: HashMap<String, RunningEntry>,
    /// Highest `enqueue_seq` handed out so far.
    #[serde(default)]
    pub seq: u64,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Task was pending and has been removed.
    RemovedPending,
    /// Task is running; cooperative cancellation was flagged only.
    SignaledRunning,
    /// No task with that id is known.
    NotFound,
}

/// Outcome of routing a crashed task back through admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requeue {
    /// Task re-admitted at the front with an incremented attempt.
    Retried(Task),
    /// Retry budget exhausted; task dropped permanently.
    Dropped(Task),
}

/// Ordered pending list + running table with snapshot persistence.
pub struct TaskQueue {
    pending: VecDeque<Task>,
    running: HashMap<String, RunningEntry>,
    seq: u64,
    snapshot_path: PathBuf,
}

impl TaskQueue {
    /// Create an empty queue persisting snapshots at `snapshot_path`.
    #[must_use]
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            pending: VecDeque::new(),
            running: HashMap::new(),
            seq: 0,
            snapshot_path: snapshot_path.into(),
        }
    }

    /// Number of pending tasks.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of running tasks.
    #[must_use]
    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    /// Iterate pending tasks in admission order.
    pub fn pending_iter(&self) -> impl Iterator<Item = &Task> {
        self.pending.iter()
    }

    /// Borrow a running entry by task id.
    #[must_use]
    pub fn running_entry(&self, task_id: &str) -> Option<&RunningEntry> {
        self.running.get(task_id)
    }

    /// Mutably borrow a running entry by task id.
    pub fn running_entry_mut(&mut self, task_id: &str) -> Option<&mut RunningEntry> {
        self.running.get_mut(task_id)
    }

    /// Running entries as (`task_id`, entry) pairs.
    pub fn running_iter(&self) -> impl Iterator<Item = (&String, &RunningEntry)> {
        self.running.iter()
    }

    /// Whether any pending or running task has the given kind.
    #[must_use]
    pub fn has_kind(&self, kind: TaskKind) -> bool {
        self.pending.iter().any(|t| t.kind == kind)
            || self.running.values().any(|e| e.task.kind == kind)
    }

    /// Admit a task, assigning the next `enqueue_seq`.
    ///
    /// `front` prepends instead of appending; used for crash re-admission
    /// so recovered work runs before newly queued work.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Queue`] if the snapshot write fails.
    pub fn enqueue(&mut self, mut task: Task, front: bool) -> Result<()> {
        self.seq += 1;
        task.enqueue_seq = self.seq;
        if front {
            self.pending.push_front(task);
        } else {
            self.pending.push_back(task);
        }
        self.persist("enqueue")
    }

    /// Pop the task at the head of the pending list.
    #[must_use]
    pub fn dequeue(&mut self) -> Option<Task> {
        self.pending.pop_front()
    }

    /// Put a dequeued-but-unassigned task back at the head (no seq change).
    pub fn push_front_unassigned(&mut self, task: Task) {
        self.pending.push_front(task);
    }

    /// Record a task as running on `worker_id`.
    ///
    /// A task id may appear in the running table at most once; a repeat
    /// insertion is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Queue`] if the task is already running or the
    /// snapshot write fails.
    pub fn mark_running(&mut self, task: Task, worker_id: u32) -> Result<()> {
        if self.running.contains_key(&task.id) {
            return Err(AppError::Queue(format!(
                "task {} is already in the running table",
                task.id
            )));
        }
        let entry = RunningEntry::assigned(task, worker_id, Utc::now());
        self.running.insert(entry.task.id.clone(), entry);
        self.persist("assign_task")
    }

    /// Clear a finished task from the running table.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Queue`] if the snapshot write fails.
    pub fn complete(&mut self, task_id: &str) -> Result<Option<RunningEntry>> {
        let removed = self.running.remove(task_id);
        self.persist("task_done")?;
        Ok(removed)
    }

    /// Remove a running entry without completing it (crash/timeout path).
    pub fn take_running(&mut self, task_id: &str) -> Option<RunningEntry> {
        self.running.remove(task_id)
    }

    /// Cancel a task by id.
    ///
    /// Pending tasks are removed outright. Running tasks only get a
    /// cooperative flag; the supervisor never force-interrupts a worker
    /// for cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Queue`] if the snapshot write fails.
    pub fn cancel(&mut self, task_id: &str) -> Result<CancelOutcome> {
        if let Some(pos) = self.pending.iter().position(|t| t.id == task_id) {
            self.pending.remove(pos);
            self.persist("cancel_task")?;
            return Ok(CancelOutcome::RemovedPending);
        }
        if let Some(entry) = self.running.get_mut(task_id) {
            entry.cancel_requested = true;
            self.persist("cancel_task")?;
            return Ok(CancelOutcome::SignaledRunning);
        }
        Ok(CancelOutcome::NotFound)
    }

    /// Drop all pending tasks of one kind (mode disable path).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Queue`] if the snapshot write fails.
    pub fn purge_pending_kind(&mut self, kind: TaskKind) -> Result<usize> {
        let before = self.pending.len();
        self.pending.retain(|t| t.kind != kind);
        let removed = before - self.pending.len();
        if removed > 0 {
            self.persist("purge_pending_kind")?;
        }
        Ok(removed)
    }

    /// Route a crashed/abandoned task back through admission.
    ///
    /// One retry is allowed: the attempt counter is bumped and the task
    /// re-enters at the pending front.
    /// A task that already consumed its retry is dropped permanently and
    /// returned so the caller can notify the operator.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Queue`] if the snapshot write fails.
    pub fn requeue_crashed(&mut self, mut task: Task) -> Result<Requeue> {
        task.attempt += 1;
        if task.attempt > MAX_ATTEMPTS {
            warn!(task_id = %task.id, attempt = task.attempt, "task dropped after retry budget");
            self.persist("task_dropped")?;
            return Ok(Requeue::Dropped(task));
        }
        self.enqueue(task.clone(), true)?;
        Ok(Requeue::Retried(task))
    }

    /// Clear the running table (pool teardown), returning abandoned count.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Queue`] if the snapshot write fails.
    pub fn clear_running(&mut self, reason: &str) -> Result<usize> {
        let cleared = self.running.len();
        self.running.clear();
        self.persist(reason)?;
        Ok(cleared)
    }

    /// Write the full queue state atomically.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Queue`] on any write or rename failure.
    pub fn persist(&self, reason: &str) -> Result<()> {
        let snapshot = QueueSnapshot {
            pending: self.pending.iter().cloned().collect(),
            running: self.running.clone(),
            seq: self.seq,
        };
        write_snapshot(&self.snapshot_path, &snapshot)?;
        tracing::trace!(reason, pending = snapshot.pending.len(), "queue snapshot persisted");
        Ok(())
    }

    /// Rebuild queue state from the snapshot left by a previous process.
    ///
    /// Pending tasks are reloaded verbatim in their original order. Every
    /// running entry is treated as abandoned and routed through the
    /// retry/drop rule at the front of pending. Returns the permanently
    /// dropped tasks so the caller can notify the operator.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Queue`] if the snapshot cannot be parsed or
    /// re-persisted.
    pub fn recover_from_snapshot(&mut self) -> Result<Vec<Task>> {
        let Some(snapshot) = read_snapshot(&self.snapshot_path)? else {
            return Ok(Vec::new());
        };

        self.seq = snapshot.seq;
        self.pending = snapshot.pending.into_iter().collect();
        self.running.clear();

        // Most-recently-started is requeued first, so each later
        // push_front lands ahead of it and earlier-started work runs
        // first.
        let mut abandoned: Vec<RunningEntry> = snapshot.running.into_values().collect();
        abandoned.sort_by_key(|e| std::cmp::Reverse(e.started_at));

        let mut dropped = Vec::new();
        for entry in abandoned {
            info!(task_id = %entry.task.id, "recovering abandoned running task");
            match self.requeue_crashed(entry.task)? {
                Requeue::Retried(_) => {}
                Requeue::Dropped(task) => dropped.push(task),
            }
        }

        self.persist("recovered_from_snapshot")?;
        Ok(dropped)
    }
}

fn write_snapshot(path: &Path, snapshot: &QueueSnapshot) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::Queue("snapshot path has no parent directory".into()))?;
    fs::create_dir_all(parent)
        .map_err(|err| AppError::Queue(format!("failed to create snapshot dir: {err}")))?;

    let serialized = serde_json::to_string(snapshot)
        .map_err(|err| AppError::Queue(format!("failed to serialize snapshot: {err}")))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| AppError::Queue(format!("failed to create temp snapshot: {err}")))?;
    tmp.write_all(serialized.as_bytes())
        .map_err(|err| AppError::Queue(format!("failed to write temp snapshot: {err}")))?;
    tmp.persist(path).map_err(|err| {
        AppError::Queue(format!(
            "failed to persist snapshot to {}: {err}",
            path.display()
        ))
    })?;
    Ok(())
}

fn read_snapshot(path: &Path) -> Result<Option<QueueSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::Queue(format!("failed to read snapshot: {err}")))?;
    let snapshot = serde_json::from_str(&raw)
        .map_err(|err| AppError::Queue(format!("failed to parse snapshot: {err}")))?;
    Ok(Some(snapshot))
}
