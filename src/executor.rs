//! Executor contract shared by every task processor.
//!
//! Workers, the supervisor's degraded direct path, and the background
//! mind all consume tasks through this seam: take a task record, return
//! the events it produced. The language-model agent that normally sits
//! behind it is an external collaborator; the in-crate
//! [`FallbackExecutor`] only covers operation without one.

use std::time::Instant;

use async_trait::async_trait;

use crate::models::{Task, WorkerEvent};
use crate::Result;

/// Generic apology shown to end users for unresolved task failures.
pub const APOLOGY_TEXT: &str =
    "Sorry, I could not complete that request. The operator has been notified.";

/// Interface accepted by any task processor.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Process one task to completion, returning every event it emitted.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Executor`] on unrecoverable processor
    /// failure; task-level tool/model errors surface as response text
    /// inside the returned events instead.
    async fn handle(&self, task: Task) -> Result<Vec<WorkerEvent>>;
}

/// Minimal executor used when no agent backend is wired in.
///
/// Responds to chat tasks with the generic apology and completes the
/// task, so the scheduling engine stays fully exercisable without a
/// model provider.
#[derive(Debug, Default)]
pub struct FallbackExecutor {
    /// Worker slot the events are stamped with.
    pub worker_id: u32,
}

impl FallbackExecutor {
    /// Create a fallback executor stamping events with `worker_id`.
    #[must_use]
    pub fn new(worker_id: u32) -> Self {
        Self { worker_id }
    }
}

#[async_trait]
impl Executor for FallbackExecutor {
    async fn handle(&self, task: Task) -> Result<Vec<WorkerEvent>> {
        let started = Instant::now();
        let mut events = Vec::new();

        if task.chat_id != 0 {
            events.push(WorkerEvent::SendMessage {
                chat_id: task.chat_id,
                text: APOLOGY_TEXT.to_owned(),
                log_text: Some(format!("no agent backend for task {}", task.id)),
                format: None,
                is_progress: false,
            });
        }

        events.push(WorkerEvent::TaskMetrics {
            task_id: task.id.clone(),
            task_type: task.kind.as_str().to_owned(),
            duration_sec: started.elapsed().as_secs_f64(),
            tool_calls: 0,
            tool_errors: 0,
        });
        events.push(WorkerEvent::TaskDone {
            task_id: task.id,
            worker_id: self.worker_id,
        });
        Ok(events)
    }
}
