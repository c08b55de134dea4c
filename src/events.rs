//! Event dispatch: one NDJSON line in, exactly one handler out.
//!
//! The supervisor loop is the single consumer of worker output.
//! Malformed or unknown events are logged and discarded; a handler
//! error is caught and logged with the event type and never breaks the
//! loop. Handlers live on [`Supervisor`] because every one of them
//! mutates scheduling state.

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::gitops;
use crate::models::{Task, TaskKind, WorkerEvent};
use crate::queue::CancelOutcome;
use crate::restart;
use crate::supervisor::Supervisor;
use crate::transport::Outbound;
use crate::{AppError, Result};

/// Longest raw-line prefix kept in a bad-event log record.
const BAD_LINE_SNIPPET_CHARS: usize = 512;

/// Parse one raw worker line into an event.
///
/// # Errors
///
/// Returns [`AppError::Event`] for malformed JSON or an unknown tag.
pub fn parse_event_line(line: &str) -> Result<WorkerEvent> {
    serde_json::from_str(line).map_err(|err| AppError::Event(format!("bad event line: {err}")))
}

impl Supervisor {
    /// Parse and dispatch one raw worker line.
    ///
    /// Never fails: bad lines are logged to the supervisor log and
    /// dropped.
    pub async fn dispatch_raw(&mut self, line: &str) {
        match parse_event_line(line) {
            Ok(event) => self.dispatch_event(event).await,
            Err(err) => {
                warn!(%err, "discarding malformed worker line");
                let snippet: String = line.chars().take(BAD_LINE_SNIPPET_CHARS).collect();
                self.supervisor_log.append_lossy(&json!({
                    "type": "bad_event",
                    "error": err.to_string(),
                    "line": snippet,
                }));
            }
        }
    }

    /// Dispatch one event, containing any handler error.
    pub async fn dispatch_event(&mut self, event: WorkerEvent) {
        let tag = event.tag();
        if let Err(err) = self.handle_event(event).await {
            error!(%err, event = tag, "event handler failed");
            self.supervisor_log.append_lossy(&json!({
                "type": "event_handler_error",
                "event": tag,
                "error": err.to_string(),
            }));
        }
    }

    async fn handle_event(&mut self, event: WorkerEvent) -> Result<()> {
        match event {
            WorkerEvent::LlmUsage { usage, source } => {
                self.budget.record_usage(&usage);
                self.state.spent_usd = self.budget.spent_usd();
                self.state_store.save(&self.state)?;
                debug!(
                    cost_usd = usage.cost_usd,
                    source = source.as_deref(),
                    spent_usd = self.state.spent_usd,
                    "usage recorded"
                );
                Ok(())
            }
            WorkerEvent::TaskHeartbeat { task_id, phase } => {
                if let Some(entry) = self.queue.running_entry_mut(&task_id) {
                    entry.last_heartbeat_at = Utc::now();
                    entry.heartbeat_phase = phase;
                    // A fresh heartbeat re-arms the one-shot soft warning.
                    entry.soft_warned = false;
                } else {
                    debug!(task_id, "heartbeat for unknown task ignored");
                }
                Ok(())
            }
            WorkerEvent::SendMessage {
                chat_id,
                text,
                log_text,
                format: _,
                is_progress,
            } => {
                self.events_log.append_lossy(&json!({
                    "type": "chat_message",
                    "chat_id": chat_id,
                    "text": log_text.unwrap_or_else(|| text.clone()),
                }));
                self.messenger
                    .enqueue(Outbound::Text {
                        chat_id,
                        text,
                        is_progress,
                    })
                    .await
            }
            WorkerEvent::SendPhoto {
                chat_id,
                image_base64,
                caption,
            } => {
                self.messenger
                    .enqueue(Outbound::Photo {
                        chat_id,
                        image_base64,
                        caption,
                    })
                    .await
            }
            WorkerEvent::TaskDone { task_id, worker_id } => {
                self.queue.complete(&task_id)?;
                self.pool.mark_idle(worker_id, &task_id);
                debug!(task_id, worker_id, "task completed");
                Ok(())
            }
            WorkerEvent::TaskMetrics { .. } => {
                self.events_log.append_lossy(&event);
                Ok(())
            }
            WorkerEvent::ReviewRequest { reason } => self.on_review_request(reason),
            WorkerEvent::RestartRequest { reason } => self.on_restart_request(reason).await,
            WorkerEvent::PromoteToStable { reason } => self.on_promote(reason).await,
            WorkerEvent::ScheduleTask { description } => {
                let chat_id = self.state.owner_chat_id.unwrap_or(0);
                let task = Task::new(TaskKind::Chat, chat_id, description.clone());
                let task_id = task.id.clone();
                self.queue.enqueue(task, false)?;
                self.notify(format!("📋 scheduled task {task_id}: {description}"));
                Ok(())
            }
            WorkerEvent::CancelTask { task_id } => {
                match self.queue.cancel(&task_id)? {
                    CancelOutcome::RemovedPending => {
                        self.notify(format!("✅ task {task_id} removed from the queue"));
                    }
                    CancelOutcome::SignaledRunning => {
                        self.notify(format!(
                            "⏳ cancellation requested for running task {task_id}"
                        ));
                    }
                    CancelOutcome::NotFound => {
                        self.notify(format!("❌ no task {task_id} to cancel"));
                    }
                }
                Ok(())
            }
            WorkerEvent::ToggleEvolution { enabled } => self.on_toggle_evolution(enabled),
            WorkerEvent::ToggleConsciousness { action } => {
                self.on_toggle_consciousness(&action).await;
                Ok(())
            }
            WorkerEvent::WorkerBoot {
                worker_id,
                pid,
                git_sha,
                git_branch,
            } => {
                self.on_worker_boot(worker_id, pid, &git_sha, &git_branch);
                Ok(())
            }
        }
    }

    fn on_review_request(&mut self, reason: String) -> Result<()> {
        if self.queue.has_kind(TaskKind::Review) {
            debug!("review request deduplicated, one already in flight");
            return Ok(());
        }
        let chat_id = self.state.owner_chat_id.unwrap_or(0);
        let task = Task::new(TaskKind::Review, chat_id, reason.clone());
        self.queue.enqueue(task, false)?;
        self.notify(format!("🔍 review queued: {reason}"));
        Ok(())
    }

    async fn on_restart_request(&mut self, reason: String) -> Result<()> {
        let expected = match gitops::head_info(&self.config.repo_dir).await {
            Ok(head) => head,
            Err(err) => {
                warn!(%err, "restart requested but HEAD unreadable, using persisted revision");
                gitops::HeadInfo {
                    branch: self.state.current_branch.clone(),
                    sha: self.state.current_sha.clone(),
                }
            }
        };
        let wrote = restart::write_verification(
            &self.config.verify_dir(),
            &expected.sha,
            &expected.branch,
            &reason,
        )?;
        if !wrote {
            info!("restart verification already pending, keeping existing record");
        }
        self.supervisor_log.append_lossy(&json!({
            "type": "restart",
            "reason": reason,
            "expected_sha": expected.sha,
        }));
        self.notify(format!("🔄 restarting: {reason}"));
        self.restart_reason = Some(reason);
        Ok(())
    }

    async fn on_promote(&mut self, reason: String) -> Result<()> {
        info!(reason, "promotion to stable requested");
        let outcome = gitops::promote_to_stable(
            &self.config.repo_dir,
            &self.lock,
            &self.config.branch_dev,
            &self.config.branch_stable,
        )
        .await;
        match outcome {
            Ok(sha) => {
                self.supervisor_log.append_lossy(&json!({
                    "type": "promote_to_stable",
                    "reason": reason,
                    "sha": sha,
                }));
                self.notify(format!(
                    "✅ promoted {} → {} ({})",
                    self.config.branch_dev,
                    self.config.branch_stable,
                    sha.get(..8).unwrap_or(&sha)
                ));
            }
            Err(err) => {
                self.supervisor_log.append_lossy(&json!({
                    "type": "promote_to_stable_failed",
                    "reason": reason,
                    "error": err.to_string(),
                }));
                self.notify(format!("❌ promotion failed: {err}"));
            }
        }
        Ok(())
    }

    fn on_toggle_evolution(&mut self, enabled: bool) -> Result<()> {
        self.state.evolution_enabled = enabled;
        self.state_store.save(&self.state)?;
        if enabled {
            self.notify("🧬 evolution mode enabled".to_owned());
        } else {
            let purged = self.queue.purge_pending_kind(TaskKind::Evolution)?;
            self.notify(format!(
                "🛑 evolution mode disabled, {purged} pending cycle(s) purged"
            ));
        }
        Ok(())
    }

    async fn on_toggle_consciousness(&mut self, action: &str) {
        match action {
            "start" => {
                let text = if self.mind.start() {
                    "🧠 mind started"
                } else {
                    "🧠 mind already running"
                };
                self.notify(text.to_owned());
            }
            "stop" => {
                let text = if self.mind.stop().await {
                    "🧠 mind stopped"
                } else {
                    "🧠 mind was not running"
                };
                self.notify(text.to_owned());
            }
            "status" => {
                self.notify(self.mind.status());
            }
            other => {
                self.notify(format!(
                    "❓ unknown mind action '{other}' (expected start/stop/status)"
                ));
            }
        }
    }

    fn on_worker_boot(&mut self, worker_id: u32, pid: u32, git_sha: &str, git_branch: &str) {
        self.boot_verified = true;
        self.boot_deadline = None;
        self.events_log.append_lossy(&json!({
            "type": "worker_boot",
            "worker_id": worker_id,
            "pid": pid,
            "git_sha": git_sha,
            "git_branch": git_branch,
        }));

        let expected = &self.state.current_sha;
        let ok = expected.is_empty() || expected == git_sha;
        self.supervisor_log.append_lossy(&json!({
            "type": "worker_sha_verify",
            "worker_id": worker_id,
            "ok": ok,
            "expected_sha": expected,
            "observed_sha": git_sha,
        }));
        if ok {
            info!(worker_id, pid, git_branch, "worker boot verified");
        } else {
            warn!(worker_id, git_sha, expected, "worker booted on unexpected revision");
            self.notify(format!(
                "⚠️ worker {worker_id} booted on {} but supervisor expects {}",
                git_sha.get(..8).unwrap_or(git_sha),
                expected.get(..8).unwrap_or(expected)
            ));
        }
    }
}
