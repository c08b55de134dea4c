//! Worker-emitted event vocabulary.
//!
//! Events travel as NDJSON lines from worker stdout (or the supervisor's
//! own direct-execution fallback) into the single supervisor consumer.
//! The `type` tag selects exactly one handler; anything unrecognized is
//! logged and discarded by the router, never raised.

use serde::{Deserialize, Serialize};

/// Token/cost usage reported by one model exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct UsageReport {
    /// Prompt tokens consumed.
    #[serde(default)]
    pub prompt_tokens: u64,
    /// Completion tokens produced.
    #[serde(default)]
    pub completion_tokens: u64,
    /// Tokens served from provider cache.
    #[serde(default)]
    pub cached_tokens: u64,
    /// Cost in USD as reported by the provider.
    #[serde(default)]
    pub cost_usd: f64,
}

/// Fixed vocabulary of events consumed by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Model usage to accumulate into the budget.
    LlmUsage {
        /// Usage totals for one exchange.
        usage: UsageReport,
        /// Originating subsystem (worker task, mind loop, code delegate).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    /// Liveness signal for a running task.
    TaskHeartbeat {
        /// Task being worked on.
        task_id: String,
        /// Current execution phase, free-form.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<String>,
    },
    /// Outbound message for the operator/chat transport.
    SendMessage {
        /// Destination chat.
        chat_id: i64,
        /// Message body.
        text: String,
        /// Alternate text for the persisted chat log.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_text: Option<String>,
        /// Requested formatting mode.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
        /// Progress updates may be collapsed/edited by the transport.
        #[serde(default)]
        is_progress: bool,
    },
    /// Task finished; frees the worker slot and running entry.
    TaskDone {
        /// Completed task.
        task_id: String,
        /// Worker that held it.
        worker_id: u32,
    },
    /// Per-task execution metrics for the append-only metrics log.
    TaskMetrics {
        /// Task the metrics describe.
        task_id: String,
        /// Task kind as a string tag.
        task_type: String,
        /// Wall-clock duration.
        duration_sec: f64,
        /// Number of tool invocations.
        tool_calls: u32,
        /// Number of failed tool invocations.
        tool_errors: u32,
    },
    /// Agent requests a review cycle.
    ReviewRequest {
        /// Why the review was requested.
        reason: String,
    },
    /// Agent requests an in-place supervisor restart.
    RestartRequest {
        /// Why the restart was requested.
        reason: String,
    },
    /// Agent requests fast-forwarding the stable branch pointer.
    PromoteToStable {
        /// Why promotion was requested.
        reason: String,
    },
    /// Agent schedules a follow-up chat task for itself.
    ScheduleTask {
        /// Description becoming the new task's text.
        description: String,
    },
    /// Agent requests cancelling a queued or running task.
    CancelTask {
        /// Task to cancel.
        task_id: String,
    },
    /// Outbound photo for the transport.
    SendPhoto {
        /// Destination chat.
        chat_id: i64,
        /// Base64-encoded PNG payload.
        image_base64: String,
        /// Caption shown with the photo.
        #[serde(default)]
        caption: String,
    },
    /// Flip the autonomous evolution mode flag.
    ToggleEvolution {
        /// Desired state.
        enabled: bool,
    },
    /// Control the background mind loop.
    ToggleConsciousness {
        /// One of `start`, `stop`, `status`.
        action: String,
    },
    /// Emitted once per worker process after initialization.
    WorkerBoot {
        /// Worker slot id.
        worker_id: u32,
        /// OS process id of the worker.
        pid: u32,
        /// Commit hash the worker's code was loaded from.
        git_sha: String,
        /// Branch the worker's checkout is on.
        git_branch: String,
    },
}

impl WorkerEvent {
    /// The wire tag for this event, matching the serde representation.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::LlmUsage { .. } => "llm_usage",
            Self::TaskHeartbeat { .. } => "task_heartbeat",
            Self::SendMessage { .. } => "send_message",
            Self::TaskDone { .. } => "task_done",
            Self::TaskMetrics { .. } => "task_metrics",
            Self::ReviewRequest { .. } => "review_request",
            Self::RestartRequest { .. } => "restart_request",
            Self::PromoteToStable { .. } => "promote_to_stable",
            Self::ScheduleTask { .. } => "schedule_task",
            Self::CancelTask { .. } => "cancel_task",
            Self::SendPhoto { .. } => "send_photo",
            Self::ToggleEvolution { .. } => "toggle_evolution",
            Self::ToggleConsciousness { .. } => "toggle_consciousness",
            Self::WorkerBoot { .. } => "worker_boot",
        }
    }
}
