//! Task model and running-table entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of work a task represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Operator-initiated chat request.
    Chat,
    /// Autonomous self-improvement cycle (budget-gated).
    Evolution,
    /// Code-review cycle over recent changes.
    Review,
}

impl TaskKind {
    /// Whether admission of this kind is gated by the budget ceiling.
    #[must_use]
    pub fn is_background_class(self) -> bool {
        matches!(self, Self::Evolution)
    }

    /// Whether the operator gets a start notification for this kind.
    #[must_use]
    pub fn notifies_on_start(self) -> bool {
        matches!(self, Self::Evolution | Self::Review)
    }

    /// Wire/log tag for this kind, matching the serde representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Evolution => "evolution",
            Self::Review => "review",
        }
    }
}

/// Optional inline attachment carried with a chat task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Attachment {
    /// Base64-encoded image payload.
    pub image_base64: String,
    /// MIME type of the payload.
    pub image_mime: String,
}

/// Unit of work flowing through the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Task {
    /// Unique task identifier.
    pub id: String,
    /// Task kind.
    #[serde(rename = "type")]
    pub kind: TaskKind,
    /// Chat the results are delivered to.
    pub chat_id: i64,
    /// Text payload (prompt, instruction, or review reason).
    pub text: String,
    /// Optional attachment reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// Delivery attempt, starting at 1; incremented on crash requeue.
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    /// Monotonic admission sequence; assigned at enqueue, never reused.
    #[serde(default)]
    pub enqueue_seq: u64,
}

fn default_attempt() -> u32 {
    1
}

impl Task {
    /// Construct a new first-attempt task with a generated short id.
    #[must_use]
    pub fn new(kind: TaskKind, chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            id: short_id(),
            kind,
            chat_id,
            text: text.into(),
            attachment: None,
            attempt: 1,
            enqueue_seq: 0,
        }
    }
}

/// Generate an 8-hex-char task identifier.
#[must_use]
pub fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Snapshot of a task currently held by a worker.
///
/// Exists only while the task is in the running table; destroyed on
/// completion, crash requeue, or pool teardown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RunningEntry {
    /// Task snapshot as assigned.
    pub task: Task,
    /// Worker slot holding the task.
    pub worker_id: u32,
    /// Assignment timestamp.
    pub started_at: DateTime<Utc>,
    /// Last heartbeat observed for the task.
    pub last_heartbeat_at: DateTime<Utc>,
    /// Whether the one-shot soft timeout warning was already sent.
    #[serde(default)]
    pub soft_warned: bool,
    /// Cooperative cancellation requested by the operator.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Phase reported with the most recent heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_phase: Option<String>,
}

impl RunningEntry {
    /// Create a running entry for a freshly assigned task.
    #[must_use]
    pub fn assigned(task: Task, worker_id: u32, now: DateTime<Utc>) -> Self {
        Self {
            task,
            worker_id,
            started_at: now,
            last_heartbeat_at: now,
            soft_warned: false,
            cancel_requested: false,
            heartbeat_phase: None,
        }
    }
}
