//! Domain models shared across supervisor and worker processes.

pub mod event;
pub mod state;
pub mod task;

pub use event::{UsageReport, WorkerEvent};
pub use state::{StateStore, SupervisorState};
pub use task::{Attachment, RunningEntry, Task, TaskKind};
