//! Pure health-policy logic: crash-storm accounting and task timeouts.
//!
//! The supervisor's polling cycle feeds observations in; this module
//! owns the classification rules so they stay unit-testable without
//! real processes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::models::RunningEntry;

/// What a liveness sweep concluded about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StormVerdict {
    /// Nothing alarming; keep respawning.
    Calm,
    /// Qualifying-crash threshold reached; tear the pool down.
    Storm,
}

/// Rolling window of qualifying crash timestamps.
///
/// A detected death qualifies only when the worker held a task
/// (busy-crash) or the entire pool died at once. Idle-only deaths with
/// at least one survivor are benign capacity loss and *clear* the
/// window instead of feeding it.
#[derive(Debug)]
pub struct CrashWindow {
    timestamps: Vec<Instant>,
    window: Duration,
    threshold: usize,
}

impl CrashWindow {
    /// Build a window with the given span and storm threshold.
    #[must_use]
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            timestamps: Vec::new(),
            window,
            threshold,
        }
    }

    /// Record the outcome of one liveness sweep.
    ///
    /// `dead` is the number of deaths detected this sweep, `busy` how
    /// many of those held a task, `alive_now` the surviving worker count
    /// after the sweep.
    pub fn record_sweep(&mut self, dead: usize, busy: usize, alive_now: usize) -> StormVerdict {
        let now = Instant::now();
        if dead > 0 {
            if busy > 0 || alive_now == 0 {
                for _ in 0..dead.max(1) {
                    self.timestamps.push(now);
                }
            } else {
                self.timestamps.clear();
            }
        }

        self.timestamps.retain(|t| now.duration_since(*t) < self.window);
        if self.timestamps.len() >= self.threshold {
            StormVerdict::Storm
        } else {
            StormVerdict::Calm
        }
    }

    /// Qualifying crashes currently inside the window.
    #[must_use]
    pub fn count(&self) -> usize {
        self.timestamps.len()
    }

    /// Reset after a storm has been handled.
    pub fn clear(&mut self) {
        self.timestamps.clear();
    }
}

/// Supervisor-side action for one running task's timeout state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Heartbeats are fresh enough.
    None,
    /// Soft threshold crossed and not yet warned; warn once.
    SoftWarn,
    /// Hard threshold crossed; treat as a crash even if the process
    /// is technically alive.
    HardRequeue,
}

/// Classify a running task by heartbeat staleness.
///
/// Both thresholds compare `now - last_heartbeat_at`: a hung worker
/// cannot be trusted to time itself out, so staleness is the single
/// authoritative signal.
#[must_use]
pub fn classify_timeout(
    entry: &RunningEntry,
    now: DateTime<Utc>,
    soft: Duration,
    hard: Duration,
) -> TimeoutAction {
    let stale = now
        .signed_duration_since(entry.last_heartbeat_at)
        .to_std()
        .unwrap_or(Duration::ZERO);

    if stale >= hard {
        TimeoutAction::HardRequeue
    } else if stale >= soft && !entry.soft_warned {
        TimeoutAction::SoftWarn
    } else {
        TimeoutAction::None
    }
}
