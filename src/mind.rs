//! Background thinking loop ("the mind").
//!
//! A secondary consumer of the [`Executor`] contract that wakes on a
//! fixed interval, runs a thought task, and forwards the resulting
//! events into the supervisor's dispatch path. It carries its own
//! sub-allocation of the total budget; once that is exhausted it sleeps
//! for a long fixed interval instead of thinking. The supervisor pauses
//! it while pooled tasks are running so interactive work always wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MindConfig;
use crate::executor::Executor;
use crate::models::{Task, TaskKind, WorkerEvent};

/// Sleep applied once the mind's sub-allocation is exhausted.
const OVER_BUDGET_SLEEP: Duration = Duration::from_secs(3600);

/// Floor for the wake interval, whatever the configuration says.
const MIN_WAKE_INTERVAL: Duration = Duration::from_millis(10);

/// Prompt given to the executor for each wake cycle.
const THOUGHT_PROMPT: &str =
    "Reflect on recent activity and surface anything worth the operator's attention.";

struct ActiveMind {
    cancel: CancellationToken,
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// Handle controlling the background thinking loop.
pub struct BackgroundMind {
    config: MindConfig,
    allocation_usd: f64,
    executor: Arc<dyn Executor>,
    event_tx: mpsc::Sender<WorkerEvent>,
    paused: Arc<AtomicBool>,
    spent: Arc<Mutex<f64>>,
    active: Option<ActiveMind>,
}

impl BackgroundMind {
    /// Build a stopped mind.
    ///
    /// `allocation_usd` is the sub-budget the loop may spend before it
    /// goes dormant; zero means unlimited.
    #[must_use]
    pub fn new(
        config: MindConfig,
        allocation_usd: f64,
        executor: Arc<dyn Executor>,
        event_tx: mpsc::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            config,
            allocation_usd,
            executor,
            event_tx,
            paused: Arc::new(AtomicBool::new(false)),
            spent: Arc::new(Mutex::new(0.0)),
            active: None,
        }
    }

    /// Whether the loop task is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Start the loop. Returns `false` if it was already running.
    pub fn start(&mut self) -> bool {
        if self.active.is_some() {
            return false;
        }
        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let handle = tokio::spawn(think_loop(LoopContext {
            executor: Arc::clone(&self.executor),
            event_tx: self.event_tx.clone(),
            cancel: cancel.clone(),
            wake: Arc::clone(&wake),
            paused: Arc::clone(&self.paused),
            spent: Arc::clone(&self.spent),
            allocation_usd: self.allocation_usd,
            // A zero interval would spin the select loop without ever
            // yielding to the runtime.
            wake_interval: Duration::from_secs(self.config.wake_seconds)
                .max(MIN_WAKE_INTERVAL),
        }));
        self.active = Some(ActiveMind {
            cancel,
            wake,
            handle,
        });
        info!(wake_seconds = self.config.wake_seconds, "mind started");
        true
    }

    /// Stop the loop and await its task. Returns `false` if it was not
    /// running.
    pub async fn stop(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        active.cancel.cancel();
        active.wake.notify_one();
        if let Err(err) = active.handle.await {
            warn!(%err, "mind loop task failed during stop");
        }
        info!("mind stopped");
        true
    }

    /// Suspend thinking without tearing the loop down.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    /// Lift a previous pause.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    /// Poke the loop to wake immediately.
    pub fn wake(&self) {
        if let Some(active) = &self.active {
            active.wake.notify_one();
        }
    }

    /// Human-readable status line for the operator.
    #[must_use]
    pub fn status(&self) -> String {
        let state = if self.active.is_some() {
            if self.paused.load(Ordering::Relaxed) {
                "running (paused)"
            } else {
                "running"
            }
        } else {
            "stopped"
        };
        let spent = self.spent.lock().map_or(0.0, |g| *g);
        if self.allocation_usd > 0.0 {
            format!(
                "mind {state}, spent ${spent:.2} of ${:.2}",
                self.allocation_usd
            )
        } else {
            format!("mind {state}, spent ${spent:.2} (no sub-budget)")
        }
    }
}

struct LoopContext {
    executor: Arc<dyn Executor>,
    event_tx: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,
    wake: Arc<Notify>,
    paused: Arc<AtomicBool>,
    spent: Arc<Mutex<f64>>,
    allocation_usd: f64,
    wake_interval: Duration,
}

async fn think_loop(ctx: LoopContext) {
    loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => break,
            () = ctx.wake.notified() => {}
            () = sleep(ctx.wake_interval) => {}
        }
        if ctx.cancel.is_cancelled() {
            break;
        }
        if ctx.paused.load(Ordering::Relaxed) {
            continue;
        }

        let spent_now = ctx.spent.lock().map_or(0.0, |g| *g);
        if ctx.allocation_usd > 0.0 && spent_now >= ctx.allocation_usd {
            debug!(spent_usd = spent_now, "mind sub-budget exhausted, going dormant");
            tokio::select! {
                () = ctx.cancel.cancelled() => break,
                () = sleep(OVER_BUDGET_SLEEP) => {}
            }
            continue;
        }

        let task = Task::new(TaskKind::Chat, 0, THOUGHT_PROMPT);
        match ctx.executor.handle(task).await {
            Ok(events) => {
                for mut event in events {
                    if let WorkerEvent::LlmUsage { usage, source } = &mut event {
                        *source = Some("mind".to_owned());
                        if let Ok(mut guard) = ctx.spent.lock() {
                            *guard += usage.cost_usd.max(0.0);
                        }
                    }
                    if ctx.event_tx.send(event).await.is_err() {
                        // Supervisor side is gone; nothing left to think for.
                        return;
                    }
                }
            }
            Err(err) => {
                warn!(%err, "mind thought cycle failed");
            }
        }
    }
}
