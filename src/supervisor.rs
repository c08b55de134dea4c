//! Supervisor: the single owner of queue, pool, budget, and state.
//!
//! All mutable scheduling state lives here and is touched only from the
//! `run()` select loop, so no handler ever races another. The loop
//! multiplexes four inputs: the inbound task channel, the worker event
//! channel, the mind's event channel, and a one-second tick driving the
//! health/assignment cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::budget::BudgetGate;
use crate::config::GlobalConfig;
use crate::executor::{Executor, FallbackExecutor, APOLOGY_TEXT};
use crate::gitops;
use crate::lock::RepoMutationLock;
use crate::logs::JsonlLog;
use crate::mind::BackgroundMind;
use crate::models::{StateStore, SupervisorState, Task, TaskKind, WorkerEvent};
use crate::pool::{classify_timeout, CrashWindow, StormVerdict, TimeoutAction, WorkerPool};
use crate::queue::{Requeue, TaskQueue};
use crate::restart;
use crate::transport::{
    MessengerService, NullTransport, Outbound, TelegramTransport, Transport,
};
use crate::{AppError, Result};

const INBOUND_CHANNEL_CAPACITY: usize = 64;
const MIND_CHANNEL_CAPACITY: usize = 64;
const MESSENGER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Central scheduling context; see the module docs for the ownership
/// story.
pub struct Supervisor {
    pub(crate) config: GlobalConfig,
    pub(crate) queue: TaskQueue,
    pub(crate) pool: WorkerPool,
    pub(crate) budget: BudgetGate,
    pub(crate) crash_window: CrashWindow,
    pub(crate) state: SupervisorState,
    pub(crate) state_store: StateStore,
    pub(crate) supervisor_log: JsonlLog,
    pub(crate) events_log: JsonlLog,
    pub(crate) messenger: MessengerService,
    pub(crate) mind: BackgroundMind,
    pub(crate) lock: RepoMutationLock,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) degraded: bool,
    pub(crate) restart_reason: Option<String>,
    pub(crate) boot_deadline: Option<Instant>,
    pub(crate) boot_verified: bool,
    messenger_task: JoinHandle<()>,
    last_evolution: Option<Instant>,
    inbound_tx: mpsc::Sender<Task>,
    inbound_rx: Option<mpsc::Receiver<Task>>,
    mind_rx: Option<mpsc::Receiver<WorkerEvent>>,
}

impl Supervisor {
    /// Build a supervisor with production wiring: Telegram transport
    /// when a bot token was loaded, local-only otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error when logs, state, or the queue snapshot cannot
    /// be initialized.
    pub async fn new(config: GlobalConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> = if config.telegram.bot_token.is_empty() {
            Arc::new(NullTransport)
        } else {
            Arc::new(TelegramTransport::new(&config.telegram)?)
        };
        Self::with_parts(config, transport, Arc::new(FallbackExecutor::new(0))).await
    }

    /// Build a supervisor with an explicit transport and executor.
    ///
    /// # Errors
    ///
    /// Returns an error when logs, state, or the queue snapshot cannot
    /// be initialized.
    pub async fn with_parts(
        config: GlobalConfig,
        transport: Arc<dyn Transport>,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        let supervisor_log = JsonlLog::open(config.supervisor_log_path())?;
        let events_log = JsonlLog::open(config.events_log_path())?;
        let (messenger, messenger_task) = MessengerService::start(transport);

        let state_store = StateStore::new(config.state_path());
        let state = state_store.load()?;
        let budget = BudgetGate::new(&config.budget, state.spent_usd);
        let crash_window = CrashWindow::new(
            Duration::from_secs(config.health.crash_window_seconds),
            config.health.crash_storm_threshold,
        );
        let lock = RepoMutationLock::new(
            config.lock_path(),
            Duration::from_secs(config.lock.stale_seconds),
            Duration::from_secs(config.lock.acquire_timeout_seconds),
        );
        let pool = WorkerPool::new(
            config.spawn_grace(),
            Duration::from_secs(config.timeouts.worker_join_seconds),
        );
        let queue = TaskQueue::new(config.snapshot_path());

        let (mind_tx, mind_rx) = mpsc::channel(MIND_CHANNEL_CAPACITY);
        let mind = BackgroundMind::new(
            config.mind.clone(),
            budget.background_allocation_usd(),
            Arc::clone(&executor),
            mind_tx,
        );
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

        let mut supervisor = Self {
            config,
            queue,
            pool,
            budget,
            crash_window,
            state,
            state_store,
            supervisor_log,
            events_log,
            messenger,
            mind,
            lock,
            executor,
            degraded: false,
            restart_reason: None,
            boot_deadline: None,
            boot_verified: false,
            messenger_task,
            last_evolution: None,
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            mind_rx: Some(mind_rx),
        };
        supervisor.boot().await?;
        Ok(supervisor)
    }

    /// Boot sequence: resolve HEAD, claim any pending restart
    /// verification, recover the queue snapshot, persist fresh state.
    async fn boot(&mut self) -> Result<()> {
        match gitops::head_info(&self.config.repo_dir).await {
            Ok(head) => {
                self.state.current_sha = head.sha;
                self.state.current_branch = head.branch;
            }
            Err(err) => {
                warn!(%err, "could not resolve repo HEAD, keeping persisted revision");
            }
        }
        if self.config.telegram.owner_chat_id.is_some() {
            self.state.owner_chat_id = self.config.telegram.owner_chat_id;
        }
        if self.config.evolution.enabled {
            self.state.evolution_enabled = true;
        }
        self.state.session_id = crate::models::task::short_id();
        self.state_store.save(&self.state)?;

        if let Some(outcome) =
            restart::claim_verification(&self.config.verify_dir(), &self.state.current_sha)
        {
            self.supervisor_log.append_lossy(&json!({
                "type": "restart_verify",
                "ok": outcome.ok,
                "expected_sha": outcome.expected_sha,
                "observed_sha": outcome.observed_sha,
                "reason": outcome.reason,
            }));
            if outcome.ok {
                self.notify(format!(
                    "✅ restarted on expected revision ({})",
                    short_sha(&outcome.observed_sha)
                ));
            } else {
                self.notify(format!(
                    "⚠️ restart verification failed: expected {}, running {}",
                    short_sha(&outcome.expected_sha),
                    short_sha(&outcome.observed_sha)
                ));
            }
        }

        let dropped = self.queue.recover_from_snapshot()?;
        for task in dropped {
            self.notify(format!(
                "🗑️ task {} could not be recovered and was dropped",
                task.id
            ));
        }

        if self.config.mind.enabled {
            self.mind.start();
        }
        info!(
            sha = %short_sha(&self.state.current_sha),
            branch = %self.state.current_branch,
            pending = self.queue.pending_len(),
            "supervisor booted"
        );
        Ok(())
    }

    /// Sender for external task admission (chat frontends, tests).
    #[must_use]
    pub fn inbound_sender(&self) -> mpsc::Sender<Task> {
        self.inbound_tx.clone()
    }

    /// Whether the supervisor is in degraded direct-execution mode.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Reason of a restart requested but not yet acted on, if any.
    #[must_use]
    pub fn restart_requested(&self) -> Option<&str> {
        self.restart_reason.as_deref()
    }

    /// Current persisted state (read-only).
    #[must_use]
    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    /// The task queue.
    #[must_use]
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Mutable access to the task queue (tests, embedding frontends).
    pub fn queue_mut(&mut self) -> &mut TaskQueue {
        &mut self.queue
    }

    /// The budget gate.
    #[must_use]
    pub fn budget(&self) -> &BudgetGate {
        &self.budget
    }

    /// Admit a task directly, bypassing the inbound channel.
    ///
    /// # Errors
    ///
    /// Returns an error when the queue snapshot cannot be persisted.
    pub fn enqueue_task(&mut self, task: Task) -> Result<()> {
        self.queue.enqueue(task, false)
    }

    /// Run the supervisor until cancellation or a restart request.
    ///
    /// Returns the restart reason when the loop exited to replace the
    /// process image, `None` on a plain shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error when the pool cannot be spawned or final state
    /// persistence fails.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<Option<String>> {
        let mut event_rx = self.spawn_pool().await?;
        let mut inbound_rx = self
            .inbound_rx
            .take()
            .ok_or_else(|| AppError::Pool("supervisor run() called twice".into()))?;
        let mut mind_rx = self
            .mind_rx
            .take()
            .ok_or_else(|| AppError::Pool("supervisor run() called twice".into()))?;

        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let restart = loop {
            if let Some(reason) = self.restart_reason.take() {
                break Some(reason);
            }
            tokio::select! {
                () = shutdown.cancelled() => break None,
                Some(line) = event_rx.recv() => self.dispatch_raw(&line).await,
                Some(event) = mind_rx.recv() => self.dispatch_event(event).await,
                Some(task) = inbound_rx.recv() => {
                    if let Err(err) = self.queue.enqueue(task, false) {
                        error!(%err, "failed to admit inbound task");
                    }
                }
                _ = ticker.tick() => self.tick().await,
            }
        };

        if let Some(reason) = &restart {
            info!(reason, "supervisor loop exiting for restart");
            self.supervisor_log
                .append_lossy(&json!({"type": "restarting", "reason": reason}));
        }
        self.finalize().await?;
        Ok(restart)
    }

    /// One full scheduling cycle: health, boot verification, evolution
    /// scheduling, assignment, mind gating.
    pub async fn tick(&mut self) {
        self.health_step().await;
        self.boot_verify_step();
        self.evolution_step();
        self.assign_step().await;
        if self.queue.running_len() > 0 {
            self.mind.pause();
        } else {
            self.mind.resume();
        }
    }

    /// Spawn a fresh pool, arming the boot-verification deadline.
    async fn spawn_pool(&mut self) -> Result<mpsc::Receiver<String>> {
        let rx = self
            .pool
            .spawn_all(self.config.max_workers, &self.config)
            .await?;
        self.degraded = false;
        self.crash_window.clear();
        self.boot_verified = false;
        self.boot_deadline = Some(
            Instant::now() + Duration::from_secs(self.config.timeouts.boot_verify_seconds),
        );
        Ok(rx)
    }

    /// Explicitly leave degraded mode by spawning a fresh pool.
    ///
    /// Returns the new worker event receiver; the caller is responsible
    /// for draining it. `run()` captures its own receiver at entry and
    /// never re-polls a replacement, so this is only usable from an
    /// embedding loop that drives [`Self::tick`] and event dispatch
    /// itself, or before `run()` starts. A `run()` that entered
    /// degraded mode stays degraded until the process restarts.
    ///
    /// # Errors
    ///
    /// Returns an error when any worker fails to spawn.
    pub async fn respawn_pool(&mut self) -> Result<mpsc::Receiver<String>> {
        info!("respawning worker pool on request");
        self.spawn_pool().await
    }

    async fn health_step(&mut self) {
        if self.degraded || self.pool.is_empty() {
            return;
        }
        if !self.pool.in_spawn_grace() {
            self.sweep_dead().await;
        }
        if self.degraded {
            // The sweep tore the pool down; nothing left to time out.
            return;
        }
        self.timeout_step();
    }

    async fn sweep_dead(&mut self) {
        let dead = self.pool.find_dead();
        if dead.is_empty() {
            return;
        }
        let alive_now = self.pool.alive_count();
        let busy = dead.iter().filter(|d| d.busy_task_id.is_some()).count();

        for d in &dead {
            warn!(
                worker_id = d.worker_id,
                exit_code = d.exit_code,
                task_id = d.busy_task_id.as_deref(),
                "worker died"
            );
            self.supervisor_log.append_lossy(&json!({
                "type": "worker_crash",
                "worker_id": d.worker_id,
                "exit_code": d.exit_code,
                "task_id": d.busy_task_id,
            }));
            if let Some(task_id) = d.busy_task_id.clone() {
                self.requeue_abandoned(&task_id);
            }
        }

        match self.crash_window.record_sweep(dead.len(), busy, alive_now) {
            StormVerdict::Storm => {
                self.enter_degraded("crash storm detected").await;
            }
            StormVerdict::Calm => {
                for d in dead {
                    if let Err(err) = self.pool.respawn(d.worker_id, &self.config) {
                        error!(worker_id = d.worker_id, %err, "failed to respawn worker");
                    }
                }
            }
        }
    }

    fn timeout_step(&mut self) {
        let now = Utc::now();
        let soft = Duration::from_secs(self.config.timeouts.soft_task_seconds);
        let hard = Duration::from_secs(self.config.timeouts.hard_task_seconds);

        let mut soft_ids = Vec::new();
        let mut hard_hits = Vec::new();
        for (id, entry) in self.queue.running_iter() {
            match classify_timeout(entry, now, soft, hard) {
                TimeoutAction::SoftWarn => soft_ids.push(id.clone()),
                TimeoutAction::HardRequeue => hard_hits.push((id.clone(), entry.worker_id)),
                TimeoutAction::None => {}
            }
        }

        for id in soft_ids {
            if let Some(entry) = self.queue.running_entry_mut(&id) {
                entry.soft_warned = true;
            }
            self.supervisor_log
                .append_lossy(&json!({"type": "task_soft_timeout", "task_id": id}));
            self.notify(format!("⚠️ task {id} has gone quiet (no heartbeat)"));
        }

        for (id, worker_id) in hard_hits {
            warn!(task_id = %id, worker_id, "hard timeout, killing worker");
            self.supervisor_log.append_lossy(&json!({
                "type": "task_hard_timeout",
                "task_id": id,
                "worker_id": worker_id,
            }));
            // Leave the busy flag set: the next sweep classifies this
            // death as a busy crash and respawns the slot.
            self.pool.kill_worker(worker_id);
            self.requeue_abandoned(&id);
        }
    }

    /// Route a crashed/hung task from the running table back through
    /// admission, notifying the operator about the outcome.
    pub(crate) fn requeue_abandoned(&mut self, task_id: &str) {
        let Some(entry) = self.queue.take_running(task_id) else {
            return;
        };
        let chat_id = entry.task.chat_id;
        match self.queue.requeue_crashed(entry.task) {
            Ok(Requeue::Retried(task)) => {
                self.notify(format!(
                    "♻️ task {} requeued after a worker crash (attempt {})",
                    task.id, task.attempt
                ));
            }
            Ok(Requeue::Dropped(task)) => {
                self.notify(format!("🗑️ task {} dropped after repeated crashes", task.id));
                if chat_id != 0 {
                    self.messenger.enqueue_lossy(Outbound::Text {
                        chat_id,
                        text: APOLOGY_TEXT.to_owned(),
                        is_progress: false,
                    });
                }
            }
            Err(err) => error!(%err, task_id, "failed to requeue abandoned task"),
        }
    }

    async fn enter_degraded(&mut self, why: &str) {
        error!(why, "entering degraded direct-execution mode");
        self.supervisor_log
            .append_lossy(&json!({"type": "crash_storm", "detail": why}));
        self.notify(format!(
            "⛔ {why}; worker pool disabled, handling tasks directly"
        ));

        self.pool.shutdown().await;
        let running: Vec<String> = self.queue.running_iter().map(|(id, _)| id.clone()).collect();
        for id in running {
            self.requeue_abandoned(&id);
        }
        self.crash_window.clear();
        self.degraded = true;
    }

    fn boot_verify_step(&mut self) {
        if self.boot_verified {
            return;
        }
        let Some(deadline) = self.boot_deadline else {
            return;
        };
        if Instant::now() < deadline {
            return;
        }
        self.boot_deadline = None;
        warn!("no worker reported boot before the verification deadline");
        self.supervisor_log
            .append_lossy(&json!({"type": "worker_sha_verify_timeout"}));
        self.notify("⚠️ no worker reported boot before the verification deadline".to_owned());
    }

    fn evolution_step(&mut self) {
        if !self.state.evolution_enabled || self.degraded {
            return;
        }
        let cycle = Duration::from_secs(self.config.evolution.interval_seconds);
        let due = self.last_evolution.map_or(true, |t| t.elapsed() >= cycle);
        if !due {
            return;
        }
        self.last_evolution = Some(Instant::now());
        if self.queue.has_kind(TaskKind::Evolution) {
            debug!("evolution cycle skipped, one already pending or running");
            return;
        }
        let chat_id = self.state.owner_chat_id.unwrap_or(0);
        let task = Task::new(TaskKind::Evolution, chat_id, "autonomous evolution cycle");
        info!(task_id = %task.id, "evolution cycle enqueued");
        if let Err(err) = self.queue.enqueue(task, false) {
            error!(%err, "failed to enqueue evolution cycle");
        }
    }

    async fn assign_step(&mut self) {
        if self.degraded {
            self.assign_degraded().await;
            return;
        }
        loop {
            let idle = self.pool.idle_worker_ids();
            let Some(&slot) = idle.first() else { break };
            let Some(task) = self.queue.dequeue() else { break };
            if !self.admit(&task) {
                continue;
            }
            if task.kind.notifies_on_start() {
                self.notify(format!(
                    "▶️ starting {} task {}",
                    task.kind.as_str(),
                    task.id
                ));
            }
            match self.pool.send_task(slot, &task).await {
                Ok(()) => {
                    if let Err(err) = self.queue.mark_running(task, slot) {
                        error!(%err, "failed to record running task");
                    }
                }
                Err(err) => {
                    warn!(%err, worker_id = slot, "task handoff failed, re-admitting");
                    self.queue.push_front_unassigned(task);
                    break;
                }
            }
        }
    }

    /// Budget admission; a refused task is dropped silently with a log
    /// record and a fresh snapshot, no operator notification.
    fn admit(&mut self, task: &Task) -> bool {
        if self.budget.admits(task.kind) {
            return true;
        }
        let pct = self.budget.percent_spent();
        warn!(task_id = %task.id, percent_spent = pct, "task refused by budget gate");
        self.supervisor_log.append_lossy(&json!({
            "type": "task_budget_dropped",
            "task_id": task.id,
            "percent_spent": pct,
        }));
        if let Err(err) = self.queue.persist("budget_drop") {
            error!(%err, "failed to persist snapshot after budget drop");
        }
        false
    }

    /// Degraded mode: execute dequeued tasks synchronously through the
    /// executor and feed the resulting events through normal dispatch.
    async fn assign_degraded(&mut self) {
        while let Some(task) = self.queue.dequeue() {
            if !self.admit(&task) {
                continue;
            }
            if let Err(err) = self.queue.mark_running(task.clone(), 0) {
                error!(%err, "failed to record direct-mode task");
                continue;
            }
            match self.executor.handle(task.clone()).await {
                Ok(events) => {
                    for event in events {
                        self.dispatch_event(event).await;
                    }
                }
                Err(err) => {
                    error!(%err, task_id = %task.id, "direct execution failed");
                    self.supervisor_log.append_lossy(&json!({
                        "type": "worker_crash",
                        "worker_id": 0,
                        "task_id": task.id,
                        "error": err.to_string(),
                    }));
                    self.requeue_abandoned(&task.id);
                }
            }
            if self.queue.running_entry(&task.id).is_some() {
                warn!(task_id = %task.id, "executor finished without task_done, completing");
                if let Err(err) = self.queue.complete(&task.id) {
                    error!(%err, "failed to complete direct-mode task");
                }
            }
        }
    }

    /// Best-effort operator notification; silently a no-op in
    /// local-only mode (no owner chat bound).
    pub(crate) fn notify(&self, text: impl Into<String>) {
        let Some(chat_id) = self.state.owner_chat_id else {
            debug!("operator notification skipped, no owner chat bound");
            return;
        };
        self.messenger.enqueue_lossy(Outbound::Text {
            chat_id,
            text: text.into(),
            is_progress: false,
        });
    }

    /// Tear everything down and persist final state.
    async fn finalize(mut self) -> Result<()> {
        self.mind.stop().await;
        self.pool.shutdown().await;
        if self.queue.running_len() > 0 {
            // Abandoned by teardown; recovery requeues them next boot.
            info!(
                count = self.queue.running_len(),
                "running tasks left for snapshot recovery"
            );
        }
        self.queue.persist("shutdown")?;
        self.state.spent_usd = self.budget.spent_usd();
        self.state_store.save(&self.state)?;

        drop(self.messenger);
        match tokio::time::timeout(MESSENGER_DRAIN_TIMEOUT, self.messenger_task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%err, "messenger drain task failed"),
            Err(_) => warn!("messenger drain timed out"),
        }
        Ok(())
    }
}

/// First eight characters of a commit hash for log/operator display.
fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}
