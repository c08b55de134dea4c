//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Nested Telegram configuration for the operator messaging transport.
///
/// The bot token is loaded at runtime via OS keychain or environment
/// variable, never from the TOML config file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TelegramConfig {
    /// Chat ID of the operator; `None` runs the supervisor local-only.
    #[serde(default)]
    pub owner_chat_id: Option<i64>,
    /// Bot token used for the Telegram Bot API (populated at runtime).
    #[serde(skip)]
    pub bot_token: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            owner_chat_id: None,
            bot_token: String::new(),
        }
    }
}

/// Configurable timeout values (seconds) for worker supervision.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Heartbeat staleness after which a running task gets one warning.
    #[serde(default = "default_soft_task_seconds")]
    pub soft_task_seconds: u64,
    /// Heartbeat staleness after which a running task is force-requeued.
    #[serde(default = "default_hard_task_seconds")]
    pub hard_task_seconds: u64,
    /// Window after a pool (re)spawn during which liveness checks are
    /// suspended while workers initialize.
    #[serde(default = "default_spawn_grace_seconds")]
    pub spawn_grace_seconds: u64,
    /// Bounded join timeout when terminating worker processes.
    #[serde(default = "default_worker_join_seconds")]
    pub worker_join_seconds: u64,
    /// Deadline for observing a `worker_boot` event after a pool spawn.
    #[serde(default = "default_boot_verify_seconds")]
    pub boot_verify_seconds: u64,
    /// Interval between worker heartbeat events while a task runs.
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            soft_task_seconds: default_soft_task_seconds(),
            hard_task_seconds: default_hard_task_seconds(),
            spawn_grace_seconds: default_spawn_grace_seconds(),
            worker_join_seconds: default_worker_join_seconds(),
            boot_verify_seconds: default_boot_verify_seconds(),
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
        }
    }
}

fn default_soft_task_seconds() -> u64 {
    600
}

fn default_hard_task_seconds() -> u64 {
    1800
}

fn default_spawn_grace_seconds() -> u64 {
    90
}

fn default_worker_join_seconds() -> u64 {
    5
}

fn default_boot_verify_seconds() -> u64 {
    5
}

fn default_heartbeat_interval_seconds() -> u64 {
    30
}

/// Budget limits and admission thresholds.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct BudgetConfig {
    /// Total spend limit in USD; 0 disables all budget gating.
    #[serde(default)]
    pub total_limit_usd: f64,
    /// Share of the total budget allocated to the background mind loop.
    #[serde(default = "default_background_pct")]
    pub background_pct: f64,
    /// Percent spent at which evolution tasks are refused assignment.
    #[serde(default = "default_evolution_cutoff_pct")]
    pub evolution_cutoff_pct: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            total_limit_usd: 0.0,
            background_pct: default_background_pct(),
            evolution_cutoff_pct: default_evolution_cutoff_pct(),
        }
    }
}

fn default_background_pct() -> f64 {
    10.0
}

fn default_evolution_cutoff_pct() -> f64 {
    95.0
}

/// Crash-storm detection thresholds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HealthConfig {
    /// Rolling window in which qualifying crashes are counted.
    #[serde(default = "default_crash_window_seconds")]
    pub crash_window_seconds: u64,
    /// Qualifying crashes within the window that declare a storm.
    #[serde(default = "default_crash_storm_threshold")]
    pub crash_storm_threshold: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            crash_window_seconds: default_crash_window_seconds(),
            crash_storm_threshold: default_crash_storm_threshold(),
        }
    }
}

fn default_crash_window_seconds() -> u64 {
    60
}

fn default_crash_storm_threshold() -> usize {
    3
}

/// Repository mutation lock tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LockConfig {
    /// Age after which an existing lock marker is considered abandoned.
    #[serde(default = "default_lock_stale_seconds")]
    pub stale_seconds: u64,
    /// Overall bound on one acquisition attempt.
    #[serde(default = "default_lock_acquire_timeout_seconds")]
    pub acquire_timeout_seconds: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_seconds: default_lock_stale_seconds(),
            acquire_timeout_seconds: default_lock_acquire_timeout_seconds(),
        }
    }
}

fn default_lock_stale_seconds() -> u64 {
    600
}

fn default_lock_acquire_timeout_seconds() -> u64 {
    900
}

/// Autonomous evolution cycle scheduling.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EvolutionConfig {
    /// Whether evolution cycles are enqueued at startup.
    #[serde(default)]
    pub enabled: bool,
    /// Interval between autonomous evolution cycles.
    #[serde(default = "default_evolution_interval_seconds")]
    pub interval_seconds: u64,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: default_evolution_interval_seconds(),
        }
    }
}

fn default_evolution_interval_seconds() -> u64 {
    3600
}

/// Background mind (idle thinking loop) settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MindConfig {
    /// Whether the background mind starts with the supervisor.
    #[serde(default)]
    pub enabled: bool,
    /// Default interval between wake cycles.
    #[serde(default = "default_mind_wake_seconds")]
    pub wake_seconds: u64,
}

impl Default for MindConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wake_seconds: default_mind_wake_seconds(),
        }
    }
}

fn default_mind_wake_seconds() -> u64 {
    300
}

fn default_max_workers() -> u32 {
    5
}

fn default_branch_dev() -> String {
    "molt".into()
}

fn default_branch_stable() -> String {
    "molt-stable".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Checkout of the self-modifying source repository.
    pub repo_dir: PathBuf,
    /// Durable state root: snapshots, locks, logs, verification records.
    pub state_root: PathBuf,
    /// Worker pool size.
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    /// Development branch the supervisor runs from.
    #[serde(default = "default_branch_dev")]
    pub branch_dev: String,
    /// Stable branch updated by promotion.
    #[serde(default = "default_branch_stable")]
    pub branch_stable: String,
    /// Override for the worker command; empty re-invokes the current
    /// executable with the `worker` subcommand.
    #[serde(default)]
    pub worker_command: Vec<String>,
    /// Telegram transport settings.
    #[serde(default)]
    pub telegram: TelegramConfig,
    /// Worker supervision timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Budget limits and admission thresholds.
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Crash-storm thresholds.
    #[serde(default)]
    pub health: HealthConfig,
    /// Mutation lock tuning.
    #[serde(default)]
    pub lock: LockConfig,
    /// Evolution cycle scheduling.
    #[serde(default)]
    pub evolution: EvolutionConfig,
    /// Background mind settings.
    #[serde(default)]
    pub mind: MindConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the Telegram bot token from OS keychain with env-var fallback.
    ///
    /// Tries the `moltd` keyring service first, then `TELEGRAM_BOT_TOKEN`.
    /// Skipped entirely when no operator chat is configured.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a chat is configured but neither the
    /// keychain nor the env var provides a token.
    pub async fn load_credentials(&mut self) -> Result<()> {
        if self.telegram.owner_chat_id.is_none() {
            return Ok(());
        }
        self.telegram.bot_token =
            load_credential("telegram_bot_token", "TELEGRAM_BOT_TOKEN").await?;
        Ok(())
    }

    /// Path to the persisted queue snapshot.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.state_root.join("state").join("queue_snapshot.json")
    }

    /// Path to the persisted supervisor state record.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.state_root.join("state").join("supervisor_state.json")
    }

    /// Directory holding restart verification records.
    #[must_use]
    pub fn verify_dir(&self) -> PathBuf {
        self.state_root.join("state")
    }

    /// Path to the repository mutation lock marker.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.state_root.join("locks").join("git.lock")
    }

    /// Path to the supervisor action log.
    #[must_use]
    pub fn supervisor_log_path(&self) -> PathBuf {
        self.state_root.join("logs").join("supervisor.jsonl")
    }

    /// Path to the worker/agent event log.
    #[must_use]
    pub fn events_log_path(&self) -> PathBuf {
        self.state_root.join("logs").join("events.jsonl")
    }

    /// Spawn-grace window as a [`Duration`].
    #[must_use]
    pub fn spawn_grace(&self) -> Duration {
        Duration::from_secs(self.timeouts.spawn_grace_seconds)
    }

    fn validate(&mut self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(AppError::Config(
                "max_workers must be greater than zero".into(),
            ));
        }
        if self.timeouts.hard_task_seconds <= self.timeouts.soft_task_seconds {
            return Err(AppError::Config(
                "hard_task_seconds must exceed soft_task_seconds".into(),
            ));
        }
        if self.health.crash_storm_threshold == 0 {
            return Err(AppError::Config(
                "crash_storm_threshold must be greater than zero".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.budget.background_pct)
            || !(0.0..=100.0).contains(&self.budget.evolution_cutoff_pct)
        {
            return Err(AppError::Config(
                "budget percentages must be within 0..=100".into(),
            ));
        }

        fs::create_dir_all(&self.state_root)
            .map_err(|err| AppError::Config(format!("state_root not creatable: {err}")))?;
        let canonical_state = self
            .state_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("state_root invalid: {err}")))?;
        self.state_root = canonical_state;

        let canonical_repo = self
            .repo_dir
            .canonicalize()
            .map_err(|err| AppError::Config(format!("repo_dir invalid: {err}")))?;
        self.repo_dir = canonical_repo;

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // Keychain access is synchronous I/O; keep it off the runtime threads.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new("moltd", &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    env::var(env_key).map_err(|_| {
        AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))
    })
}
