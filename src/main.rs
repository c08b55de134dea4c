#![forbid(unsafe_code)]

//! `moltd`: self-modifying agent supervisor binary.
//!
//! `moltd run` boots the supervisor; `moltd worker` is the subcommand
//! the pool re-invokes this executable with. Restart requests replace
//! the process image in place with a fresh `run` invocation.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use moltd::executor::FallbackExecutor;
use moltd::models::{Task, TaskKind};
use moltd::supervisor::Supervisor;
use moltd::{restart, worker, AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "moltd", about = "Self-modifying agent supervisor", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    ///
    /// Global so the restart exec can pass it after the subcommand.
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the supervisor (the default).
    Run,
    /// Run as a pool worker (spawned by the supervisor).
    #[command(hide = true)]
    Worker,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    // Worker stdout is the event stream; its logs must go to stderr.
    let use_stderr = matches!(args.command, Some(Command::Worker));
    init_tracing(args.log_format, use_stderr)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(dispatch(args))
}

async fn dispatch(args: Cli) -> Result<()> {
    match args.command {
        Some(Command::Worker) => run_worker().await,
        Some(Command::Run) | None => run_supervisor(args).await,
    }
}

async fn run_worker() -> Result<()> {
    // Slot id comes from MOLTD_WORKER_ID; events are stamped with it.
    let worker_id = std::env::var("MOLTD_WORKER_ID")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    worker::run_worker(Arc::new(FallbackExecutor::new(worker_id))).await
}

async fn run_supervisor(args: Cli) -> Result<()> {
    info!("moltd supervisor bootstrap");
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Err(err) = config.load_credentials().await {
        warn!(%err, "credentials unavailable, running local-only");
        config.telegram.owner_chat_id = None;
    }

    let supervisor = Supervisor::new(config).await?;
    let owner_chat_id = supervisor.state().owner_chat_id;
    let inbound = supervisor.inbound_sender();

    // Operator tasks typed on the terminal become chat tasks.
    let stdin_task = tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            let task = Task::new(TaskKind::Chat, owner_chat_id.unwrap_or(0), text);
            if inbound.send(task).await.is_err() {
                break;
            }
        }
    });

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    let restart_reason = supervisor.run(shutdown).await?;
    stdin_task.abort();

    if let Some(reason) = restart_reason {
        info!(reason, "replacing process image");
        let exec_args = vec![
            "run".to_owned(),
            "--config".to_owned(),
            args.config.display().to_string(),
            "--log-format".to_owned(),
            args.log_format.as_str().to_owned(),
        ];
        // Only returns on failure.
        let err = restart::exec_replace(&exec_args);
        error!("in-place restart failed");
        return err;
    }

    info!("moltd shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}


fn init_tracing(log_format: LogFormat, use_stderr: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fail = |err| AppError::Config(format!("failed to init tracing: {err}"));
    if use_stderr {
        let subscriber = fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr);
        match log_format {
            LogFormat::Text => subscriber.try_init().map_err(fail)?,
            LogFormat::Json => subscriber.json().try_init().map_err(fail)?,
        }
    } else {
        let subscriber = fmt().with_env_filter(env_filter);
        match log_format {
            LogFormat::Text => subscriber.try_init().map_err(fail)?,
            LogFormat::Json => subscriber.json().try_init().map_err(fail)?,
        }
    }

    Ok(())
}
