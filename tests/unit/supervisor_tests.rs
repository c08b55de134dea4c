//! Unit tests for supervisor event dispatch, budget accounting, and
//! the crash-storm path, built on the null transport and the fallback
//! executor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use moltd::config::GlobalConfig;
use moltd::executor::FallbackExecutor;
use moltd::models::{
    StateStore, SupervisorState, Task, TaskKind, UsageReport, WorkerEvent,
};
use moltd::queue::TaskQueue;
use moltd::supervisor::Supervisor;
use moltd::transport::{NullTransport, Transport};
use moltd::Result;

/// Transport double that records every delivery.
#[derive(Default)]
struct RecordingTransport {
    messages: Mutex<Vec<(i64, String)>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_message(&self, chat_id: i64, text: &str, _is_progress: bool) -> Result<()> {
        self.messages
            .lock()
            .expect("messages lock")
            .push((chat_id, text.to_owned()));
        Ok(())
    }

    async fn send_photo(&self, _chat_id: i64, _image: &[u8], _caption: &str) -> Result<()> {
        Ok(())
    }

    async fn send_typing(&self, _chat_id: i64) -> Result<()> {
        Ok(())
    }
}

fn test_config(scratch: &tempfile::TempDir, extra: &str) -> GlobalConfig {
    let repo_dir = scratch.path().join("repo");
    std::fs::create_dir_all(&repo_dir).expect("create repo dir");
    let raw = format!(
        r#"
repo_dir = "{repo}"
state_root = "{state}"
{extra}
"#,
        repo = repo_dir.display(),
        state = scratch.path().join("state").display(),
    );
    GlobalConfig::from_toml_str(&raw).expect("valid config")
}

async fn test_supervisor(config: GlobalConfig) -> Supervisor {
    Supervisor::with_parts(
        config,
        Arc::new(NullTransport),
        Arc::new(FallbackExecutor::new(0)),
    )
    .await
    .expect("build supervisor")
}

/// Parse every record of a JSONL file.
fn read_jsonl(path: &std::path::Path) -> Vec<serde_json::Value> {
    let raw = std::fs::read_to_string(path).expect("read jsonl");
    raw.lines()
        .map(|line| serde_json::from_str(line).expect("parse jsonl record"))
        .collect()
}

#[tokio::test]
async fn malformed_worker_lines_are_logged_and_dropped() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let config = test_config(&scratch, "");
    let log_path = config.supervisor_log_path();
    let mut supervisor = test_supervisor(config).await;

    supervisor.dispatch_raw("{not json").await;
    supervisor.dispatch_raw(r#"{"type": "no_such_event"}"#).await;

    let records = read_jsonl(&log_path);
    let bad: Vec<_> = records
        .iter()
        .filter(|r| r["type"] == "bad_event")
        .collect();
    assert_eq!(bad.len(), 2);
    assert_eq!(bad[0]["line"], "{not json");
}

#[tokio::test]
async fn schedule_task_events_enqueue_chat_tasks() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let mut supervisor = test_supervisor(test_config(&scratch, "")).await;

    supervisor
        .dispatch_event(WorkerEvent::ScheduleTask {
            description: "check the backlog".into(),
        })
        .await;

    assert_eq!(supervisor.queue().pending_len(), 1);
    let task = supervisor
        .queue()
        .pending_iter()
        .next()
        .expect("scheduled task");
    assert_eq!(task.kind, TaskKind::Chat);
    assert_eq!(task.text, "check the backlog");
}

#[tokio::test]
async fn usage_events_accumulate_spend_and_persist_it() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let config = test_config(&scratch, "");
    let state_path = config.state_path();
    let mut supervisor = test_supervisor(config).await;

    for cost in [0.10, 0.15] {
        supervisor
            .dispatch_event(WorkerEvent::LlmUsage {
                usage: UsageReport {
                    cost_usd: cost,
                    ..UsageReport::default()
                },
                source: None,
            })
            .await;
    }

    assert!((supervisor.budget().spent_usd() - 0.25).abs() < 1e-9);
    let persisted: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(state_path).expect("read state"))
            .expect("parse state");
    let spent = persisted["spent_usd"].as_f64().expect("spent_usd field");
    assert!((spent - 0.25).abs() < 1e-9);
}

#[tokio::test]
async fn task_done_clears_the_running_entry() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let mut supervisor = test_supervisor(test_config(&scratch, "")).await;

    let task = Task::new(TaskKind::Chat, 7, "work");
    let task_id = task.id.clone();
    supervisor
        .queue_mut()
        .mark_running(task, 3)
        .expect("mark running");
    assert_eq!(supervisor.queue().running_len(), 1);

    supervisor
        .dispatch_event(WorkerEvent::TaskDone {
            task_id,
            worker_id: 3,
        })
        .await;
    assert_eq!(supervisor.queue().running_len(), 0);
}

#[tokio::test]
async fn disabling_evolution_purges_pending_cycles() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let config = test_config(&scratch, "[evolution]\nenabled = true\n");
    let state_path = config.state_path();
    let mut supervisor = test_supervisor(config).await;

    supervisor
        .enqueue_task(Task::new(TaskKind::Evolution, 0, "cycle"))
        .expect("enqueue evolution");
    supervisor
        .enqueue_task(Task::new(TaskKind::Chat, 1, "keep me"))
        .expect("enqueue chat");

    supervisor
        .dispatch_event(WorkerEvent::ToggleEvolution { enabled: false })
        .await;

    assert_eq!(supervisor.queue().pending_len(), 1);
    assert!(!supervisor.queue().has_kind(TaskKind::Evolution));
    let persisted: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(state_path).expect("read state"))
            .expect("parse state");
    assert_eq!(persisted["evolution_enabled"], false);
}

#[tokio::test]
async fn cancel_events_remove_pending_and_flag_running_tasks() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let mut supervisor = test_supervisor(test_config(&scratch, "")).await;

    let pending = Task::new(TaskKind::Chat, 1, "pending");
    let pending_id = pending.id.clone();
    supervisor.enqueue_task(pending).expect("enqueue");
    supervisor
        .dispatch_event(WorkerEvent::CancelTask {
            task_id: pending_id,
        })
        .await;
    assert_eq!(supervisor.queue().pending_len(), 0);

    let running = Task::new(TaskKind::Chat, 1, "running");
    let running_id = running.id.clone();
    supervisor
        .queue_mut()
        .mark_running(running, 0)
        .expect("mark running");
    supervisor
        .dispatch_event(WorkerEvent::CancelTask {
            task_id: running_id.clone(),
        })
        .await;
    let entry = supervisor
        .queue()
        .running_entry(&running_id)
        .expect("still running");
    assert!(entry.cancel_requested);
}

#[tokio::test]
async fn restart_requests_write_a_verification_record() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let config = test_config(&scratch, "");
    let verify_path = config
        .verify_dir()
        .join(moltd::restart::PENDING_VERIFY_FILE);
    let mut supervisor = test_supervisor(config).await;

    supervisor
        .dispatch_event(WorkerEvent::RestartRequest {
            reason: "self-update complete".into(),
        })
        .await;

    assert_eq!(
        supervisor.restart_requested(),
        Some("self-update complete")
    );
    assert!(verify_path.exists());
}

#[tokio::test]
async fn worker_boot_on_an_unexpected_revision_is_flagged() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let config = test_config(&scratch, "");
    let log_path = config.supervisor_log_path();

    // Seed persisted state with a known revision; the scratch repo_dir
    // is not a git checkout, so boot keeps the persisted value.
    let state_path = config.state_path();
    std::fs::create_dir_all(state_path.parent().expect("state parent"))
        .expect("create state dir");
    let seeded = SupervisorState {
        current_sha: "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef".into(),
        ..SupervisorState::default()
    };
    StateStore::new(&state_path).save(&seeded).expect("seed state");

    let mut supervisor = test_supervisor(config).await;
    supervisor
        .dispatch_event(WorkerEvent::WorkerBoot {
            worker_id: 0,
            pid: 4242,
            git_sha: "cafebabecafebabecafebabecafebabecafebabe".into(),
            git_branch: "molt".into(),
        })
        .await;

    let records = read_jsonl(&log_path);
    let verify = records
        .iter()
        .find(|r| r["type"] == "worker_sha_verify")
        .expect("verification record");
    assert_eq!(verify["ok"], false);
    assert_eq!(verify["observed_sha"], "cafebabecafebabecafebabecafebabecafebabe");
}

#[tokio::test]
async fn abandoned_snapshot_tasks_are_recovered_at_boot() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let config = test_config(&scratch, "");

    // A previous process left one pending and one running task behind.
    let mut prior = TaskQueue::new(config.snapshot_path());
    prior
        .enqueue(Task::new(TaskKind::Chat, 1, "still pending"), false)
        .expect("enqueue pending");
    let abandoned = Task::new(TaskKind::Chat, 1, "was running");
    let abandoned_id = abandoned.id.clone();
    prior.mark_running(abandoned, 0).expect("mark running");
    prior.persist("crash simulation").expect("persist snapshot");

    let supervisor = test_supervisor(config).await;
    assert_eq!(supervisor.queue().pending_len(), 2);
    assert_eq!(supervisor.queue().running_len(), 0);
    // The abandoned task comes back at the front on its second attempt.
    let first = supervisor
        .queue()
        .pending_iter()
        .next()
        .expect("front task");
    assert_eq!(first.id, abandoned_id);
    assert_eq!(first.attempt, 2);
}

#[tokio::test]
async fn an_exhausted_budget_drops_evolution_but_assigns_chat() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let config = test_config(
        &scratch,
        r#"
max_workers = 1
worker_command = ["cat"]

[telegram]
owner_chat_id = 99

[timeouts]
spawn_grace_seconds = 3600
worker_join_seconds = 1
boot_verify_seconds = 3600

[budget]
total_limit_usd = 100.0
"#,
    );
    let log_path = config.supervisor_log_path();
    let snapshot_path = config.snapshot_path();

    // Seed persisted spend at 96% of the limit, past the 95% cutoff.
    let state_path = config.state_path();
    std::fs::create_dir_all(state_path.parent().expect("state parent"))
        .expect("create state dir");
    let seeded = SupervisorState {
        spent_usd: 96.0,
        ..SupervisorState::default()
    };
    StateStore::new(&state_path).save(&seeded).expect("seed state");

    let transport = Arc::new(RecordingTransport::default());
    let mut supervisor = Supervisor::with_parts(
        config,
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::new(FallbackExecutor::new(0)),
    )
    .await
    .expect("build supervisor");

    let evolution = Task::new(TaskKind::Evolution, 0, "cycle");
    let evolution_id = evolution.id.clone();
    supervisor.enqueue_task(evolution).expect("enqueue evolution");
    let chat = Task::new(TaskKind::Chat, 5, "hello");
    let chat_id = chat.id.clone();
    supervisor.enqueue_task(chat).expect("enqueue chat");

    let _event_rx = supervisor.respawn_pool().await.expect("spawn pool");
    supervisor.tick().await;

    // The evolution cycle was shed; the interactive task went out.
    assert_eq!(supervisor.queue().pending_len(), 0);
    assert!(!supervisor.queue().has_kind(TaskKind::Evolution));
    assert!(supervisor.queue().running_entry(&chat_id).is_some());

    let records = read_jsonl(&log_path);
    let dropped = records
        .iter()
        .find(|r| r["type"] == "task_budget_dropped")
        .expect("budget drop record");
    assert_eq!(dropped["task_id"], evolution_id.as_str());

    // The drop persisted a snapshot and paged nobody.
    let snapshot: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(snapshot_path).expect("read snapshot"))
            .expect("parse snapshot");
    assert_eq!(snapshot["pending"].as_array().expect("pending array").len(), 0);
    assert!(transport.messages.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn a_crash_storm_tears_the_pool_down_into_degraded_mode() {
    let scratch = tempfile::tempdir().expect("tempdir");
    // Workers exit instantly; two whole-pool deaths within the window
    // cross the storm threshold.
    let config = test_config(
        &scratch,
        r#"
max_workers = 2
worker_command = ["false"]

[timeouts]
spawn_grace_seconds = 0
worker_join_seconds = 1
boot_verify_seconds = 3600

[health]
crash_window_seconds = 60
crash_storm_threshold = 2
"#,
    );
    let log_path = config.supervisor_log_path();
    let events_path = config.events_log_path();
    let mut supervisor = test_supervisor(config).await;

    // This task outlives the pool: once degraded mode is entered it is
    // executed directly through the fallback executor.
    supervisor
        .enqueue_task(Task::new(TaskKind::Chat, 11, "survive the storm"))
        .expect("enqueue");

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(4)).await;
        trigger.cancel();
    });
    let restart = supervisor.run(shutdown).await.expect("run to completion");
    assert_eq!(restart, None);

    let records = read_jsonl(&log_path);
    assert!(records.iter().any(|r| r["type"] == "worker_crash"));
    assert!(records.iter().any(|r| r["type"] == "crash_storm"));

    // Direct execution completed the task: fallback metrics landed in
    // the event log and nothing is left in the final snapshot.
    let events = read_jsonl(&events_path);
    assert!(events.iter().any(|r| r["type"] == "task_metrics"));
}
