//! Unit tests for `TaskQueue`: ordering, cancellation, the crash
//! retry/drop rule, and snapshot recovery.

use moltd::models::{Task, TaskKind};
use moltd::queue::{CancelOutcome, Requeue, TaskQueue};

fn scratch_queue() -> (tempfile::TempDir, TaskQueue) {
    let temp = tempfile::tempdir().expect("tempdir");
    let queue = TaskQueue::new(temp.path().join("queue_snapshot.json"));
    (temp, queue)
}

fn chat(text: &str) -> Task {
    Task::new(TaskKind::Chat, 77, text)
}

// ── Ordering ──────────────────────────────────────────────────────────

#[test]
fn enqueue_assigns_strictly_increasing_seq() {
    let (_temp, mut queue) = scratch_queue();
    queue.enqueue(chat("a"), false).expect("enqueue a");
    queue.enqueue(chat("b"), false).expect("enqueue b");

    let first = queue.dequeue().expect("first");
    let second = queue.dequeue().expect("second");
    assert!(second.enqueue_seq > first.enqueue_seq);
    assert_eq!(first.text, "a");
    assert_eq!(second.text, "b");
}

#[test]
fn front_enqueue_jumps_the_line() {
    let (_temp, mut queue) = scratch_queue();
    queue.enqueue(chat("old"), false).expect("enqueue");
    queue.enqueue(chat("urgent"), true).expect("front enqueue");

    assert_eq!(queue.dequeue().expect("head").text, "urgent");
    assert_eq!(queue.dequeue().expect("tail").text, "old");
}

#[test]
fn push_front_unassigned_keeps_seq() {
    let (_temp, mut queue) = scratch_queue();
    queue.enqueue(chat("a"), false).expect("enqueue");
    let task = queue.dequeue().expect("dequeue");
    let seq = task.enqueue_seq;

    queue.push_front_unassigned(task);
    assert_eq!(queue.dequeue().expect("again").enqueue_seq, seq);
}

// ── Running table ─────────────────────────────────────────────────────

#[test]
fn mark_running_rejects_duplicate_task_ids() {
    let (_temp, mut queue) = scratch_queue();
    let task = chat("once");
    queue.mark_running(task.clone(), 0).expect("first mark");

    let err = queue.mark_running(task, 1).expect_err("duplicate must fail");
    assert!(err.to_string().contains("already"));
}

#[test]
fn complete_clears_the_running_entry() {
    let (_temp, mut queue) = scratch_queue();
    let task = chat("done-soon");
    let id = task.id.clone();
    queue.mark_running(task, 2).expect("mark");

    let entry = queue.complete(&id).expect("complete").expect("entry present");
    assert_eq!(entry.worker_id, 2);
    assert_eq!(queue.running_len(), 0);
}

// ── Cancellation ──────────────────────────────────────────────────────

#[test]
fn cancel_pending_removes_the_task() {
    let (_temp, mut queue) = scratch_queue();
    let task = chat("doomed");
    let id = task.id.clone();
    queue.enqueue(task, false).expect("enqueue");

    assert_eq!(
        queue.cancel(&id).expect("cancel"),
        CancelOutcome::RemovedPending
    );
    assert_eq!(queue.pending_len(), 0);
}

#[test]
fn cancel_running_only_sets_the_cooperative_flag() {
    let (_temp, mut queue) = scratch_queue();
    let task = chat("busy");
    let id = task.id.clone();
    queue.mark_running(task, 0).expect("mark");

    assert_eq!(
        queue.cancel(&id).expect("cancel"),
        CancelOutcome::SignaledRunning
    );
    let entry = queue.running_entry(&id).expect("still running");
    assert!(entry.cancel_requested);
    assert_eq!(queue.running_len(), 1);
}

#[test]
fn cancel_unknown_reports_not_found() {
    let (_temp, mut queue) = scratch_queue();
    assert_eq!(
        queue.cancel("nope").expect("cancel"),
        CancelOutcome::NotFound
    );
}

// ── Retry/drop rule ───────────────────────────────────────────────────

#[test]
fn crashed_task_gets_exactly_one_retry() {
    let (_temp, mut queue) = scratch_queue();
    let task = chat("flaky");

    let retried = match queue.requeue_crashed(task).expect("first requeue") {
        Requeue::Retried(task) => task,
        Requeue::Dropped(_) => panic!("first crash must retry"),
    };
    assert_eq!(retried.attempt, 2);
    assert_eq!(queue.pending_len(), 1);

    let again = queue.dequeue().expect("retry attempt");
    match queue.requeue_crashed(again).expect("second requeue") {
        Requeue::Dropped(dropped) => assert_eq!(dropped.attempt, 3),
        Requeue::Retried(_) => panic!("second crash must drop"),
    }
    assert_eq!(queue.pending_len(), 0);
}

#[test]
fn purge_drops_only_the_matching_kind() {
    let (_temp, mut queue) = scratch_queue();
    queue.enqueue(chat("keep"), false).expect("enqueue chat");
    queue
        .enqueue(Task::new(TaskKind::Evolution, 0, "cycle"), false)
        .expect("enqueue evolution");

    let removed = queue
        .purge_pending_kind(TaskKind::Evolution)
        .expect("purge");
    assert_eq!(removed, 1);
    assert_eq!(queue.pending_len(), 1);
    assert_eq!(queue.dequeue().expect("survivor").kind, TaskKind::Chat);
}

// ── Snapshot recovery ─────────────────────────────────────────────────

#[test]
fn recovery_restores_pending_and_requeues_running() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("queue_snapshot.json");

    let mut queue = TaskQueue::new(&path);
    queue.enqueue(chat("waiting"), false).expect("enqueue");
    let running = chat("in-flight");
    let running_id = running.id.clone();
    queue.mark_running(running, 1).expect("mark");

    let mut recovered = TaskQueue::new(&path);
    let dropped = recovered.recover_from_snapshot().expect("recover");
    assert!(dropped.is_empty());
    assert_eq!(recovered.running_len(), 0);
    assert_eq!(recovered.pending_len(), 2);

    // The abandoned running task re-enters first, with a consumed retry.
    let head = recovered.dequeue().expect("head");
    assert_eq!(head.id, running_id);
    assert_eq!(head.attempt, 2);
    assert_eq!(recovered.dequeue().expect("tail").text, "waiting");
}

#[test]
fn recovery_keeps_earlier_started_work_first() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("queue_snapshot.json");

    let mut queue = TaskQueue::new(&path);
    let first = chat("started-first");
    let first_id = first.id.clone();
    queue.mark_running(first, 0).expect("mark first");
    std::thread::sleep(std::time::Duration::from_millis(5));
    queue.mark_running(chat("started-second"), 1).expect("mark second");

    let mut recovered = TaskQueue::new(&path);
    recovered.recover_from_snapshot().expect("recover");
    assert_eq!(recovered.dequeue().expect("head").id, first_id);
}

#[test]
fn recovery_drops_tasks_out_of_retries() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("queue_snapshot.json");

    let mut queue = TaskQueue::new(&path);
    let mut exhausted = chat("no-more-retries");
    exhausted.attempt = 2;
    let exhausted_id = exhausted.id.clone();
    queue.mark_running(exhausted, 0).expect("mark");

    let mut recovered = TaskQueue::new(&path);
    let dropped = recovered.recover_from_snapshot().expect("recover");
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].id, exhausted_id);
    assert_eq!(recovered.pending_len(), 0);
}

#[test]
fn recovery_without_a_snapshot_is_a_no_op() {
    let (_temp, mut queue) = scratch_queue();
    let dropped = queue.recover_from_snapshot().expect("recover");
    assert!(dropped.is_empty());
    assert_eq!(queue.pending_len(), 0);
}
