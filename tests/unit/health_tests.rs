//! Unit tests for pure health policy: crash-storm accounting and
//! heartbeat-staleness timeout classification.

use std::time::Duration;

use chrono::Utc;
use moltd::models::{RunningEntry, Task, TaskKind};
use moltd::pool::{classify_timeout, CrashWindow, StormVerdict, TimeoutAction};

fn window() -> CrashWindow {
    CrashWindow::new(Duration::from_secs(60), 3)
}

// ── Crash window ──────────────────────────────────────────────────────

#[test]
fn busy_crashes_feed_the_window() {
    let mut w = window();
    assert_eq!(w.record_sweep(1, 1, 4), StormVerdict::Calm);
    assert_eq!(w.count(), 1);
}

#[test]
fn idle_death_with_a_survivor_clears_the_window() {
    let mut w = window();
    w.record_sweep(1, 1, 4);
    w.record_sweep(1, 1, 4);
    assert_eq!(w.count(), 2);

    // One idle worker died but others are alive: benign capacity loss.
    assert_eq!(w.record_sweep(1, 0, 3), StormVerdict::Calm);
    assert_eq!(w.count(), 0);
}

#[test]
fn whole_pool_death_qualifies_even_when_idle() {
    let mut w = window();
    assert_eq!(w.record_sweep(5, 0, 0), StormVerdict::Storm);
    assert!(w.count() >= 3);
}

#[test]
fn third_qualifying_crash_declares_a_storm() {
    let mut w = window();
    assert_eq!(w.record_sweep(1, 1, 4), StormVerdict::Calm);
    assert_eq!(w.record_sweep(1, 1, 4), StormVerdict::Calm);
    assert_eq!(w.record_sweep(1, 1, 4), StormVerdict::Storm);
}

#[test]
fn sweep_without_deaths_never_clears() {
    let mut w = window();
    w.record_sweep(1, 1, 4);
    assert_eq!(w.record_sweep(0, 0, 5), StormVerdict::Calm);
    assert_eq!(w.count(), 1);
}

#[test]
fn old_crashes_age_out_of_the_window() {
    let mut w = CrashWindow::new(Duration::from_millis(50), 3);
    w.record_sweep(1, 1, 4);
    w.record_sweep(1, 1, 4);
    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(w.record_sweep(1, 1, 4), StormVerdict::Calm);
    assert_eq!(w.count(), 1);
}

#[test]
fn clear_resets_the_window() {
    let mut w = window();
    w.record_sweep(2, 2, 2);
    w.clear();
    assert_eq!(w.count(), 0);
}

// ── Timeout classification ────────────────────────────────────────────

fn entry_stale_for(secs: i64) -> RunningEntry {
    let now = Utc::now();
    let mut entry = RunningEntry::assigned(Task::new(TaskKind::Chat, 1, "hi"), 0, now);
    entry.last_heartbeat_at = now - chrono::Duration::seconds(secs);
    entry
}

const SOFT: Duration = Duration::from_secs(600);
const HARD: Duration = Duration::from_secs(1800);

#[test]
fn fresh_heartbeat_needs_no_action() {
    let entry = entry_stale_for(10);
    assert_eq!(
        classify_timeout(&entry, Utc::now(), SOFT, HARD),
        TimeoutAction::None
    );
}

#[test]
fn soft_threshold_warns_once() {
    let entry = entry_stale_for(700);
    assert_eq!(
        classify_timeout(&entry, Utc::now(), SOFT, HARD),
        TimeoutAction::SoftWarn
    );
}

#[test]
fn soft_warning_is_not_repeated() {
    let mut entry = entry_stale_for(700);
    entry.soft_warned = true;
    assert_eq!(
        classify_timeout(&entry, Utc::now(), SOFT, HARD),
        TimeoutAction::None
    );
}

#[test]
fn hard_threshold_requeues_even_after_a_warning() {
    let mut entry = entry_stale_for(2000);
    entry.soft_warned = true;
    assert_eq!(
        classify_timeout(&entry, Utc::now(), SOFT, HARD),
        TimeoutAction::HardRequeue
    );
}

#[test]
fn staleness_is_measured_from_the_last_heartbeat() {
    // Started long ago but heartbeating: no action.
    let now = Utc::now();
    let mut entry = RunningEntry::assigned(Task::new(TaskKind::Chat, 1, "hi"), 0, now);
    entry.started_at = now - chrono::Duration::seconds(10_000);
    entry.last_heartbeat_at = now - chrono::Duration::seconds(5);
    assert_eq!(
        classify_timeout(&entry, now, SOFT, HARD),
        TimeoutAction::None
    );
}
