//! Unit tests for the worker event vocabulary: wire format, defaults,
//! and rejection of unknown tags.

use moltd::events::parse_event_line;
use moltd::models::WorkerEvent;

#[test]
fn llm_usage_parses_with_defaults() {
    let line = r#"{"type":"llm_usage","usage":{"cost_usd":0.42}}"#;
    let event = parse_event_line(line).expect("parse");
    match event {
        WorkerEvent::LlmUsage { usage, source } => {
            assert!((usage.cost_usd - 0.42).abs() < 1e-9);
            assert_eq!(usage.prompt_tokens, 0);
            assert!(source.is_none());
        }
        other => panic!("wrong variant: {other:?}"),
    }
}

#[test]
fn heartbeat_phase_is_optional() {
    let line = r#"{"type":"task_heartbeat","task_id":"abc12345"}"#;
    match parse_event_line(line).expect("parse") {
        WorkerEvent::TaskHeartbeat { task_id, phase } => {
            assert_eq!(task_id, "abc12345");
            assert!(phase.is_none());
        }
        other => panic!("wrong variant: {other:?}"),
    }
}

#[test]
fn send_message_defaults_progress_to_false() {
    let line = r#"{"type":"send_message","chat_id":7,"text":"hi"}"#;
    match parse_event_line(line).expect("parse") {
        WorkerEvent::SendMessage {
            chat_id,
            text,
            is_progress,
            ..
        } => {
            assert_eq!(chat_id, 7);
            assert_eq!(text, "hi");
            assert!(!is_progress);
        }
        other => panic!("wrong variant: {other:?}"),
    }
}

#[test]
fn worker_boot_carries_identity() {
    let line = r#"{"type":"worker_boot","worker_id":2,"pid":4242,"git_sha":"cafebabe","git_branch":"molt"}"#;
    match parse_event_line(line).expect("parse") {
        WorkerEvent::WorkerBoot {
            worker_id,
            pid,
            git_sha,
            git_branch,
        } => {
            assert_eq!(worker_id, 2);
            assert_eq!(pid, 4242);
            assert_eq!(git_sha, "cafebabe");
            assert_eq!(git_branch, "molt");
        }
        other => panic!("wrong variant: {other:?}"),
    }
}

#[test]
fn unknown_tag_is_an_error() {
    let err = parse_event_line(r#"{"type":"launch_missiles"}"#).expect_err("must reject");
    assert!(err.to_string().contains("bad event line"));
}

#[test]
fn malformed_json_is_an_error() {
    assert!(parse_event_line("{not json").is_err());
}

#[test]
fn serialized_tag_matches_the_tag_method() {
    let events = [
        WorkerEvent::TaskDone {
            task_id: "t".into(),
            worker_id: 0,
        },
        WorkerEvent::RestartRequest {
            reason: "upgrade".into(),
        },
        WorkerEvent::ToggleEvolution { enabled: true },
        WorkerEvent::ToggleConsciousness {
            action: "status".into(),
        },
    ];
    for event in events {
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], event.tag());
    }
}

#[test]
fn events_survive_a_wire_round_trip() {
    let original = WorkerEvent::ScheduleTask {
        description: "follow up tomorrow".into(),
    };
    let line = serde_json::to_string(&original).expect("serialize");
    assert_eq!(parse_event_line(&line).expect("parse"), original);
}
