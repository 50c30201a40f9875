// ABOUTME: Tests for recording replay through the default handlers
// ABOUTME: Recordings are written with the real recorder into a temp directory

use chrono::Duration;
use hookslack::config::Config;
use hookslack::replay::{replay_dir, ReplaySummary};
use hookslack::{build_router, handlers};
use hookslack_core::{Envelope, EventRouter, OutboundRequest, Params, Recorder};
use hookslack_task::testing::MockHost;
use serde_json::json;

fn record_session(dir: &std::path::Path, router: &EventRouter) {
    let recorder = Recorder::new(dir);
    let start = router.runtime().now();
    let at = |seconds: i64| start + Duration::seconds(seconds);

    let events = vec![
        Envelope::from_stream("T1", json!({"type": "hello"}), at(0)),
        Envelope::from_stream(
            "T1",
            json!({"type": "team_join", "user": {"id": "U1", "name": "ada"}}),
            at(1),
        ),
        Envelope::from_stream(
            "T1",
            json!({"type": "message", "user": "U1", "channel": "C1", "text": "hi"}),
            at(2),
        ),
        Envelope::from_stream("T1", json!({"type": "mystery"}), at(3)),
        Envelope::from_http(
            &OutboundRequest::new("T1", "conversations.list", Params::new(), at(4)),
            json!({"ok": true, "channels": [{"id": "C1", "name": "general"}]}),
            at(4),
        ),
    ];
    for envelope in &events {
        recorder.record(envelope).unwrap();
    }
}

#[test]
fn test_replay_routes_recording_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let host = MockHost::new();
    let router = EventRouter::new(host.runtime(), Default::default());
    handlers::register_default_handlers(&router);
    record_session(dir.path(), &router);

    let summary = replay_dir(&router, dir.path()).unwrap();

    assert_eq!(
        summary,
        ReplaySummary {
            events: 5,
            dispatched: 3,
            unknown: 1,
            ignored: 1,
            failed: 0,
        }
    );
    let team = router.team("T1").unwrap();
    let team = team.borrow();
    assert_eq!(team.user("U1").unwrap()["name"], "ada");
    assert_eq!(team.channel("C1").unwrap()["name"], "general");
}

#[test]
fn test_build_router_registers_configured_workspaces() {
    let mut config = Config::from_toml_str(
        r#"
[workspaces.acme]
api_token = "xoxp-acme"

[workspaces.nokey]
"#,
    )
    .unwrap();
    config.recorder.enabled = false;

    let host = MockHost::new();
    let router = build_router(host.runtime(), &config);

    assert!(router.team("acme").unwrap().borrow().api().is_some());
    assert!(router.team("nokey").is_none());
    assert!(router.has_handler("message"));
    assert!(!router.is_recording());
}

#[test]
fn test_build_router_records_when_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.recorder.enabled = true;
    config.recorder.dir = dir.path().to_string_lossy().into_owned();

    let host = MockHost::new();
    let router = build_router(host.runtime(), &config);
    let now = router.runtime().now();
    router.receive(Envelope::from_stream("T1", json!({"type": "message"}), now));

    let recorded = std::fs::read_dir(dir.path().join("websocket")).unwrap().count();
    assert_eq!(recorded, 1);
}
