// ABOUTME: Tests for streaming ingestion - frame draining, liveness, lost connections, replies
// ABOUTME: A scripted FrameSource stands in for the non-blocking websocket

use hookslack_core::config::RouterConfig;
use hookslack_core::{
    DispatchOutcome, EventRouter, Frame, FrameError, FrameSource, RtmConnection, Team,
};
use hookslack_task::testing::{HookCall, MockHost};
use hookslack_task::{HookEvent, Runtime};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

const FD: i32 = 42;

#[derive(Default)]
struct Script {
    frames: VecDeque<Result<Frame, FrameError>>,
    sent: Vec<String>,
    pings: usize,
    write_failure: Option<String>,
}

struct ScriptedSource(Rc<RefCell<Script>>);

impl FrameSource for ScriptedSource {
    fn read_frame(&mut self) -> Result<Frame, FrameError> {
        self.0
            .borrow_mut()
            .frames
            .pop_front()
            .unwrap_or(Err(FrameError::WouldBlock))
    }

    fn send_text(&mut self, text: &str) -> Result<(), FrameError> {
        let mut script = self.0.borrow_mut();
        if let Some(reason) = script.write_failure.clone() {
            return Err(FrameError::Transport(reason));
        }
        script.sent.push(text.to_string());
        Ok(())
    }

    fn send_ping(&mut self) -> Result<(), FrameError> {
        self.0.borrow_mut().pings += 1;
        Ok(())
    }

    fn raw_fd(&self) -> i32 {
        FD
    }
}

struct Fixture {
    host: Rc<MockHost>,
    rt: Runtime,
    router: EventRouter,
    team: Rc<RefCell<Team>>,
    script: Rc<RefCell<Script>>,
    lost: Rc<RefCell<Vec<String>>>,
    connection: RtmConnection,
}

fn attach() -> Fixture {
    let host = MockHost::new();
    let rt = host.runtime();
    let router = EventRouter::new(rt.clone(), RouterConfig::default());
    let team = router.register_team(Team::new("T1", "acme"));
    let script = Rc::new(RefCell::new(Script::default()));
    let lost: Rc<RefCell<Vec<String>>> = Rc::default();
    let sink = lost.clone();
    let connection = RtmConnection::attach(
        &router,
        team.clone(),
        Box::new(ScriptedSource(script.clone())),
        move |team_id| sink.borrow_mut().push(team_id.to_string()),
    );
    Fixture {
        host,
        rt,
        router,
        team,
        script,
        lost,
        connection,
    }
}

impl Fixture {
    fn push(&self, frame: Result<Frame, FrameError>) {
        self.script.borrow_mut().frames.push_back(frame);
    }

    fn readable(&self) {
        self.rt
            .dispatch(self.connection.token(), HookEvent::Fd { fd: FD });
    }
}

#[test]
fn test_attach_hooks_readability() {
    let fixture = attach();
    assert!(fixture.team.borrow().is_connected());
    match fixture.host.calls().last() {
        Some(HookCall::Fd {
            fd, read, token, ..
        }) => {
            assert_eq!(*fd, FD);
            assert!(*read);
            assert_eq!(token, fixture.connection.token());
        }
        other => panic!("expected an fd hook, got {other:?}"),
    }
}

#[test]
fn test_drains_every_available_frame() {
    let fixture = attach();
    fixture.push(Ok(Frame::Text(r#"{"type":"message","text":"one"}"#.to_string())));
    fixture.push(Ok(Frame::Pong(Vec::new())));
    fixture.push(Ok(Frame::Ping(Vec::new())));
    fixture.push(Ok(Frame::Text("[1, 2]".to_string())));
    fixture.push(Ok(Frame::Text("{not json".to_string())));
    fixture.push(Ok(Frame::Binary(br#"{"type":"user_typing"}"#.to_vec())));

    fixture.readable();

    assert_eq!(fixture.router.queue_len(), 2);
    assert_eq!(fixture.team.borrow().last_pong(), Some(fixture.rt.now()));
    assert!(!fixture.connection.is_closed());

    assert_eq!(
        fixture.router.handle_next(),
        DispatchOutcome::Unknown("message".to_string())
    );
    assert_eq!(
        fixture.router.handle_next(),
        DispatchOutcome::Unknown("user_typing".to_string())
    );
}

#[test]
fn test_routed_envelopes_carry_the_team() {
    let fixture = attach();
    let teams: Rc<RefCell<Vec<Option<String>>>> = Rc::default();
    let sink = teams.clone();
    fixture.router.register_handler("message", move |envelope, _, context| {
        sink.borrow_mut().push(envelope.team.clone());
        assert!(context.team.is_some());
        Ok(())
    });

    fixture.push(Ok(Frame::Text(r#"{"type":"message"}"#.to_string())));
    fixture.readable();
    fixture.router.handle_next();

    assert_eq!(*teams.borrow(), vec![Some("T1".to_string())]);
}

#[test]
fn test_transport_error_reports_lost_connection_once() {
    let fixture = attach();
    fixture.push(Ok(Frame::Text(r#"{"type":"message"}"#.to_string())));
    fixture.push(Err(FrameError::Transport("reset by peer".to_string())));
    fixture.push(Ok(Frame::Text(r#"{"type":"late"}"#.to_string())));

    fixture.readable();

    assert_eq!(*fixture.lost.borrow(), vec!["T1".to_string()]);
    assert!(fixture.connection.is_closed());
    assert!(!fixture.team.borrow().is_connected());
    assert_eq!(fixture.router.queue_len(), 1, "frames after the error are not read");
    assert!(matches!(
        fixture.host.calls().last(),
        Some(HookCall::Unhook { .. })
    ));

    // The callback is gone, so another readiness signal changes nothing
    fixture.readable();
    assert_eq!(fixture.lost.borrow().len(), 1);
}

#[test]
fn test_close_frame_marks_connection_lost() {
    let fixture = attach();
    fixture.push(Ok(Frame::Close));
    fixture.readable();
    assert_eq!(fixture.lost.borrow().len(), 1);
    assert!(fixture.router.disconnected_teams().contains(&"T1".to_string()));
}

#[test]
fn test_send_resolves_with_streamed_reply() {
    let fixture = attach();
    let reply = fixture.connection.send(json!({"type": "message", "text": "hi"})).unwrap();

    let sent: Value = serde_json::from_str(&fixture.script.borrow().sent[0]).unwrap();
    assert_eq!(sent["id"], 1);
    assert_eq!(sent["text"], "hi");

    let task = fixture.rt.spawn("await-reply", async move { Ok(reply.await?) });
    assert!(!task.is_done());

    fixture.push(Ok(Frame::Text(r#"{"ok":true,"reply_to":1,"ts":"1.5"}"#.to_string())));
    fixture.readable();
    fixture.router.handle_next();

    match task.result().unwrap().unwrap() {
        HookEvent::Value(payload) => assert_eq!(payload["ts"], "1.5"),
        other => panic!("expected a reply payload, got {other:?}"),
    }
}

#[test]
fn test_send_rejects_non_objects_and_closed_connections() {
    let fixture = attach();
    assert!(fixture.connection.send(json!("plain")).is_err());

    fixture.connection.close();
    assert!(fixture.connection.send(json!({"type": "message"})).is_err());
    assert!(fixture.lost.borrow().is_empty(), "close is not a loss");
}

#[test]
fn test_failed_write_leaves_no_pending_reply() {
    let fixture = attach();
    fixture.script.borrow_mut().write_failure = Some("broken pipe".to_string());

    assert!(fixture.connection.send(json!({"type": "message"})).is_err());

    let key = fixture.team.borrow().reply_key(1);
    assert!(!fixture.rt.store().is_outstanding(&key));
    assert!(fixture.team.borrow_mut().take_sent(1).is_none());
}

#[test]
fn test_ping_and_staleness() {
    let fixture = attach();
    let timeout = chrono::Duration::seconds(30);
    fixture.connection.ping().unwrap();
    assert_eq!(fixture.script.borrow().pings, 1);
    assert!(!fixture.connection.is_stale(fixture.rt.now(), timeout));

    fixture.push(Ok(Frame::Pong(Vec::new())));
    fixture.readable();
    fixture.host.advance(chrono::Duration::seconds(10));
    assert!(!fixture.connection.is_stale(fixture.rt.now(), timeout));

    fixture.host.advance(chrono::Duration::seconds(21));
    assert!(fixture.connection.is_stale(fixture.rt.now(), timeout));
}
