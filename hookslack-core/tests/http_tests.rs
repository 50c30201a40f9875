// ABOUTME: Tests for the HTTP pipeline over the process hook - chunk reassembly, retries, rate limits
// ABOUTME: MockHost plays the host; process output is fed chunk by chunk

use hookslack_core::error::SlackError;
use hookslack_core::http::{send, HttpReply, HttpRequest, MAX_RETRY_AFTER_SECS};
use hookslack_task::testing::{HookCall, MockHost};
use hookslack_task::{Runtime, Task, PROCESS_RUNNING};

const URL: &str = "https://slack.test/api/auth.test";

fn spawn_send(rt: &Runtime, request: HttpRequest) -> Task<HttpReply> {
    let r = rt.clone();
    rt.spawn("http", async move { send(&r, &request).await })
}

#[test]
fn test_body_parsed_only_after_final_chunk() {
    let host = MockHost::new();
    let rt = host.runtime();
    let task = spawn_send(&rt, HttpRequest::new(URL));

    match host.last_process().unwrap() {
        HookCall::Process {
            command, options, ..
        } => {
            assert_eq!(command, format!("url:{URL}"));
            assert_eq!(options.get("header").map(String::as_str), Some("1"));
        }
        other => panic!("expected a process call, got {other:?}"),
    }

    host.feed_last_process(
        &rt,
        PROCESS_RUNNING,
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"ok\":",
        "",
    )
    .unwrap();
    host.feed_last_process(&rt, PROCESS_RUNNING, "true,\"team\":", "")
        .unwrap();
    assert!(!task.is_done());
    host.feed_last_process(&rt, 0, "\"acme\"}", "").unwrap();

    let reply = task.result().unwrap().unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "{\"ok\":true,\"team\":\"acme\"}");
    assert_eq!(reply.transport_retries, 0);
    assert_eq!(host.processes().len(), 1);
}

#[test]
fn test_plain_body_chunks_concatenated() {
    let host = MockHost::new();
    let rt = host.runtime();
    let task = spawn_send(&rt, HttpRequest::new(URL));

    host.feed_last_process(&rt, PROCESS_RUNNING, "HTTP/2 200\r\n\r\nBODY1", "")
        .unwrap();
    host.feed_last_process(&rt, PROCESS_RUNNING, "BODY2", "").unwrap();
    assert!(!task.is_done());
    host.feed_last_process(&rt, 0, "BODY3", "").unwrap();

    let reply = task.result().unwrap().unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "BODY1BODY2BODY3");
}

#[test]
fn test_rate_limit_sleeps_retry_after_without_spending_budget() {
    let host = MockHost::new();
    let rt = host.runtime();
    let task = spawn_send(&rt, HttpRequest::new(URL).max_retries(0));

    host.feed_last_process(
        &rt,
        0,
        "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 5\r\n\r\n",
        "",
    )
    .unwrap();

    match host.last_timer().unwrap() {
        HookCall::Timer {
            interval_ms,
            max_calls,
            ..
        } => {
            assert_eq!(interval_ms, 5000);
            assert_eq!(max_calls, 1);
        }
        other => panic!("expected a timer, got {other:?}"),
    }
    assert!(!task.is_done());

    host.fire_last_timer(&rt).unwrap();
    assert_eq!(host.processes().len(), 2, "same request re-issued");
    host.feed_last_process(&rt, 0, "HTTP/1.1 200 OK\r\n\r\n{}", "")
        .unwrap();

    let reply = task.result().unwrap().unwrap();
    assert_eq!(reply.rate_limit_waits, 1);
    assert_eq!(reply.transport_retries, 0);
}

#[test]
fn test_oversized_retry_after_is_capped() {
    let host = MockHost::new();
    let rt = host.runtime();
    let task = spawn_send(&rt, HttpRequest::new(URL));

    host.feed_last_process(
        &rt,
        0,
        "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 18446744073709552\r\n\r\n",
        "",
    )
    .unwrap();

    match host.last_timer().unwrap() {
        HookCall::Timer { interval_ms, .. } => {
            assert_eq!(interval_ms, MAX_RETRY_AFTER_SECS * 1000);
        }
        other => panic!("expected a timer, got {other:?}"),
    }
    assert!(!task.is_done());
}

#[test]
fn test_each_attempt_gets_its_own_token() {
    let host = MockHost::new();
    let rt = host.runtime();
    let task = spawn_send(
        &rt,
        HttpRequest::new(URL).max_retries(2).correlation_id("resp-1"),
    );

    host.feed_last_process(&rt, 6, "", "could not resolve host")
        .unwrap();
    host.fire_last_timer(&rt).unwrap();
    host.feed_last_process(&rt, 0, "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 1\r\n\r\n", "")
        .unwrap();
    host.fire_last_timer(&rt).unwrap();
    host.feed_last_process(&rt, 0, "HTTP/1.1 200 OK\r\n\r\n{}", "")
        .unwrap();

    let tokens: Vec<String> = host
        .processes()
        .into_iter()
        .filter_map(|call| match call {
            HookCall::Process { token, .. } => Some(token),
            _ => None,
        })
        .collect();
    assert_eq!(tokens, vec!["resp-1", "resp-1:1", "resp-1:2"]);
    assert!(task.result().unwrap().is_ok());
}

#[test]
fn test_transport_failure_retried_with_fixed_backoff() {
    let host = MockHost::new();
    let rt = host.runtime();
    let task = spawn_send(&rt, HttpRequest::new(URL).max_retries(2).retry_backoff_ms(250));

    host.feed_last_process(&rt, 6, "", "Could not resolve host")
        .unwrap();
    match host.last_timer().unwrap() {
        HookCall::Timer { interval_ms, .. } => assert_eq!(interval_ms, 250),
        other => panic!("expected a timer, got {other:?}"),
    }
    host.fire_last_timer(&rt).unwrap();
    host.feed_last_process(&rt, 0, "HTTP/1.1 200 OK\r\n\r\n{}", "")
        .unwrap();

    let reply = task.result().unwrap().unwrap();
    assert_eq!(reply.transport_retries, 1);
    assert_eq!(host.processes().len(), 2);
}

#[test]
fn test_exhausted_transport_retries_raise_typed_error() {
    let host = MockHost::new();
    let rt = host.runtime();
    let task = spawn_send(&rt, HttpRequest::new(URL).max_retries(1));

    host.feed_last_process(&rt, 7, "", "connection refused").unwrap();
    host.fire_last_timer(&rt).unwrap();
    host.feed_last_process(&rt, 7, "", "connection refused").unwrap();

    let error = task.result().unwrap().unwrap_err();
    match error.downcast_ref::<SlackError>() {
        Some(SlackError::Transport {
            url,
            return_code,
            error,
        }) => {
            assert_eq!(url, URL);
            assert_eq!(*return_code, 7);
            assert_eq!(error, "connection refused");
        }
        other => panic!("expected a transport error, got {other:?}"),
    }
}

#[test]
fn test_client_error_status_not_retried() {
    let host = MockHost::new();
    let rt = host.runtime();
    let task = spawn_send(&rt, HttpRequest::new(URL));

    host.feed_last_process(&rt, 0, "HTTP/1.1 400 Bad Request\r\n\r\ninvalid_form_data", "")
        .unwrap();

    assert!(host.timers().is_empty());
    assert_eq!(host.processes().len(), 1);
    let error = task.result().unwrap().unwrap_err();
    match error.downcast_ref::<SlackError>() {
        Some(SlackError::HttpStatus { status, body, .. }) => {
            assert_eq!(*status, 400);
            assert_eq!(body, "invalid_form_data");
        }
        other => panic!("expected an HTTP status error, got {other:?}"),
    }
}

#[test]
fn test_rate_limit_without_retry_after_is_rejection() {
    let host = MockHost::new();
    let rt = host.runtime();
    let task = spawn_send(&rt, HttpRequest::new(URL));

    host.feed_last_process(&rt, 0, "HTTP/1.1 429 Too Many Requests\r\n\r\n", "")
        .unwrap();

    let error = task.result().unwrap().unwrap_err();
    let slack = error.downcast_ref::<SlackError>().unwrap();
    assert!(slack.is_rejection());
}

#[test]
fn test_backpressure_delays_process_hook() {
    let host = MockHost::new();
    host.set_available_fds(2);
    let rt = host.runtime();
    let task = spawn_send(&rt, HttpRequest::new(URL));

    assert!(host.processes().is_empty());
    assert_eq!(host.timers().len(), 1);

    host.set_available_fds(100);
    host.fire_last_timer(&rt).unwrap();
    assert_eq!(host.processes().len(), 1);
    host.feed_last_process(&rt, 0, "HTTP/1.1 200 OK\r\n\r\n{}", "")
        .unwrap();
    assert!(task.result().unwrap().is_ok());
}
