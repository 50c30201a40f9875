// ABOUTME: Tests for the tokio-backed host - timers, subprocesses, fd readiness, and unhook
// ABOUTME: Each test runs on a current-thread runtime inside a LocalSet

use hookslack::tokio_host::{TokioHost, DEFAULT_FD_BUDGET, PROCESS_ERROR};
use hookslack_core::process::{run_process, Admission};
use hookslack_task::{HookEvent, Host, Runtime};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::LocalSet;

const DEADLINE: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "current_thread")]
async fn test_sleep_resumes_through_tokio_timer() {
    LocalSet::new()
        .run_until(async {
            let (host, mut events) = TokioHost::new(DEFAULT_FD_BUDGET);
            let runtime = Runtime::new(host);
            let r = runtime.clone();
            let task = runtime.spawn("sleep", async move {
                r.sleep(5).await?;
                Ok(42u8)
            });

            tokio::time::timeout(DEADLINE, events.drive_until(&runtime, || task.is_done()))
                .await
                .unwrap();
            assert_eq!(task.result().unwrap().unwrap(), 42);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_repeating_timer_counts_down() {
    LocalSet::new()
        .run_until(async {
            let (host, mut events) = TokioHost::new(DEFAULT_FD_BUDGET);
            let runtime = Runtime::new(host.clone());
            let remaining = Rc::new(RefCell::new(Vec::new()));
            let sink = remaining.clone();
            runtime.register_callback("tick", move |event| {
                if let HookEvent::Timer { remaining_calls } = event {
                    sink.borrow_mut().push(remaining_calls);
                }
            });
            host.hook_timer(2, 3, "tick");

            let done = remaining.clone();
            tokio::time::timeout(
                DEADLINE,
                events.drive_until(&runtime, || done.borrow().len() == 3),
            )
            .await
            .unwrap();
            assert_eq!(*remaining.borrow(), vec![2, 1, 0]);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_unhooked_timer_stops_firing() {
    LocalSet::new()
        .run_until(async {
            let (host, mut events) = TokioHost::new(DEFAULT_FD_BUDGET);
            let handle = host.hook_timer(1, 0, "forever");
            host.hook_timer(30, 1, "later");

            // Removed before the hook task ever ran, so nothing arrives from it
            host.unhook(handle);

            let (token, _) = tokio::time::timeout(DEADLINE, events.next())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(token, "later");
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_shell_process_output_and_exit_code() {
    LocalSet::new()
        .run_until(async {
            let (host, mut events) = TokioHost::new(DEFAULT_FD_BUDGET);
            let runtime = Runtime::new(host);
            let r = runtime.clone();
            let task = runtime.spawn("process", async move {
                let ok = run_process(
                    &r,
                    "printf hello; printf oops >&2",
                    &HashMap::new(),
                    5_000,
                    Admission::default(),
                    None,
                )
                .await?;
                let failed = run_process(
                    &r,
                    "exit 3",
                    &HashMap::new(),
                    5_000,
                    Admission::default(),
                    None,
                )
                .await?;
                Ok((ok, failed))
            });

            tokio::time::timeout(DEADLINE, events.drive_until(&runtime, || task.is_done()))
                .await
                .unwrap();
            let (ok, failed) = task.result().unwrap().unwrap();
            assert_eq!(ok.return_code, 0);
            assert_eq!(ok.out, "hello");
            assert_eq!(ok.err, "oops");
            assert_eq!(failed.return_code, 3);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_process_timeout_reports_error_code() {
    LocalSet::new()
        .run_until(async {
            let (host, mut events) = TokioHost::new(DEFAULT_FD_BUDGET);
            let runtime = Runtime::new(host.clone());
            let r = runtime.clone();
            let task = runtime.spawn("slow", async move {
                Ok(run_process(&r, "sleep 5", &HashMap::new(), 50, Admission::default(), None)
                    .await?)
            });
            assert_eq!(host.running_processes(), 1);
            assert_eq!(host.available_file_descriptors(), DEFAULT_FD_BUDGET - 3);

            tokio::time::timeout(DEADLINE, events.drive_until(&runtime, || task.is_done()))
                .await
                .unwrap();
            let output = task.result().unwrap().unwrap();
            assert_eq!(output.return_code, PROCESS_ERROR);
            assert!(output.err.contains("timed out"));
            assert_eq!(host.running_processes(), 0);
        })
        .await;
}

#[cfg(unix)]
#[tokio::test(flavor = "current_thread")]
async fn test_fd_readiness_delivered_until_unhooked() {
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    LocalSet::new()
        .run_until(async {
            let (mut writer, reader) = UnixStream::pair().unwrap();
            reader.set_nonblocking(true).unwrap();
            let fd = reader.as_raw_fd();

            let (host, mut events) = TokioHost::new(DEFAULT_FD_BUDGET);
            let runtime = Runtime::new(host.clone());
            let received = Rc::new(RefCell::new(Vec::new()));
            let sink = received.clone();
            let reader = RefCell::new(reader);
            runtime.register_callback("socket", move |_| {
                let mut buffer = [0u8; 64];
                // Drain until would-block
                while let Ok(n) = reader.borrow_mut().read(&mut buffer) {
                    if n == 0 {
                        break;
                    }
                    sink.borrow_mut().extend_from_slice(&buffer[..n]);
                }
            });
            let handle = host.hook_fd(fd, true, "socket");

            writer.write_all(b"ping").unwrap();
            let done = received.clone();
            tokio::time::timeout(
                DEADLINE,
                events.drive_until(&runtime, || done.borrow().len() == 4),
            )
            .await
            .unwrap();
            assert_eq!(received.borrow().as_slice(), b"ping");

            host.unhook(handle);
        })
        .await;
}
