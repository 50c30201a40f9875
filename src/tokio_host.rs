// ABOUTME: Real host on a tokio current-thread runtime and LocalSet.
// ABOUTME: Timers, subprocesses, and fd readiness come back to the task runtime through a channel.

use hookslack_task::{HookEvent, HookHandle, Host, Runtime};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::process::Stdio;
use std::rc::Rc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Return code reported when a process could not run or timed out
pub const PROCESS_ERROR: i32 = -2;

/// Descriptor budget used when the caller has no better number
pub const DEFAULT_FD_BUDGET: usize = 256;

// stdin is closed; stdout and stderr are pipes, plus the child itself
const DESCRIPTORS_PER_PROCESS: usize = 3;

/// A callback token and what to deliver to it.
pub type HostEvent = (String, HookEvent);

/// Receiving side of the host: feeds callbacks into a [`Runtime`].
pub struct HostEvents {
    receiver: mpsc::UnboundedReceiver<HostEvent>,
}

impl HostEvents {
    pub async fn next(&mut self) -> Option<HostEvent> {
        self.receiver.recv().await
    }

    /// Dispatch host callbacks to `runtime` until `done` reports true.
    pub async fn drive_until(&mut self, runtime: &Runtime, done: impl Fn() -> bool) {
        while !done() {
            let Some((token, event)) = self.receiver.recv().await else {
                tracing::warn!("Host event channel closed");
                break;
            };
            runtime.dispatch(&token, event);
        }
    }
}

/// Hooks backed by tokio tasks. Must be used from inside a `LocalSet`.
pub struct TokioHost {
    sender: mpsc::UnboundedSender<HostEvent>,
    hooks: RefCell<HashMap<HookHandle, JoinHandle<()>>>,
    next_handle: Cell<HookHandle>,
    fd_budget: usize,
    running_processes: Rc<Cell<usize>>,
}

impl TokioHost {
    pub fn new(fd_budget: usize) -> (Rc<Self>, HostEvents) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let host = Rc::new(Self {
            sender,
            hooks: RefCell::new(HashMap::new()),
            next_handle: Cell::new(1),
            fd_budget,
            running_processes: Rc::new(Cell::new(0)),
        });
        (host, HostEvents { receiver })
    }

    pub fn running_processes(&self) -> usize {
        self.running_processes.get()
    }

    fn register(&self, task: JoinHandle<()>) -> HookHandle {
        let handle = self.next_handle.get();
        self.next_handle.set(handle + 1);
        let mut hooks = self.hooks.borrow_mut();
        hooks.retain(|_, task| !task.is_finished());
        hooks.insert(handle, task);
        handle
    }
}

impl Drop for TokioHost {
    fn drop(&mut self) {
        for (_, task) in self.hooks.get_mut().drain() {
            task.abort();
        }
    }
}

impl Host for TokioHost {
    fn hook_timer(&self, interval_ms: u64, max_calls: u32, token: &str) -> HookHandle {
        let sender = self.sender.clone();
        let token = token.to_string();
        let period = Duration::from_millis(interval_ms.max(1));
        let task = tokio::task::spawn_local(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut calls: u32 = 0;
            loop {
                interval.tick().await;
                calls += 1;
                let remaining_calls = if max_calls == 0 {
                    -1
                } else {
                    i64::from(max_calls - calls)
                };
                if sender
                    .send((token.clone(), HookEvent::Timer { remaining_calls }))
                    .is_err()
                {
                    break;
                }
                if max_calls != 0 && calls >= max_calls {
                    break;
                }
            }
        });
        self.register(task)
    }

    fn hook_process(
        &self,
        command: &str,
        options: &HashMap<String, String>,
        timeout_ms: u64,
        token: &str,
    ) {
        let process = build_command(command, options);
        let sender = self.sender.clone();
        let token = token.to_string();
        let command = command.to_string();
        let running = Rc::clone(&self.running_processes);
        running.set(running.get() + 1);

        tokio::task::spawn_local(async move {
            let (return_code, out, err) = run_command(process, timeout_ms).await;
            running.set(running.get().saturating_sub(1));
            tracing::trace!(token = %token, return_code, "Process finished");
            let event = HookEvent::Process {
                command,
                return_code,
                out,
                err,
            };
            if sender.send((token, event)).is_err() {
                tracing::debug!("Host event channel closed, dropping process output");
            }
        });
    }

    fn hook_fd(&self, fd: i32, read: bool, token: &str) -> HookHandle {
        let task = tokio::task::spawn_local(watch_fd(
            fd,
            read,
            token.to_string(),
            self.sender.clone(),
        ));
        self.register(task)
    }

    fn unhook(&self, handle: HookHandle) {
        if let Some(task) = self.hooks.borrow_mut().remove(&handle) {
            task.abort();
        }
    }

    fn available_file_descriptors(&self) -> usize {
        self.fd_budget
            .saturating_sub(self.running_processes.get() * DESCRIPTORS_PER_PROCESS)
    }
}

/// `url:<URL>` becomes a curl call, anything else runs through `sh -c`.
fn build_command(command: &str, options: &HashMap<String, String>) -> Command {
    let Some(url) = command.strip_prefix("url:") else {
        let mut shell = Command::new("sh");
        shell.arg("-c").arg(command);
        return shell;
    };

    let mut curl = Command::new("curl");
    curl.arg("--silent").arg("--show-error");
    if options.get("header").is_some_and(|value| value == "1") {
        curl.arg("--include");
    }
    if let Some(agent) = options.get("useragent") {
        curl.arg("--user-agent").arg(agent);
    }
    if let Some(headers) = options.get("httpheader") {
        for header in headers.lines().filter(|line| !line.trim().is_empty()) {
            curl.arg("--header").arg(header);
        }
    }
    if let Some(cookie) = options.get("cookie") {
        curl.arg("--cookie").arg(cookie);
    }
    if let Some(body) = options.get("postfields") {
        curl.arg("--data-binary").arg(body);
    }
    curl.arg(url);
    curl
}

async fn run_command(mut command: Command, timeout_ms: u64) -> (i32, String, String) {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = command.output();
    let result = if timeout_ms == 0 {
        Ok(output.await)
    } else {
        tokio::time::timeout(Duration::from_millis(timeout_ms), output).await
    };

    match result {
        Ok(Ok(output)) => (
            output.status.code().unwrap_or(PROCESS_ERROR),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ),
        Ok(Err(e)) => (PROCESS_ERROR, String::new(), e.to_string()),
        Err(_) => (
            PROCESS_ERROR,
            String::new(),
            format!("timed out after {timeout_ms} ms"),
        ),
    }
}

#[cfg(unix)]
struct WatchedFd(std::os::unix::io::RawFd);

#[cfg(unix)]
impl std::os::unix::io::AsRawFd for WatchedFd {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.0
    }
}

#[cfg(unix)]
async fn watch_fd(fd: i32, read: bool, token: String, sender: mpsc::UnboundedSender<HostEvent>) {
    use tokio::io::unix::AsyncFd;
    use tokio::io::Interest;

    let interest = if read {
        Interest::READABLE
    } else {
        Interest::WRITABLE
    };
    let watched = match AsyncFd::with_interest(WatchedFd(fd), interest) {
        Ok(watched) => watched,
        Err(e) => {
            tracing::warn!(fd, error = %e, "Cannot watch file descriptor");
            return;
        }
    };

    loop {
        let mut guard = match watched.ready(interest).await {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(fd, error = %e, "File descriptor watch failed");
                break;
            }
        };
        if sender.send((token.clone(), HookEvent::Fd { fd })).is_err() {
            break;
        }
        // The callback drains until would-block, so the next edge is a new one
        guard.clear_ready();
        drop(guard);
        tokio::task::yield_now().await;
    }
}

#[cfg(not(unix))]
async fn watch_fd(fd: i32, _read: bool, _token: String, _sender: mpsc::UnboundedSender<HostEvent>) {
    tracing::warn!(fd, "File descriptor hooks are only supported on unix");
}
