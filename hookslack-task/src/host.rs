// ABOUTME: Host hook interface: timers, async processes, fd readiness, resource counts.
// ABOUTME: The host calls back into Runtime::dispatch with the token and a HookEvent.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Opaque handle returned by the host for hooks that can be removed.
pub type HookHandle = u64;

/// Return code the host uses for a process chunk when more output follows.
pub const PROCESS_RUNNING: i32 = -1;

/// Values delivered by the host (or by in-process resolution) for a callback token.
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    /// A timer fired
    Timer {
        /// Calls left before the host removes the timer (-1 = unlimited)
        remaining_calls: i64,
    },
    /// One chunk of output from an async process
    Process {
        command: String,
        /// `PROCESS_RUNNING` while chunks keep coming, the exit status afterwards
        return_code: i32,
        out: String,
        err: String,
    },
    /// A watched file descriptor became readable
    Fd { fd: i32 },
    /// Structured value resolved from inside the application (e.g. a streamed reply)
    Value(Value),
}

/// Hooks the host application offers. Every callback comes back with the
/// token passed at registration.
pub trait Host {
    /// Call back `token` every `interval_ms`, `max_calls` times (0 = forever).
    fn hook_timer(&self, interval_ms: u64, max_calls: u32, token: &str) -> HookHandle;

    /// Run `command` asynchronously. The callback may fire several times; the
    /// last chunk carries a return code other than `PROCESS_RUNNING`.
    fn hook_process(
        &self,
        command: &str,
        options: &HashMap<String, String>,
        timeout_ms: u64,
        token: &str,
    );

    /// Call back `token` whenever `fd` is readable.
    fn hook_fd(&self, fd: i32, read: bool, token: &str) -> HookHandle;

    /// Remove a timer or fd hook.
    fn unhook(&self, handle: HookHandle);

    /// File descriptors still available to the host process.
    fn available_file_descriptors(&self) -> usize;

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
