// ABOUTME: MockHost records hook registrations in order and never fires anything itself.
// ABOUTME: Tests drive callbacks explicitly through Runtime::dispatch or the fire_* helpers.

use crate::host::{HookEvent, HookHandle, Host};
use crate::runtime::Runtime;
use chrono::{DateTime, Duration, Utc};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// One registration made against the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HookCall {
    Timer {
        interval_ms: u64,
        max_calls: u32,
        token: String,
        handle: HookHandle,
    },
    Process {
        command: String,
        options: HashMap<String, String>,
        timeout_ms: u64,
        token: String,
    },
    Fd {
        fd: i32,
        read: bool,
        token: String,
        handle: HookHandle,
    },
    Unhook {
        handle: HookHandle,
    },
}

impl HookCall {
    pub fn token(&self) -> Option<&str> {
        match self {
            HookCall::Timer { token, .. }
            | HookCall::Process { token, .. }
            | HookCall::Fd { token, .. } => Some(token),
            HookCall::Unhook { .. } => None,
        }
    }

    pub fn is_timer(&self) -> bool {
        matches!(self, HookCall::Timer { .. })
    }

    pub fn is_process(&self) -> bool {
        matches!(self, HookCall::Process { .. })
    }
}

/// Host that records calls, with a settable clock and descriptor count.
pub struct MockHost {
    calls: RefCell<Vec<HookCall>>,
    next_handle: Cell<HookHandle>,
    clock: Cell<DateTime<Utc>>,
    available_fds: Cell<usize>,
}

impl MockHost {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            calls: RefCell::new(Vec::new()),
            next_handle: Cell::new(1),
            clock: Cell::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()),
            available_fds: Cell::new(1024),
        })
    }

    /// Runtime wired to this host.
    pub fn runtime(self: &Rc<Self>) -> Runtime {
        Runtime::new(Rc::clone(self) as Rc<dyn Host>)
    }

    pub fn calls(&self) -> Vec<HookCall> {
        self.calls.borrow().clone()
    }

    /// Return and forget everything recorded so far.
    pub fn take_calls(&self) -> Vec<HookCall> {
        std::mem::take(&mut *self.calls.borrow_mut())
    }

    pub fn timers(&self) -> Vec<HookCall> {
        self.calls().into_iter().filter(HookCall::is_timer).collect()
    }

    pub fn processes(&self) -> Vec<HookCall> {
        self.calls().into_iter().filter(HookCall::is_process).collect()
    }

    pub fn last_timer(&self) -> Option<HookCall> {
        self.timers().pop()
    }

    pub fn last_process(&self) -> Option<HookCall> {
        self.processes().pop()
    }

    pub fn set_available_fds(&self, count: usize) {
        self.available_fds.set(count);
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        self.clock.set(now);
    }

    pub fn advance(&self, by: Duration) {
        self.clock.set(self.clock.get() + by);
    }

    /// Fire the most recently registered timer once.
    pub fn fire_last_timer(&self, runtime: &Runtime) -> Option<String> {
        let token = self.last_timer()?.token()?.to_string();
        runtime.dispatch(&token, HookEvent::Timer { remaining_calls: 0 });
        Some(token)
    }

    /// Deliver one chunk of output for the most recent process call.
    pub fn feed_last_process(
        &self,
        runtime: &Runtime,
        return_code: i32,
        out: &str,
        err: &str,
    ) -> Option<String> {
        let HookCall::Process { command, token, .. } = self.last_process()? else {
            return None;
        };
        runtime.dispatch(
            &token,
            HookEvent::Process {
                command,
                return_code,
                out: out.to_string(),
                err: err.to_string(),
            },
        );
        Some(token)
    }

    fn handle(&self) -> HookHandle {
        let handle = self.next_handle.get();
        self.next_handle.set(handle + 1);
        handle
    }
}

impl Host for MockHost {
    fn hook_timer(&self, interval_ms: u64, max_calls: u32, token: &str) -> HookHandle {
        let handle = self.handle();
        self.calls.borrow_mut().push(HookCall::Timer {
            interval_ms,
            max_calls,
            token: token.to_string(),
            handle,
        });
        handle
    }

    fn hook_process(
        &self,
        command: &str,
        options: &HashMap<String, String>,
        timeout_ms: u64,
        token: &str,
    ) {
        self.calls.borrow_mut().push(HookCall::Process {
            command: command.to_string(),
            options: options.clone(),
            timeout_ms,
            token: token.to_string(),
        });
    }

    fn hook_fd(&self, fd: i32, read: bool, token: &str) -> HookHandle {
        let handle = self.handle();
        self.calls.borrow_mut().push(HookCall::Fd {
            fd,
            read,
            token: token.to_string(),
            handle,
        });
        handle
    }

    fn unhook(&self, handle: HookHandle) {
        self.calls.borrow_mut().push(HookCall::Unhook { handle });
    }

    fn available_file_descriptors(&self) -> usize {
        self.available_fds.get()
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.get()
    }
}
