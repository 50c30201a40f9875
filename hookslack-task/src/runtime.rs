// ABOUTME: Single-threaded trampoline scheduler driven by host callbacks.
// ABOUTME: Advances ready tasks, resolves callback tokens, and reports unawaited failures once.

use crate::diagnostics::{DiagnosticSink, ErrorLog, TracingSink, UncaughtError};
use crate::error::TaskError;
use crate::host::{HookEvent, Host};
use crate::primitive::{Primitive, Slot};
use crate::store::{CorrelationMiss, CorrelationStore};
use crate::task::{Task, TaskCell, TaskId, TaskState};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::task::{Context, Poll};

type Callback = Rc<dyn Fn(HookEvent)>;

/// Shared scheduler state. Only ever touched from host callback re-entry, so
/// interior mutability without locks is enough.
pub(crate) struct Core {
    host: Rc<dyn Host>,
    store: CorrelationStore,
    tasks: RefCell<HashMap<TaskId, Rc<TaskCell>>>,
    ready: RefCell<VecDeque<TaskId>>,
    current: RefCell<Option<TaskId>>,
    draining: Cell<bool>,
    callbacks: RefCell<HashMap<String, Callback>>,
    failures: RefCell<Vec<(Rc<TaskCell>, TaskError)>>,
    sink: Rc<dyn DiagnosticSink>,
    errors: ErrorLog,
}

/// Resets the draining flag even if a routine panics mid-advance.
struct DrainGuard<'a>(&'a Cell<bool>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Core {
    /// Move every task waiting on `id` to the ready queue.
    pub(crate) fn wake_waiters(&self, id: &str) {
        let waiters = self.store.take_waiters(id);
        self.ready.borrow_mut().extend(waiters);
    }

    /// Record that the task being advanced is now suspended on `id`.
    pub(crate) fn suspend_current_on(&self, id: &str) {
        let current = self.current.borrow().clone();
        let Some(task_id) = current else {
            tracing::warn!(primitive = %id, "Primitive awaited outside of a task, nothing will resume it");
            return;
        };
        if let Some(cell) = self.tasks.borrow().get(&task_id) {
            let mut waiting = cell.waiting_on.borrow_mut();
            if let Some(previous) = waiting.as_deref() {
                if previous != id {
                    tracing::warn!(
                        task = %cell.name,
                        previous = %previous,
                        primitive = %id,
                        "Task is waiting on more than one primitive"
                    );
                }
            }
            *waiting = Some(id.to_string());
        }
        self.store.register(id, &task_id);
    }

    /// Drain the ready queue. Re-entrant calls return immediately; the
    /// outermost call picks up whatever they queued.
    pub(crate) fn run(&self) {
        if self.draining.replace(true) {
            return;
        }
        {
            let _guard = DrainGuard(&self.draining);
            loop {
                let next = self.ready.borrow_mut().pop_front();
                match next {
                    Some(id) => self.advance(&id),
                    None => break,
                }
            }
        }
        self.report_failures();
    }

    /// Poll one task until it finishes or suspends again.
    fn advance(&self, id: &TaskId) {
        let cell = self.tasks.borrow().get(id).cloned();
        let Some(cell) = cell else {
            return;
        };
        if cell.is_terminal() {
            return;
        }
        let routine = cell.routine.borrow_mut().take();
        let Some(mut routine) = routine else {
            return;
        };
        if let Some(previous) = cell.waiting_on.borrow_mut().take() {
            self.store.remove_waiter(&previous, id);
        }

        cell.state.set(TaskState::Running);
        let outer = self.current.replace(Some(id.clone()));
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        let poll = routine.as_mut().poll(&mut cx);
        *self.current.borrow_mut() = outer;

        match poll {
            Poll::Ready(()) => {
                self.tasks.borrow_mut().remove(id);
            }
            Poll::Pending if cell.state.get() == TaskState::Cancelled => {}
            Poll::Pending => {
                if cell.waiting_on.borrow().is_none() {
                    tracing::warn!(
                        task = %cell.name,
                        task_id = %id,
                        "Task suspended without awaiting a primitive"
                    );
                }
                cell.state.set(TaskState::Suspended);
                *cell.routine.borrow_mut() = Some(routine);
                return;
            }
        }
        drop(routine);
    }

    pub(crate) fn finish_task<T: Clone>(
        &self,
        id: &str,
        slot: &Slot<T>,
        result: Result<T, TaskError>,
    ) {
        let failure = result.as_ref().err().cloned();
        if slot.set(result).is_err() {
            // Cancelled while its last poll was running
            return;
        }
        let cell = self.tasks.borrow().get(id).cloned();
        if let Some(cell) = &cell {
            cell.state.set(TaskState::Finished);
        }
        self.wake_waiters(id);
        if let (Some(error), Some(cell)) = (failure, cell) {
            tracing::debug!(task = %cell.name, task_id = %id, error = %error, "Task failed");
            self.failures.borrow_mut().push((cell, error));
        }
    }

    fn is_live(&self, id: &str) -> bool {
        self.tasks
            .borrow()
            .get(id)
            .map(|cell| !cell.is_terminal())
            .unwrap_or(false)
    }

    /// Report failures that nobody read and that no live parent can still read.
    fn report_failures(&self) {
        let pending = std::mem::take(&mut *self.failures.borrow_mut());
        let mut keep = Vec::new();
        for (cell, error) in pending {
            if cell.completion.is_observed() {
                continue;
            }
            if let Some(parent) = &cell.parent {
                if self.is_live(parent) {
                    keep.push((cell, error));
                    continue;
                }
            }
            let uncaught = UncaughtError::new(&cell.name, &cell.id, error, self.host.now());
            self.sink.report(&uncaught);
            self.errors.push(uncaught);
        }
        self.failures.borrow_mut().extend(keep);
    }

    pub(crate) fn task_state(&self, id: &str) -> Option<TaskState> {
        self.tasks.borrow().get(id).map(|cell| cell.state.get())
    }

    pub(crate) fn cancel_task(&self, id: &str) -> bool {
        let cell = self.tasks.borrow_mut().remove(id);
        let Some(cell) = cell else {
            return false;
        };
        if cell.is_terminal() {
            return false;
        }
        cell.state.set(TaskState::Cancelled);
        if let Some(waiting) = cell.waiting_on.borrow_mut().take() {
            self.store.remove_waiter(&waiting, &cell.id);
        }
        let routine = cell.routine.borrow_mut().take();
        drop(routine);
        cell.completion.cancel(TaskError::Cancelled(cell.id.clone()));
        self.wake_waiters(id);
        tracing::debug!(task = %cell.name, task_id = %id, "Task cancelled");
        self.run();
        true
    }
}

/// Handle to the scheduler. Cheap to clone; every clone drives the same tasks.
///
/// The host delivers every callback through [`Runtime::dispatch`]. Routines
/// are ordinary `async` blocks; awaiting a [`Primitive`] or [`Task`] inside
/// one suspends it until the matching callback arrives.
#[derive(Clone)]
pub struct Runtime {
    core: Rc<Core>,
}

impl Runtime {
    pub fn new(host: Rc<dyn Host>) -> Self {
        Self::with_sink(host, Rc::new(TracingSink))
    }

    pub fn with_sink(host: Rc<dyn Host>, sink: Rc<dyn DiagnosticSink>) -> Self {
        Self {
            core: Rc::new(Core {
                host,
                store: CorrelationStore::new(),
                tasks: RefCell::new(HashMap::new()),
                ready: RefCell::new(VecDeque::new()),
                current: RefCell::new(None),
                draining: Cell::new(false),
                callbacks: RefCell::new(HashMap::new()),
                failures: RefCell::new(Vec::new()),
                sink,
                errors: ErrorLog::default(),
            }),
        }
    }

    pub fn host(&self) -> Rc<dyn Host> {
        Rc::clone(&self.core.host)
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.core.host.now()
    }

    pub fn store(&self) -> &CorrelationStore {
        &self.core.store
    }

    /// Start a routine. When called from outside any task it runs until its
    /// first suspension before this returns; from inside a task it starts as
    /// soon as the current task suspends.
    pub fn spawn<T, F>(&self, name: &str, routine: F) -> Task<T>
    where
        T: Clone + 'static,
        F: Future<Output = anyhow::Result<T>> + 'static,
    {
        let id = new_id();
        let slot = Rc::new(Slot::<T>::new(id.clone()));
        let weak = Rc::downgrade(&self.core);

        let wrapped = {
            let slot = Rc::clone(&slot);
            let weak = weak.clone();
            let id = id.clone();
            async move {
                let result = routine.await.map_err(TaskError::from);
                if let Some(core) = weak.upgrade() {
                    core.finish_task(&id, &slot, result);
                }
            }
        };

        let parent = self.core.current.borrow().clone();
        let cell = Rc::new(TaskCell {
            id: id.clone(),
            name: name.to_string(),
            parent,
            routine: RefCell::new(Some(Box::pin(wrapped))),
            state: Cell::new(TaskState::Created),
            waiting_on: RefCell::new(None),
            completion: slot.clone(),
        });
        self.core.tasks.borrow_mut().insert(id.clone(), cell);
        self.core.ready.borrow_mut().push_back(id.clone());
        tracing::trace!(task = %name, task_id = %id, "Task spawned");
        self.core.run();

        Task::new(Primitive::from_slot(slot, weak.clone()), weak)
    }

    /// Primitive resolved from inside the application via `set_result`.
    pub fn primitive<T: Clone + 'static>(&self) -> Primitive<T> {
        let slot = Rc::new(Slot::new(new_id()));
        Primitive::from_slot(slot, Rc::downgrade(&self.core))
    }

    /// Primitive resolvable by a host callback carrying its identifier.
    ///
    /// Passing an identifier that already has a pending primitive returns a
    /// primitive sharing that resolution.
    pub fn hook_primitive(&self, id: Option<&str>) -> Primitive<HookEvent> {
        let id = id.map(str::to_string).unwrap_or_else(new_id);
        let slot = self.core.store.track(Rc::new(Slot::new(id)));
        Primitive::from_slot(slot, Rc::downgrade(&self.core))
    }

    /// Entry point for every host callback.
    pub fn dispatch(&self, token: &str, event: HookEvent) {
        let callback = self.core.callbacks.borrow().get(token).cloned();
        match callback {
            Some(callback) => callback(event),
            None => {
                self.resolve(token, event);
            }
        }
        self.core.run();
    }

    /// Resolve the primitive registered under `id` and resume its waiters.
    /// Returns false (and drops the value) when nothing is waiting for `id`.
    pub fn resolve(&self, id: &str, event: HookEvent) -> bool {
        match self.core.store.resolve(id, event) {
            Ok(waiters) => {
                self.core.ready.borrow_mut().extend(waiters);
                self.core.run();
                true
            }
            Err(CorrelationMiss(id)) => {
                tracing::debug!(id = %id, "Dropping resolution for unknown identifier");
                false
            }
        }
    }

    /// Route callbacks for `token` to `callback` instead of the correlation store.
    pub fn register_callback(&self, token: &str, callback: impl Fn(HookEvent) + 'static) {
        self.core
            .callbacks
            .borrow_mut()
            .insert(token.to_string(), Rc::new(callback));
    }

    pub fn unregister_callback(&self, token: &str) -> bool {
        self.core.callbacks.borrow_mut().remove(token).is_some()
    }

    /// Suspend the calling routine for at least `milliseconds`.
    pub async fn sleep(&self, milliseconds: u64) -> Result<(), TaskError> {
        let timer = self.hook_primitive(None);
        self.core.host.hook_timer(milliseconds.max(1), 1, timer.id());
        timer.await.map(|_| ())
    }

    /// Number of tasks that are not finished yet.
    pub fn active_tasks(&self) -> usize {
        self.core
            .tasks
            .borrow()
            .values()
            .filter(|cell| !cell.is_terminal())
            .count()
    }

    /// Cancel every live task (used on shutdown).
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<TaskId> = self.core.tasks.borrow().keys().cloned().collect();
        ids.iter().filter(|id| self.core.cancel_task(id)).count()
    }

    pub fn uncaught_errors(&self) -> Vec<UncaughtError> {
        self.core.errors.entries()
    }

    pub fn uncaught_error(&self, id: &str) -> Option<UncaughtError> {
        self.core.errors.get(id)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("tasks", &self.core.tasks.borrow().len())
            .field("ready", &self.core.ready.borrow().len())
            .field("outstanding", &self.core.store.outstanding_ids().len())
            .finish()
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
