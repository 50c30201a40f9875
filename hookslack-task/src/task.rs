// ABOUTME: Task handle and per-task scheduler state.
// ABOUTME: A task is a routine plus its own completion primitive, keyed by the task identifier.

use crate::error::TaskError;
use crate::primitive::{Completion, Primitive};
use crate::runtime::Core;
use futures::future::LocalBoxFuture;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

/// Identifier shared by a task and its completion primitive.
pub type TaskId = String;

/// Lifecycle of a routine as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued, not advanced yet
    Created,
    /// Being advanced right now
    Running,
    /// Waiting on exactly one primitive
    Suspended,
    /// Returned a value or failed
    Finished,
    Cancelled,
}

/// Scheduler-side record of a task.
pub(crate) struct TaskCell {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) parent: Option<TaskId>,
    /// Taken out while the routine is being polled
    pub(crate) routine: RefCell<Option<LocalBoxFuture<'static, ()>>>,
    pub(crate) state: Cell<TaskState>,
    pub(crate) waiting_on: RefCell<Option<String>>,
    pub(crate) completion: Rc<dyn Completion>,
}

impl TaskCell {
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.state.get(), TaskState::Finished | TaskState::Cancelled)
    }
}

/// Handle to a spawned routine. Awaiting it yields the routine's result;
/// dropping it does not cancel the routine.
pub struct Task<T> {
    completion: Primitive<T>,
    core: Weak<Core>,
}

impl<T: Clone + 'static> Task<T> {
    pub(crate) fn new(completion: Primitive<T>, core: Weak<Core>) -> Self {
        Self { completion, core }
    }

    pub fn id(&self) -> &str {
        self.completion.id()
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }

    /// Result of the routine if it has finished (reading it counts as
    /// handling a failure).
    pub fn result(&self) -> Option<Result<T, TaskError>> {
        self.completion.result()
    }

    pub fn state(&self) -> TaskState {
        let live = self.core.upgrade().and_then(|core| core.task_state(self.id()));
        match live {
            Some(state) => state,
            None if self.completion.is_cancelled() => TaskState::Cancelled,
            None if self.completion.is_done() => TaskState::Finished,
            None => TaskState::Cancelled,
        }
    }

    /// Stop the routine. It will never be advanced again and anyone awaiting
    /// it gets `TaskError::Cancelled`. Host calls already issued keep running.
    pub fn cancel(&self) -> bool {
        match self.core.upgrade() {
            Some(core) => core.cancel_task(self.id()),
            None => false,
        }
    }

    /// The completion primitive, for code that awaits tasks and primitives uniformly.
    pub fn into_primitive(self) -> Primitive<T> {
        self.completion
    }
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            completion: self.completion.clone(),
            core: Weak::clone(&self.core),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Task").field(&self.completion).finish()
    }
}

impl<T: Clone + 'static> Future for Task<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.completion).poll(cx)
    }
}
