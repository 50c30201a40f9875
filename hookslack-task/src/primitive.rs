// ABOUTME: Single-resolution primitive that a routine can await.
// ABOUTME: Resolution wakes every task registered for its identifier in the correlation store.

use crate::error::TaskError;
use crate::runtime::Core;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

/// Storage behind a primitive: pending until set exactly once.
pub(crate) struct Slot<T> {
    id: String,
    value: RefCell<Option<Result<T, TaskError>>>,
    observed: Cell<bool>,
}

impl<T: Clone> Slot<T> {
    pub(crate) fn new(id: String) -> Self {
        Self {
            id,
            value: RefCell::new(None),
            observed: Cell::new(false),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn is_done(&self) -> bool {
        self.value.borrow().is_some()
    }

    /// Store the result. A second resolution is rejected.
    pub(crate) fn set(&self, result: Result<T, TaskError>) -> Result<(), TaskError> {
        let mut value = self.value.borrow_mut();
        if value.is_some() {
            return Err(TaskError::InvalidState(format!(
                "primitive {} already resolved",
                self.id
            )));
        }
        *value = Some(result);
        Ok(())
    }

    /// Peek without marking the result observed.
    pub(crate) fn is_cancelled(&self) -> bool {
        matches!(&*self.value.borrow(), Some(Err(e)) if e.is_cancelled())
    }

    /// Read the result, marking it as seen by someone.
    pub(crate) fn read(&self) -> Option<Result<T, TaskError>> {
        let value = self.value.borrow().clone();
        if value.is_some() {
            self.observed.set(true);
        }
        value
    }
}

/// Type-erased view of a task's completion slot used by the scheduler.
pub(crate) trait Completion {
    fn is_observed(&self) -> bool;
    /// Resolve with a cancellation error if still pending.
    fn cancel(&self, error: TaskError) -> bool;
}

impl<T: Clone> Completion for Slot<T> {
    fn is_observed(&self) -> bool {
        self.observed.get()
    }

    fn cancel(&self, error: TaskError) -> bool {
        self.set(Err(error)).is_ok()
    }
}

/// A value that will be resolved once, later, by a host callback or by
/// another routine. Awaiting it from inside a task suspends that task until
/// resolution.
pub struct Primitive<T> {
    slot: Rc<Slot<T>>,
    core: Weak<Core>,
}

impl<T: Clone + 'static> Primitive<T> {
    pub(crate) fn from_slot(slot: Rc<Slot<T>>, core: Weak<Core>) -> Self {
        Self { slot, core }
    }

    /// Identifier handed to the host as the callback token.
    pub fn id(&self) -> &str {
        self.slot.id()
    }

    pub fn is_done(&self) -> bool {
        self.slot.is_done()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.slot.is_cancelled()
    }

    /// Current result without waiting, if resolved.
    pub fn result(&self) -> Option<Result<T, TaskError>> {
        self.slot.read()
    }

    /// Resolve with a value and resume every waiter.
    pub fn set_result(&self, value: T) -> Result<(), TaskError> {
        self.resolve(Ok(value))
    }

    /// Resolve with a failure and resume every waiter.
    pub fn set_error(&self, error: TaskError) -> Result<(), TaskError> {
        self.resolve(Err(error))
    }

    fn resolve(&self, result: Result<T, TaskError>) -> Result<(), TaskError> {
        self.slot.set(result)?;
        if let Some(core) = self.core.upgrade() {
            core.wake_waiters(self.slot.id());
            core.run();
        }
        Ok(())
    }
}

impl<T> Clone for Primitive<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Rc::clone(&self.slot),
            core: Weak::clone(&self.core),
        }
    }
}

impl<T> fmt::Debug for Primitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Primitive")
            .field("id", &self.slot.id)
            .field("done", &self.slot.value.borrow().is_some())
            .finish()
    }
}

impl<T: Clone + 'static> Future for Primitive<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.slot.read() {
            return Poll::Ready(result);
        }
        match self.core.upgrade() {
            Some(core) => {
                core.suspend_current_on(self.slot.id());
                Poll::Pending
            }
            // The runtime is gone: nobody will ever resolve this
            None => Poll::Ready(Err(TaskError::Cancelled(self.slot.id().to_string()))),
        }
    }
}
