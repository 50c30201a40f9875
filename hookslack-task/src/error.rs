// ABOUTME: Error type shared by primitives and tasks.
// ABOUTME: Cloneable so one failure can be observed by every waiter of a primitive.

use std::fmt::{Debug, Display};
use std::sync::Arc;
use thiserror::Error;

/// Failure delivered to a routine awaiting a primitive or task.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The awaited task was cancelled before it finished
    #[error("task {0} was cancelled")]
    Cancelled(String),

    /// A primitive was resolved twice, or read before resolution
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The routine (or the host call behind a primitive) failed
    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),
}

impl TaskError {
    /// Wrap any error as a routine failure.
    pub fn failed(error: impl Into<anyhow::Error>) -> Self {
        TaskError::from(error.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled(_))
    }

    /// Look for a typed cause inside a `Failed` error.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Display + Debug + Send + Sync + 'static,
    {
        match self {
            TaskError::Failed(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(error: anyhow::Error) -> Self {
        // Errors that already crossed a task boundary keep their original shape
        match error.downcast::<TaskError>() {
            Ok(task_error) => task_error,
            Err(error) => TaskError::Failed(Arc::new(error)),
        }
    }
}

/// Find a typed error through any number of task boundaries.
///
/// An error raised in a nested task reaches the outer routine as
/// `anyhow::Error(TaskError::Failed(..))`, so a plain `downcast_ref` on the
/// outer error misses it.
pub fn find_error<E>(error: &anyhow::Error) -> Option<&E>
where
    E: Display + Debug + Send + Sync + 'static,
{
    if let Some(found) = error.downcast_ref::<E>() {
        return Some(found);
    }
    error
        .downcast_ref::<TaskError>()
        .and_then(|task_error| task_error.downcast_ref::<E>())
}
