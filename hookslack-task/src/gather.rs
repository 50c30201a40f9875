// ABOUTME: Fan-in over primitives, tasks, and not-yet-started routines.
// ABOUTME: Results keep input order; accumulate mode returns failures inline.

use crate::error::TaskError;
use crate::primitive::Primitive;
use crate::runtime::Runtime;
use crate::task::Task;
use futures::future::LocalBoxFuture;
use std::future::Future;

/// One input to [`gather`] or [`gather_results`].
pub enum Awaitable<T> {
    /// Already outstanding
    Primitive(Primitive<T>),
    /// Already running
    Task(Task<T>),
    /// Started as a child task of the gathering routine
    Routine(LocalBoxFuture<'static, anyhow::Result<T>>),
}

impl<T> From<Primitive<T>> for Awaitable<T> {
    fn from(primitive: Primitive<T>) -> Self {
        Awaitable::Primitive(primitive)
    }
}

impl<T> From<Task<T>> for Awaitable<T> {
    fn from(task: Task<T>) -> Self {
        Awaitable::Task(task)
    }
}

/// Wrap an `async` block so it can be passed to [`gather`].
pub fn routine<T, F>(future: F) -> Awaitable<T>
where
    F: Future<Output = anyhow::Result<T>> + 'static,
{
    Awaitable::Routine(Box::pin(future))
}

fn start<T: Clone + 'static>(
    runtime: &Runtime,
    inputs: impl IntoIterator<Item = Awaitable<T>>,
) -> Vec<Primitive<T>> {
    inputs
        .into_iter()
        .enumerate()
        .map(|(index, input)| match input {
            Awaitable::Primitive(primitive) => primitive,
            Awaitable::Task(task) => task.into_primitive(),
            Awaitable::Routine(future) => runtime
                .spawn(&format!("gather[{index}]"), future)
                .into_primitive(),
        })
        .collect()
}

/// Start every routine, then await all inputs. The first failure in input
/// order is returned; inputs still pending keep running.
pub async fn gather<T: Clone + 'static>(
    runtime: &Runtime,
    inputs: impl IntoIterator<Item = Awaitable<T>>,
) -> Result<Vec<T>, TaskError> {
    let pending = start(runtime, inputs);
    let mut results = Vec::with_capacity(pending.len());
    for primitive in pending {
        results.push(primitive.await?);
    }
    Ok(results)
}

/// Like [`gather`], but every input is awaited and failures come back in place.
pub async fn gather_results<T: Clone + 'static>(
    runtime: &Runtime,
    inputs: impl IntoIterator<Item = Awaitable<T>>,
) -> Vec<Result<T, TaskError>> {
    let pending = start(runtime, inputs);
    let mut results = Vec::with_capacity(pending.len());
    for primitive in pending {
        results.push(primitive.await);
    }
    results
}
