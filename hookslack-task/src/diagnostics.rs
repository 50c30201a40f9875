// ABOUTME: Diagnostic sink for task failures nobody awaited.
// ABOUTME: Keeps an error log addressable by id so the full error can be looked up later.

use crate::error::TaskError;
use chrono::{DateTime, Utc};
use std::cell::RefCell;

/// A routine failure that reached the outermost task boundary.
#[derive(Debug, Clone)]
pub struct UncaughtError {
    pub id: String,
    /// Name the task was spawned with
    pub task: String,
    pub task_id: String,
    pub error: TaskError,
    pub time: DateTime<Utc>,
}

impl UncaughtError {
    pub fn new(task: &str, task_id: &str, error: TaskError, time: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task: task.to_string(),
            task_id: task_id.to_string(),
            error,
            time,
        }
    }
}

/// Receives each uncaught failure exactly once.
pub trait DiagnosticSink {
    fn report(&self, error: &UncaughtError);
}

/// Default sink: one `tracing` error event per failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, error: &UncaughtError) {
        tracing::error!(
            error_id = %error.id,
            task = %error.task,
            task_id = %error.task_id,
            error = %error.error,
            "Task failed and was never awaited"
        );
    }
}

/// In-memory list of uncaught failures.
#[derive(Debug, Default)]
pub struct ErrorLog {
    entries: RefCell<Vec<UncaughtError>>,
}

impl ErrorLog {
    pub fn push(&self, error: UncaughtError) {
        self.entries.borrow_mut().push(error);
    }

    pub fn get(&self, id: &str) -> Option<UncaughtError> {
        self.entries.borrow().iter().find(|e| e.id == id).cloned()
    }

    pub fn entries(&self) -> Vec<UncaughtError> {
        self.entries.borrow().clone()
    }
}
