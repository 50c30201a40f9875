// ABOUTME: Callback-driven task runtime for hosts that only expose timer/process/fd hooks.
// ABOUTME: Provides single-resolution primitives, tasks, a correlation store, and gather.

pub mod diagnostics;
pub mod error;
pub mod gather;
pub mod host;
pub mod primitive;
pub mod runtime;
pub mod store;
pub mod task;
pub mod testing;

pub use diagnostics::{DiagnosticSink, ErrorLog, TracingSink, UncaughtError};
pub use error::{find_error, TaskError};
pub use gather::{gather, gather_results, routine, Awaitable};
pub use host::{HookEvent, HookHandle, Host, PROCESS_RUNNING};
pub use primitive::Primitive;
pub use runtime::Runtime;
pub use store::CorrelationStore;
pub use task::{Task, TaskId, TaskState};
