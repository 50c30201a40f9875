// ABOUTME: Test support for code built on the runtime.
// ABOUTME: Provides a recording host whose callbacks are fired by hand.

pub mod mock_host;

pub use mock_host::{HookCall, MockHost};
