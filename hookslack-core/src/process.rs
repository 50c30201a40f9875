// ABOUTME: Async process calls through the host hook with descriptor backpressure.
// ABOUTME: Accumulates chunked output until the host reports a final return code.

use crate::config::NetworkConfig;
use hookslack_task::{HookEvent, Runtime, TaskError, PROCESS_RUNNING};
use std::collections::HashMap;

/// Reassembled result of one process call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub command: String,
    pub return_code: i32,
    pub out: String,
    pub err: String,
}

/// Blocking-admission policy: wait while the host has fewer than `fd_floor`
/// free descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub fd_floor: usize,
    pub poll_ms: u64,
}

impl Default for Admission {
    fn default() -> Self {
        Self {
            fd_floor: 10,
            poll_ms: 10,
        }
    }
}

impl From<&NetworkConfig> for Admission {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            fd_floor: config.fd_floor,
            poll_ms: config.fd_poll_ms,
        }
    }
}

/// Sleep until enough descriptors are free. Returns how many times it waited.
pub async fn wait_for_descriptors(rt: &Runtime, admission: Admission) -> Result<u32, TaskError> {
    let host = rt.host();
    let mut waits = 0;
    while host.available_file_descriptors() < admission.fd_floor {
        if waits == 0 {
            tracing::debug!(
                available = host.available_file_descriptors(),
                floor = admission.fd_floor,
                "Too few file descriptors, waiting before issuing request"
            );
        }
        waits += 1;
        rt.sleep(admission.poll_ms).await?;
    }
    Ok(waits)
}

/// Run `command` through the host process hook and wait for all of its output.
///
/// `token` is the correlation identifier handed to the host; a fresh one is
/// generated when `None`. Every chunk arrives as a separate resolution of that
/// identifier.
pub async fn run_process(
    rt: &Runtime,
    command: &str,
    options: &HashMap<String, String>,
    timeout_ms: u64,
    admission: Admission,
    token: Option<&str>,
) -> Result<ProcessOutput, TaskError> {
    let token = token
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    wait_for_descriptors(rt, admission).await?;

    // Track the first chunk before hooking so an eager host still finds it
    let mut chunk = rt.hook_primitive(Some(&token));
    tracing::debug!(token = %token, command = %command, "Issuing process call");
    rt.host().hook_process(command, options, timeout_ms, &token);

    let mut out = String::new();
    let mut err = String::new();
    loop {
        let (return_code, chunk_out, chunk_err) = match chunk.await? {
            HookEvent::Process {
                return_code,
                out,
                err,
                ..
            } => (return_code, out, err),
            other => {
                return Err(TaskError::InvalidState(format!(
                    "unexpected callback {other:?} for process {token}"
                )))
            }
        };
        out.push_str(&chunk_out);
        err.push_str(&chunk_err);

        if return_code != PROCESS_RUNNING {
            tracing::debug!(
                token = %token,
                command = %command,
                return_code,
                length = out.len(),
                "Process call finished"
            );
            return Ok(ProcessOutput {
                command: command.to_string(),
                return_code,
                out,
                err,
            });
        }
        tracing::trace!(token = %token, length = chunk_out.len(), "Intermediate process chunk");
        chunk = rt.hook_primitive(Some(&token));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookslack_task::testing::{HookCall, MockHost};

    #[test]
    fn test_chunks_accumulate_until_final_code() {
        let host = MockHost::new();
        let rt = host.runtime();
        let r = rt.clone();
        let task = rt.spawn("process", async move {
            Ok(run_process(&r, "ls", &HashMap::new(), 1000, Admission::default(), None).await?)
        });

        host.feed_last_process(&rt, PROCESS_RUNNING, "a", "").unwrap();
        host.feed_last_process(&rt, PROCESS_RUNNING, "b", "warn").unwrap();
        assert!(!task.is_done());
        host.feed_last_process(&rt, 0, "c", "").unwrap();

        let output = task.result().unwrap().unwrap();
        assert_eq!(output.out, "abc");
        assert_eq!(output.err, "warn");
        assert_eq!(output.return_code, 0);
    }

    #[test]
    fn test_backpressure_waits_before_hooking() {
        let host = MockHost::new();
        host.set_available_fds(3);
        let rt = host.runtime();
        let r = rt.clone();
        let task = rt.spawn("process", async move {
            Ok(run_process(&r, "ls", &HashMap::new(), 1000, Admission::default(), Some("tok")).await?)
        });

        assert!(host.processes().is_empty());
        host.fire_last_timer(&rt).unwrap();
        assert!(host.processes().is_empty(), "still below the floor");
        host.set_available_fds(50);
        host.fire_last_timer(&rt).unwrap();

        let calls = host.calls();
        assert!(calls[0].is_timer());
        assert!(calls[1].is_timer());
        assert!(matches!(&calls[2], HookCall::Process { token, .. } if token == "tok"));
        host.feed_last_process(&rt, 0, "done", "").unwrap();
        assert_eq!(task.result().unwrap().unwrap().out, "done");
    }
}
