// ABOUTME: Error taxonomy for Slack transport, remote rejections, and decoding failures.
// ABOUTME: Also formats uncaught task failures into one-line diagnostics keyed by error id.

use hookslack_task::{DiagnosticSink, UncaughtError};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SlackError {
    /// The process hook failed or wrote to its error stream
    #[error("transport error calling {url}: return code {return_code}, error: {error}")]
    Transport {
        url: String,
        return_code: i32,
        error: String,
    },

    /// Well-formed HTTP response with a failure status (429 without retry-after included)
    #[error("HTTP status {status} from {url}: {body}")]
    HttpStatus { url: String, status: u16, body: String },

    /// The API answered with `"ok": false`
    #[error("Slack API method {method} failed for workspace {workspace}: {response}")]
    Api {
        workspace: String,
        method: String,
        params: Value,
        response: Value,
    },

    #[error("could not decode {context}: {reason}")]
    Decode { context: String, reason: String },

    #[error("malformed HTTP response from {url}: {reason}")]
    Malformed { url: String, reason: String },

    #[error("no API client configured for workspace {0}")]
    NoApi(String),
}

impl SlackError {
    /// Transport failures are worth retrying; everything else goes to the caller.
    pub fn is_transport(&self) -> bool {
        matches!(self, SlackError::Transport { .. })
    }

    /// Remote service refused the call
    pub fn is_rejection(&self) -> bool {
        matches!(self, SlackError::HttpStatus { .. } | SlackError::Api { .. })
    }
}

/// One-line description of an uncaught failure, pointing at its log id.
pub fn format_uncaught(uncaught: &UncaughtError) -> String {
    let suffix = format!("(error id {})", uncaught.id);
    match uncaught.error.downcast_ref::<SlackError>() {
        Some(SlackError::Transport {
            url,
            return_code,
            error,
        }) => format!(
            "Error calling URL {url}: return code: {return_code}, error: {error} {suffix}"
        ),
        Some(SlackError::HttpStatus { url, status, body }) => {
            format!("Error calling URL {url}: http status code: {status}, error: {body} {suffix}")
        }
        Some(SlackError::Api {
            workspace,
            method,
            params,
            response,
        }) => format!(
            "Error from Slack API method {method} with request {params} for workspace {workspace}: {response} {suffix}"
        ),
        Some(other) => format!("{other} {suffix}"),
        None => format!(
            "Error in task {}: {} {suffix}",
            uncaught.task, uncaught.error
        ),
    }
}

/// Diagnostic sink that logs Slack-aware descriptions of uncaught failures.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlackErrorSink;

impl DiagnosticSink for SlackErrorSink {
    fn report(&self, error: &UncaughtError) {
        crate::metrics::uncaught_error();
        tracing::error!(
            error_id = %error.id,
            task = %error.task,
            "{}",
            format_uncaught(error)
        );
    }
}
