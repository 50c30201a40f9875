// ABOUTME: HTTP calls over the host process hook: response parsing, status classification, retry.
// ABOUTME: 429 with retry-after re-issues after sleeping without touching the retry budget.

use crate::error::SlackError;
use crate::process::{run_process, Admission};
use hookslack_task::Runtime;
use std::collections::HashMap;

const HEADER_END: &str = "\r\n\r\n";

/// Longest rate-limit pause honored from a `Retry-After` header
pub const MAX_RETRY_AFTER_SECS: u64 = 3600;

/// Status line and headers of the authoritative response block, plus its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Seconds from a numeric `retry-after` header
    pub fn retry_after(&self) -> Option<u64> {
        self.header("retry-after")?.trim().parse().ok()
    }
}

/// Parse output written with headers included.
///
/// Proxies and `100 Continue` produce several header blocks; only the last
/// one before the body counts.
pub fn parse_response(raw: &str) -> Result<HttpResponse, String> {
    let mut start = 0;
    let (head, body_start) = loop {
        let Some(offset) = raw[start..].find(HEADER_END) else {
            return Err("missing end of headers".to_string());
        };
        let end = start + offset;
        let next = end + HEADER_END.len();
        if raw[next..].starts_with("HTTP/") {
            start = next;
            continue;
        }
        break (&raw[start..end], next);
    };

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| format!("invalid status line: {status_line:?}"))?;

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Ok(HttpResponse {
        status,
        headers,
        body: raw[body_start..].to_string(),
    })
}

/// One logical HTTP call and its retry policy.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    /// Host process options (`postfields`, `httpheader`, `cookie`, ...)
    pub options: HashMap<String, String>,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub admission: Admission,
    /// Host callback token; generated per attempt when unset
    pub correlation_id: Option<String>,
}

impl HttpRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            options: HashMap::new(),
            timeout_ms: 30_000,
            max_retries: 5,
            retry_backoff_ms: 1000,
            admission: Admission::default(),
            correlation_id: None,
        }
    }

    pub fn option(mut self, key: &str, value: impl Into<String>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn admission(mut self, admission: Admission) -> Self {
        self.admission = admission;
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Successful (< 400) response and how much retrying it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub transport_retries: u32,
    pub rate_limit_waits: u32,
}

/// Issue `request` and wait for a classified response.
///
/// Transport failures are retried up to `max_retries` with a fixed backoff.
/// Status >= 400 other than a throttling 429 fails with
/// [`SlackError::HttpStatus`] and is never retried here.
pub async fn send(rt: &Runtime, request: &HttpRequest) -> anyhow::Result<HttpReply> {
    let mut options = request.options.clone();
    options.insert("header".to_string(), "1".to_string());
    let command = format!("url:{}", request.url);

    let mut transport_retries = 0;
    let mut rate_limit_waits = 0;
    loop {
        // A re-issue never shares a token with an earlier attempt
        let token = request
            .correlation_id
            .as_deref()
            .map(|base| attempt_token(base, transport_retries + rate_limit_waits));
        let output = run_process(
            rt,
            &command,
            &options,
            request.timeout_ms,
            request.admission,
            token.as_deref(),
        )
        .await?;

        if output.return_code != 0 || !output.err.is_empty() {
            if transport_retries < request.max_retries {
                transport_retries += 1;
                tracing::info!(
                    url = %request.url,
                    return_code = output.return_code,
                    error = %output.err,
                    attempt = transport_retries,
                    max_retries = request.max_retries,
                    "HTTP error, retrying"
                );
                crate::metrics::transport_retry();
                rt.sleep(request.retry_backoff_ms).await?;
                continue;
            }
            return Err(SlackError::Transport {
                url: request.url.clone(),
                return_code: output.return_code,
                error: output.err,
            }
            .into());
        }

        let response = parse_response(&output.out).map_err(|reason| SlackError::Malformed {
            url: request.url.clone(),
            reason,
        })?;

        if response.status == 429 {
            if let Some(seconds) = response.retry_after() {
                rate_limit_waits += 1;
                tracing::info!(
                    url = %request.url,
                    retry_after = seconds,
                    "HTTP ratelimit, retrying after delay"
                );
                crate::metrics::rate_limit_wait();
                rt.sleep(seconds.min(MAX_RETRY_AFTER_SECS) * 1000).await?;
                continue;
            }
        }

        if response.status >= 400 {
            return Err(SlackError::HttpStatus {
                url: request.url.clone(),
                status: response.status,
                body: response.body,
            }
            .into());
        }

        return Ok(HttpReply {
            status: response.status,
            headers: response.headers,
            body: response.body,
            transport_retries,
            rate_limit_waits,
        });
    }
}

/// First attempt keeps the caller's id so the reply can be matched to it
fn attempt_token(base: &str, attempt: u32) -> String {
    if attempt == 0 {
        base.to_string()
    } else {
        format!("{base}:{attempt}")
    }
}
