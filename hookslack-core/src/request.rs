// ABOUTME: Outbound API request record queued through the router with its own retry budget.
// ABOUTME: The response id is re-derived on every attempt so stale replies never match a new one.

use crate::config::DEFAULT_API_BASE;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\W+").expect("Invalid method pattern"));

/// Query/form parameters of an API call
pub type Params = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub team: String,
    pub method: String,
    pub params: Params,
    pub retries: u32,
    pub tries: u32,
    pub start_time: DateTime<Utc>,
    /// Method name with non-word characters stripped, used as the handler hint
    pub normalized_method: String,
    pub response_id: String,
    url: String,
}

impl OutboundRequest {
    pub fn new(team: &str, method: &str, params: Params, now: DateTime<Utc>) -> Self {
        let url = method_url(DEFAULT_API_BASE, method, &params);
        let response_id = response_id(&url, now);
        Self {
            team: team.to_string(),
            method: method.to_string(),
            params,
            retries: 3,
            tries: 0,
            start_time: now,
            normalized_method: normalize_method(method),
            response_id,
            url,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Point the request at another API root, e.g. the workspace's configured one
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.url = method_url(api_base, &self.method, &self.params);
        self.response_id = response_id(&self.url, self.start_time);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Count an attempt and derive a fresh response id for it
    pub fn tried(&mut self, now: DateTime<Utc>) {
        self.tries += 1;
        self.response_id = response_id(&self.url, now);
    }

    pub fn should_try(&self) -> bool {
        self.tries < self.retries
    }

    /// Quadratic backoff from the first issue time
    pub fn retry_ready(&self, now: DateTime<Utc>) -> bool {
        let backoff = Duration::seconds(i64::from(self.tries).pow(2));
        self.start_time + backoff < now
    }
}

fn method_url(api_base: &str, method: &str, params: &Params) -> String {
    format!(
        "{}/{}?{}",
        api_base.trim_end_matches('/'),
        method,
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter())
            .finish()
    )
}

fn response_id(url: &str, at: DateTime<Utc>) -> String {
    let seed = format!("{}{}", url, at.timestamp_nanos_opt().unwrap_or_default());
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, seed.as_bytes()).to_string()
}

/// `conversations.history` -> `conversationshistory`
pub fn normalize_method(method: &str) -> String {
    NON_WORD.replace_all(method, "").into_owned()
}
