// ABOUTME: Slack Web API client for one workspace, built on the HTTP pipeline.
// ABOUTME: Handles auth options, cookie normalization, ok-flag checks, and cursor pagination.

use crate::config::{NetworkConfig, WorkspaceConfig};
use crate::error::SlackError;
use crate::http::{send, HttpRequest};
use crate::process::Admission;
use crate::request::{OutboundRequest, Params};
use anyhow::Result;
use hookslack_task::Runtime;
use serde_json::Value;
use std::collections::HashMap;

pub const USER_AGENT: &str = concat!("hookslack/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct SlackApi {
    workspace: String,
    token: String,
    cookies: Option<String>,
    network: NetworkConfig,
}

impl std::fmt::Debug for SlackApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackApi")
            .field("workspace", &self.workspace)
            .field("token", &"[REDACTED]")
            .field("api_base", &self.network.api_base)
            .finish()
    }
}

impl SlackApi {
    pub fn new(workspace: &str, token: &str, network: NetworkConfig) -> Self {
        Self {
            workspace: workspace.to_string(),
            token: token.to_string(),
            cookies: None,
            network,
        }
    }

    /// Client for a configured workspace; `None` when it has no token.
    pub fn from_config(
        workspace: &str,
        config: &WorkspaceConfig,
        network: &NetworkConfig,
    ) -> Option<Self> {
        let token = config.api_token.as_deref()?;
        let mut api = Self::new(workspace, token, network.clone());
        api.cookies = config.api_cookies.clone();
        Some(api)
    }

    pub fn with_cookies(mut self, cookies: &str) -> Self {
        self.cookies = Some(cookies.to_string());
        self
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn api_base(&self) -> &str {
        &self.network.api_base
    }

    pub fn request_options(&self) -> HashMap<String, String> {
        let mut options = HashMap::new();
        options.insert("useragent".to_string(), USER_AGENT.to_string());
        options.insert(
            "httpheader".to_string(),
            format!("Authorization: Bearer {}", self.token),
        );
        if let Some(cookies) = &self.cookies {
            options.insert("cookie".to_string(), normalize_cookies(cookies));
        }
        options
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.network.api_base.trim_end_matches('/'), method)
    }

    fn http_request(&self, method: &str, options: HashMap<String, String>) -> HttpRequest {
        let mut request = HttpRequest::new(self.method_url(method))
            .timeout_ms(self.network.timeout_secs * 1000)
            .max_retries(self.network.max_retries)
            .retry_backoff_ms(self.network.retry_backoff_ms)
            .admission(Admission::from(&self.network));
        request.options = options;
        request
    }

    fn form_request(&self, method: &str, params: &Params) -> HttpRequest {
        let mut options = self.request_options();
        options.insert("postfields".to_string(), encode_form(params));
        self.http_request(method, options)
    }

    /// Form-encoded POST. Fails with [`SlackError::Api`] when `ok` is false.
    pub async fn fetch(&self, rt: &Runtime, method: &str, params: &Params) -> Result<Value> {
        let reply = send(rt, &self.form_request(method, params)).await?;
        let response = decode(method, &reply.body)?;
        self.check_ok(method, params, response)
    }

    /// JSON POST. Fails with [`SlackError::Api`] when `ok` is false.
    pub async fn post_json(&self, rt: &Runtime, method: &str, body: &Value) -> Result<Value> {
        let mut options = self.request_options();
        if let Some(header) = options.get_mut("httpheader") {
            header.push_str("\nContent-Type: application/json");
        }
        options.insert("postfields".to_string(), body.to_string());
        let reply = send(rt, &self.http_request(method, options)).await?;
        let response = decode(method, &reply.body)?;
        if response.get("ok").and_then(Value::as_bool) == Some(false) {
            return Err(SlackError::Api {
                workspace: self.workspace.clone(),
                method: method.to_string(),
                params: body.clone(),
                response,
            }
            .into());
        }
        Ok(response)
    }

    /// Fetch a list method page by page, following `response_metadata.next_cursor`.
    ///
    /// `max_pages <= 0` means every page. Items under `list_key` are
    /// concatenated in page order into the first response.
    pub async fn fetch_list(
        &self,
        rt: &Runtime,
        method: &str,
        list_key: &str,
        params: &Params,
        max_pages: i32,
    ) -> Result<Value> {
        let mut params = params.clone();
        let mut response = self.fetch(rt, method, &params).await?;
        let mut pages = 1;

        while max_pages <= 0 || pages < max_pages {
            let Some(cursor) = next_cursor(&response) else {
                break;
            };
            params.insert("cursor".to_string(), cursor);
            let mut page = self.fetch(rt, method, &params).await?;
            pages += 1;

            let items = page
                .get_mut(list_key)
                .and_then(Value::as_array_mut)
                .map(std::mem::take)
                .unwrap_or_default();
            let metadata = page.get("response_metadata").cloned().unwrap_or(Value::Null);
            let Some(object) = response.as_object_mut() else {
                break;
            };
            match object.get_mut(list_key).and_then(Value::as_array_mut) {
                Some(list) => list.extend(items),
                None => {
                    object.insert(list_key.to_string(), Value::Array(items));
                }
            }
            object.insert("response_metadata".to_string(), metadata);
        }

        tracing::debug!(method = %method, pages, "Fetched paginated list");
        Ok(response)
    }

    /// Single attempt for a router-queued request, correlated by its response id.
    ///
    /// The `ok` flag is left to the handler; only transport and HTTP status
    /// failures are errors here.
    pub async fn call_request(&self, rt: &Runtime, request: &OutboundRequest) -> Result<Value> {
        let http = self
            .form_request(&request.method, &request.params)
            .max_retries(0)
            .correlation_id(request.response_id.clone());
        let reply = send(rt, &http).await?;
        Ok(decode(&request.method, &reply.body)?)
    }

    fn check_ok(&self, method: &str, params: &Params, response: Value) -> Result<Value> {
        if response.get("ok").and_then(Value::as_bool) == Some(false) {
            return Err(SlackError::Api {
                workspace: self.workspace.clone(),
                method: method.to_string(),
                params: serde_json::to_value(params).unwrap_or(Value::Null),
                response,
            }
            .into());
        }
        Ok(response)
    }
}

fn decode(method: &str, body: &str) -> Result<Value, SlackError> {
    serde_json::from_str(body).map_err(|e| SlackError::Decode {
        context: format!("response to {method}"),
        reason: e.to_string(),
    })
}

fn next_cursor(response: &Value) -> Option<String> {
    response
        .pointer("/response_metadata/next_cursor")
        .and_then(Value::as_str)
        .filter(|cursor| !cursor.is_empty())
        .map(str::to_string)
}

pub fn encode_form(params: &Params) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish()
}

/// Percent-encode a cookie value unless it already is.
fn encode_if_not_encoded(value: &str) -> String {
    let encoded = urlencoding::decode(value)
        .map(|decoded| decoded != value)
        .unwrap_or(false);
    if encoded {
        value.to_string()
    } else {
        urlencoding::encode(value).into_owned()
    }
}

/// `xoxd-abc` -> `d=xoxd-abc`; `d=a/b; d-s=1` -> `d=a%2Fb; d-s=1`
pub fn normalize_cookies(config: &str) -> String {
    let mut pairs: Vec<(String, String)> = config
        .split(';')
        .map(|cookie| match cookie.split_once('=') {
            Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
            None => (String::new(), cookie.trim().to_string()),
        })
        .collect();
    if pairs.len() == 1 && pairs[0].0.is_empty() {
        pairs[0].0 = "d".to_string();
    }
    pairs
        .into_iter()
        .map(|(name, value)| format!("{}={}", name, encode_if_not_encoded(&value)))
        .collect::<Vec<_>>()
        .join("; ")
}
