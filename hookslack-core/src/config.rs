// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Network, router, recorder, and per-workspace credential settings with defaults
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "hookslack";
const APPLICATION: &str = "hookslack";

/// Prefix for per-workspace token overrides, e.g. `SLACK_TOKEN_ACME`.
pub const TOKEN_ENV_PREFIX: &str = "SLACK_TOKEN_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub workspaces: BTreeMap<String, WorkspaceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Transport retries for direct API calls
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Minimum free file descriptors before a new request is issued
    #[serde(default = "default_fd_floor")]
    pub fd_floor: usize,
    #[serde(default = "default_fd_poll_ms")]
    pub fd_poll_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            fd_floor: default_fd_floor(),
            fd_poll_ms: default_fd_poll_ms(),
        }
    }
}

/// Web API root used when neither the file nor the environment sets one
pub const DEFAULT_API_BASE: &str = "https://api.slack.com/api";

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_fd_floor() -> usize {
    10
}

fn default_fd_poll_ms() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Tick interval while the primary queue has work
    #[serde(default = "default_busy_interval_ms")]
    pub busy_interval_ms: u64,
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    /// Minimum gap between two moves from the slow queue
    #[serde(default = "default_slow_queue_interval_ms")]
    pub slow_queue_interval_ms: u64,
    #[serde(default = "default_events_per_tick")]
    pub events_per_tick: usize,
    /// Retry budget for requests issued through the router
    #[serde(default = "default_request_retries")]
    pub request_retries: u32,
    #[serde(default = "default_ignored_events")]
    pub ignored_events: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            busy_interval_ms: default_busy_interval_ms(),
            idle_interval_ms: default_idle_interval_ms(),
            slow_queue_interval_ms: default_slow_queue_interval_ms(),
            events_per_tick: default_events_per_tick(),
            request_retries: default_request_retries(),
            ignored_events: default_ignored_events(),
        }
    }
}

fn default_busy_interval_ms() -> u64 {
    10
}

fn default_idle_interval_ms() -> u64 {
    500
}

fn default_slow_queue_interval_ms() -> u64 {
    1000
}

fn default_events_per_tick() -> usize {
    20
}

fn default_request_retries() -> u32 {
    3
}

fn default_ignored_events() -> Vec<String> {
    vec!["hello".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_record_dir")]
    pub dir: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_record_dir(),
        }
    }
}

fn default_record_dir() -> String {
    data_dir().join("record").to_string_lossy().into_owned()
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    /// Browser session cookies, either a bare `d` value or `k=v; k2=v2`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_cookies: Option<String>,
}

// Custom Debug impl to redact sensitive fields
impl std::fmt::Debug for WorkspaceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceConfig")
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field(
                "api_cookies",
                &self.api_cookies.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// Data directory, falling back to ./data when no home directory is known
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Default config file path, e.g. ~/.config/hookslack/config.toml
pub fn config_file() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}

impl Config {
    /// Find the config file, checking in order:
    /// 1. HOOKSLACK_CONFIG_PATH env var (if set)
    /// 2. ./config.toml
    /// 3. the platform config dir
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("HOOKSLACK_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let user_config = config_file();
        if user_config.exists() {
            return Some(user_config);
        }

        None
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str::<Config>(content).context("Failed to parse configuration")
    }

    /// Load configuration with environment variable overrides, then validate.
    pub fn load() -> Result<Self> {
        let mut config = if let Some(config_path) = Self::find_config_file() {
            tracing::info!(
                path = %config_path.display(),
                "Loading configuration from file"
            );
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            tracing::info!("No config file found, using environment variables and defaults");
            Config::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("HOOKSLACK_API_BASE") {
            self.network.api_base = val;
        }
        if let Ok(val) = std::env::var("HOOKSLACK_TIMEOUT_SECS") {
            self.network.timeout_secs = val
                .parse()
                .with_context(|| format!("HOOKSLACK_TIMEOUT_SECS is not a number: {val}"))?;
        }
        if let Ok(val) = std::env::var("HOOKSLACK_MAX_RETRIES") {
            self.network.max_retries = val
                .parse()
                .with_context(|| format!("HOOKSLACK_MAX_RETRIES is not a number: {val}"))?;
        }
        if let Ok(val) = std::env::var("HOOKSLACK_RECORD_DIR") {
            self.recorder.dir = val;
        }
        if let Ok(val) = std::env::var("HOOKSLACK_RECORD") {
            self.recorder.enabled = matches!(val.as_str(), "1" | "true" | "yes");
        }

        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix(TOKEN_ENV_PREFIX) {
                if name.is_empty() {
                    continue;
                }
                self.workspaces
                    .entry(name.to_lowercase())
                    .or_default()
                    .api_token = Some(value);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.timeout_secs == 0 {
            anyhow::bail!("network.timeout_secs must be greater than zero");
        }
        if self.router.busy_interval_ms == 0 || self.router.idle_interval_ms == 0 {
            anyhow::bail!("router tick intervals must be greater than zero");
        }
        if self.router.idle_interval_ms < self.router.busy_interval_ms {
            anyhow::bail!(
                "router.idle_interval_ms ({}) must not be shorter than router.busy_interval_ms ({})",
                self.router.idle_interval_ms,
                self.router.busy_interval_ms
            );
        }
        if self.router.events_per_tick == 0 {
            anyhow::bail!("router.events_per_tick must be at least 1");
        }
        for (name, workspace) in &self.workspaces {
            if let Some(token) = &workspace.api_token {
                if token.trim().is_empty() {
                    anyhow::bail!("workspaces.{name}.api_token is empty");
                }
            }
        }
        Ok(())
    }

    pub fn workspace(&self, name: &str) -> Option<&WorkspaceConfig> {
        self.workspaces.get(name)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.network.timeout_secs * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.network.timeout_secs, 30);
        assert_eq!(config.network.fd_floor, 10);
        assert_eq!(config.router.ignored_events, vec!["hello".to_string()]);
        assert!(!config.recorder.enabled);
        assert!(config.workspaces.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_workspace_tokens_are_redacted_in_debug() {
        let config = Config::from_toml_str(
            r#"
            [workspaces.acme]
            api_token = "xoxp-secret"
            api_cookies = "d=abc"
            "#,
        )
        .unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("xoxp-secret"));
        assert!(!debug.contains("d=abc"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_validate_rejects_inverted_intervals() {
        let config = Config::from_toml_str(
            r#"
            [router]
            busy_interval_ms = 100
            idle_interval_ms = 50
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
