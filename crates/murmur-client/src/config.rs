//! Client configuration loaded from environment variables.
//!
//! All settings have defaults so the client can start with zero
//! configuration against a local server.

use std::time::Duration;

use murmur_net::{ApiConfig, ConnectionConfig};
use murmur_shared::constants::{
    DEFAULT_API_URL, DEFAULT_RECONNECT_MAX_MS, DEFAULT_RECONNECT_MIN_MS,
    DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_STREAM_URL, DEFAULT_TYPING_TIMEOUT_SECS,
    OUTBOUND_QUEUE_CAPACITY,
};
use murmur_shared::UserId;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the data-fetch API.
    /// Env: `MURMUR_API_URL`
    pub api_url: String,

    /// WebSocket URL of the event stream.
    /// Env: `MURMUR_STREAM_URL`
    pub stream_url: String,

    /// Identity of the current user; its profile is fetched at startup.
    /// Env: `MURMUR_USER_ID`
    pub user_id: Option<UserId>,

    /// Env: `MURMUR_API_KEY`
    pub api_key: Option<String>,

    /// Env: `MURMUR_ROLE`
    pub role: Option<String>,

    /// Env: `MURMUR_REQUEST_TIMEOUT_SECS`
    pub request_timeout: Duration,

    /// A typing indicator with no refreshing start event is dropped after
    /// this long.
    /// Env: `MURMUR_TYPING_TIMEOUT_SECS`
    pub typing_timeout: Duration,

    /// Env: `MURMUR_RECONNECT_MIN_MS`
    pub reconnect_min: Duration,

    /// Env: `MURMUR_RECONNECT_MAX_MS`
    pub reconnect_max: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            stream_url: DEFAULT_STREAM_URL.to_string(),
            user_id: None,
            api_key: None,
            role: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            typing_timeout: Duration::from_secs(DEFAULT_TYPING_TIMEOUT_SECS),
            reconnect_min: Duration::from_millis(DEFAULT_RECONNECT_MIN_MS),
            reconnect_max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = var("MURMUR_API_URL") {
            config.api_url = url;
        }

        if let Some(url) = var("MURMUR_STREAM_URL") {
            config.stream_url = url;
        }

        config.user_id = non_empty(var("MURMUR_USER_ID")).map(UserId);
        config.api_key = non_empty(var("MURMUR_API_KEY"));
        config.role = non_empty(var("MURMUR_ROLE"));

        if let Some(secs) = parse_u64(&var, "MURMUR_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_u64(&var, "MURMUR_TYPING_TIMEOUT_SECS") {
            config.typing_timeout = Duration::from_secs(secs);
        }

        if let Some(ms) = parse_u64(&var, "MURMUR_RECONNECT_MIN_MS") {
            config.reconnect_min = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_u64(&var, "MURMUR_RECONNECT_MAX_MS") {
            config.reconnect_max = Duration::from_millis(ms);
        }

        if config.reconnect_max < config.reconnect_min {
            tracing::warn!(
                min_ms = config.reconnect_min.as_millis() as u64,
                max_ms = config.reconnect_max.as_millis() as u64,
                "Reconnect max below min, raising max"
            );
            config.reconnect_max = config.reconnect_min;
        }

        config
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.api_url.clone(),
            user_id: self.user_id.as_ref().map(|id| id.0.clone()),
            api_key: self.api_key.clone(),
            role: self.role.clone(),
            timeout: self.request_timeout,
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            reconnect_min: self.reconnect_min,
            reconnect_max: self.reconnect_max,
            outbound_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_u64(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    let raw = var(name)?;
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(value = %raw, "Invalid {name}, using default");
            None
        }
    }
}
