//! Channel configuration parsed from environment variables.

use std::time::Duration;

use crate::error::ChannelError;

pub const DEFAULT_BASE_URL: &str = "https://chat.example.com/api/channel";
pub const DEFAULT_STREAM_URL: &str = "https://chat.example.com/api/channel/bind";
pub const DEFAULT_ORIGIN: &str = "https://chat.example.com";
pub const DEFAULT_API_KEY: &str = "roomstream-public-key";
pub const DEFAULT_USER_AGENT: &str = concat!("roomstream/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: i64 = 0;
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 240;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

/// Backoff settings consumed by [`crate::backoff::ReconnectPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Attempt ceiling. Zero or negative means unlimited.
    pub max_attempts: i64,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Room ids the binary joins, one session each.
    pub rooms: Vec<String>,
    pub api_key: String,
    /// Value of the identification header sent on every request.
    pub user_agent: String,
    /// Fixed `Origin` / `Referer` value.
    pub origin: String,
    pub base_url: String,
    pub stream_url: String,
    pub reconnect: ReconnectConfig,
    pub refresh_interval: Duration,
    pub timeouts: HttpTimeouts,
    pub event_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            rooms: Vec::new(),
            api_key: DEFAULT_API_KEY.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            stream_url: DEFAULT_STREAM_URL.to_string(),
            reconnect: ReconnectConfig::default(),
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            timeouts: HttpTimeouts {
                request_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
                connect_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            },
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ChannelConfig {
    /// Build typed channel config from environment variables.
    ///
    /// Required:
    /// - `ROOMSTREAM_ROOMS`: comma-separated room identifiers
    ///
    /// Optional:
    /// - `ROOMSTREAM_API_KEY`, `ROOMSTREAM_USER_AGENT`, `ROOMSTREAM_ORIGIN`
    /// - `ROOMSTREAM_BASE_URL`, `ROOMSTREAM_STREAM_URL`
    /// - `ROOMSTREAM_MAX_RECONNECT_ATTEMPTS`: default 0 (unlimited)
    /// - `ROOMSTREAM_INITIAL_DELAY_MS`: default 1000
    /// - `ROOMSTREAM_MAX_DELAY_MS`: default 30000
    /// - `ROOMSTREAM_REFRESH_INTERVAL_SECS`: default 240
    /// - `ROOMSTREAM_REQUEST_TIMEOUT_SECS`: default 30
    /// - `ROOMSTREAM_CONNECT_TIMEOUT_SECS`: default 10
    /// - `ROOMSTREAM_EVENT_CAPACITY`: default 1024
    pub fn from_env() -> Result<Self, ChannelError> {
        let rooms = parse_rooms(std::env::var("ROOMSTREAM_ROOMS").ok().as_deref())?;

        let base_url = parse_url("ROOMSTREAM_BASE_URL", DEFAULT_BASE_URL)?;
        let stream_url = parse_url("ROOMSTREAM_STREAM_URL", DEFAULT_STREAM_URL)?;
        let origin = parse_url("ROOMSTREAM_ORIGIN", DEFAULT_ORIGIN)?;

        let reconnect = ReconnectConfig {
            max_attempts: env_parse("ROOMSTREAM_MAX_RECONNECT_ATTEMPTS", DEFAULT_MAX_RECONNECT_ATTEMPTS),
            initial_delay: Duration::from_millis(env_parse("ROOMSTREAM_INITIAL_DELAY_MS", DEFAULT_INITIAL_DELAY_MS)),
            max_delay: Duration::from_millis(env_parse("ROOMSTREAM_MAX_DELAY_MS", DEFAULT_MAX_DELAY_MS)),
        };

        Ok(Self {
            rooms,
            api_key: std::env::var("ROOMSTREAM_API_KEY").unwrap_or_else(|_| DEFAULT_API_KEY.to_string()),
            user_agent: std::env::var("ROOMSTREAM_USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            origin,
            base_url,
            stream_url,
            reconnect,
            refresh_interval: Duration::from_secs(env_parse(
                "ROOMSTREAM_REFRESH_INTERVAL_SECS",
                DEFAULT_REFRESH_INTERVAL_SECS,
            )),
            timeouts: HttpTimeouts {
                request_secs: env_parse("ROOMSTREAM_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS),
                connect_secs: env_parse("ROOMSTREAM_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
            },
            event_capacity: env_parse("ROOMSTREAM_EVENT_CAPACITY", DEFAULT_EVENT_CAPACITY).max(1),
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_rooms(raw: Option<&str>) -> Result<Vec<String>, ChannelError> {
    let rooms: Vec<String> = raw
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(ToString::to_string)
        .collect();
    if rooms.is_empty() {
        return Err(ChannelError::Config("ROOMSTREAM_ROOMS must name at least one room".into()));
    }
    Ok(rooms)
}

fn parse_url(key: &str, default: &str) -> Result<String, ChannelError> {
    let url = std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .trim_end_matches('/')
        .to_string();
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(ChannelError::Config(format!("{key} must be an http(s) URL, got '{url}'")));
    }
    Ok(url)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
