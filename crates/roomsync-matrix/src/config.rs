//! Environment-backed configuration for the sync client.

use std::{env, fmt, time::Duration};

use roomsync_core::{FaultPolicy, RetryPolicy, SyncConfig};
use thiserror::Error;
use url::Url;

use crate::http::{DEFAULT_MAX_RATE_LIMIT_RETRIES, DEFAULT_RATE_LIMIT_WAIT_MS, HttpTransportConfig};

const DEFAULT_USER_AGENT: &str = concat!("roomsync/", env!("CARGO_PKG_VERSION"));

/// Everything needed to build an [`crate::HttpTransport`] and a [`crate::SyncClient`].
#[derive(Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL of the homeserver.
    pub homeserver: Url,
    pub access_token: String,
    pub user_agent: String,
    /// Wait applied to an HTTP 429 that carries no `retry_after_ms`.
    pub rate_limit_wait_ms: u64,
    /// In-place 429 retries before the error reaches the poll loop.
    pub max_rate_limit_retries: u32,
    pub sync: SyncConfig,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("homeserver", &self.homeserver.as_str())
            .field("access_token", &"<redacted>")
            .field("user_agent", &self.user_agent)
            .field("rate_limit_wait_ms", &self.rate_limit_wait_ms)
            .field("max_rate_limit_retries", &self.max_rate_limit_retries)
            .field("sync", &self.sync)
            .finish()
    }
}

impl ClientConfig {
    /// Config with defaults for everything but the endpoint and credentials.
    pub fn new(homeserver: Url, access_token: impl Into<String>) -> Self {
        Self {
            homeserver,
            access_token: access_token.into(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            rate_limit_wait_ms: DEFAULT_RATE_LIMIT_WAIT_MS,
            max_rate_limit_retries: DEFAULT_MAX_RATE_LIMIT_RETRIES,
            sync: SyncConfig::default(),
        }
    }

    /// Parse configuration from `ROOMSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let homeserver = required_trimmed_env("ROOMSYNC_HOMESERVER", &mut lookup)?;
        let homeserver = parse_homeserver(homeserver)?;
        let access_token = required_trimmed_env("ROOMSYNC_ACCESS_TOKEN", &mut lookup)?;

        let mut config = Self::new(homeserver, access_token);
        let defaults = SyncConfig::default();

        let wait_timeout_ms = parse_optional_u64_with_default(
            "ROOMSYNC_SYNC_TIMEOUT_MS",
            u64::try_from(defaults.wait_timeout.as_millis()).unwrap_or(u64::MAX),
            &mut lookup,
        )?;
        let timeline_limit = parse_optional_u32_with_default(
            "ROOMSYNC_TIMELINE_LIMIT",
            defaults.timeline_limit,
            &mut lookup,
        )?;
        let event_history_limit = parse_optional_usize(
            "ROOMSYNC_EVENT_HISTORY_LIMIT",
            defaults.event_history_limit,
            &mut lookup,
        )?;
        let backoff_base_ms = parse_optional_u64_with_default(
            "ROOMSYNC_BACKOFF_BASE_MS",
            defaults.retry.base_delay_ms(),
            &mut lookup,
        )?;
        let backoff_limit_ms = parse_optional_u64_with_default(
            "ROOMSYNC_BACKOFF_LIMIT_MS",
            defaults.retry.max_delay_ms(),
            &mut lookup,
        )?;
        config.rate_limit_wait_ms = parse_optional_u64_with_default(
            "ROOMSYNC_RATE_LIMIT_WAIT_MS",
            config.rate_limit_wait_ms,
            &mut lookup,
        )?;
        config.max_rate_limit_retries = parse_optional_u32_with_default(
            "ROOMSYNC_MAX_RATE_LIMIT_RETRIES",
            config.max_rate_limit_retries,
            &mut lookup,
        )?;
        let fault_policy = match optional_trimmed_env("ROOMSYNC_FAULT_POLICY", &mut lookup) {
            None => defaults.fault_policy,
            Some(value) => {
                FaultPolicy::parse(&value).ok_or_else(|| ConfigError::InvalidValue {
                    key: "ROOMSYNC_FAULT_POLICY",
                    value,
                    reason: "expected 'propagate' or 'isolate'".to_owned(),
                })?
            }
        };
        let set_presence = match optional_trimmed_env("ROOMSYNC_SET_PRESENCE", &mut lookup) {
            None => None,
            Some(value) if matches!(value.as_str(), "online" | "offline" | "unavailable") => {
                Some(value)
            }
            Some(value) => {
                return Err(ConfigError::InvalidValue {
                    key: "ROOMSYNC_SET_PRESENCE",
                    value,
                    reason: "expected 'online', 'offline' or 'unavailable'".to_owned(),
                });
            }
        };

        if timeline_limit == 0 {
            return Err(at_least_one("ROOMSYNC_TIMELINE_LIMIT"));
        }
        if event_history_limit == 0 {
            return Err(at_least_one("ROOMSYNC_EVENT_HISTORY_LIMIT"));
        }
        if backoff_base_ms == 0 {
            return Err(at_least_one("ROOMSYNC_BACKOFF_BASE_MS"));
        }
        if backoff_limit_ms < backoff_base_ms {
            return Err(ConfigError::InvalidValue {
                key: "ROOMSYNC_BACKOFF_LIMIT_MS",
                value: backoff_limit_ms.to_string(),
                reason: format!("must not be below ROOMSYNC_BACKOFF_BASE_MS ({backoff_base_ms})"),
            });
        }

        config.sync = SyncConfig {
            wait_timeout: Duration::from_millis(wait_timeout_ms),
            timeline_limit,
            event_history_limit,
            retry: RetryPolicy::new(backoff_base_ms, backoff_limit_ms),
            fault_policy,
            set_presence,
            ..defaults
        };
        Ok(config)
    }

    /// Transport settings derived from this config.
    pub fn transport_config(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            homeserver: self.homeserver.clone(),
            access_token: self.access_token.clone(),
            user_agent: self.user_agent.clone(),
            rate_limit_wait: Duration::from_millis(self.rate_limit_wait_ms),
            max_rate_limit_retries: self.max_rate_limit_retries,
        }
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required environment variable is unset or blank.
    #[error("missing required {key}")]
    Missing { key: &'static str },
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn at_least_one(key: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: "0".to_owned(),
        reason: "must be at least 1".to_owned(),
    }
}

fn parse_homeserver(value: String) -> Result<Url, ConfigError> {
    let url = Url::parse(&value).map_err(|err| ConfigError::InvalidValue {
        key: "ROOMSYNC_HOMESERVER",
        value: value.clone(),
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidValue {
            key: "ROOMSYNC_HOMESERVER",
            value,
            reason: "scheme must be http or https".to_owned(),
        });
    }
    Ok(url)
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn required_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    optional_trimmed_env(key, lookup).ok_or(ConfigError::Missing { key })
}

fn parse_optional_u32<F>(key: &'static str, lookup: &mut F) -> Result<Option<u32>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u32>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_usize<F>(
    key: &'static str,
    default: usize,
    lookup: &mut F,
) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<usize>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u32_with_default<F>(
    key: &'static str,
    default: u32,
    lookup: &mut F,
) -> Result<u32, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    Ok(parse_optional_u32(key, lookup)?.unwrap_or(default))
}

fn parse_optional_u64_with_default<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    Ok(parse_optional_u64(key, lookup)?.unwrap_or(default))
}
