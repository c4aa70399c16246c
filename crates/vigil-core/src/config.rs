//! Configuration for the notification substrate.
//!
//! Loaded once at process startup, typically from a TOML file under the
//! `notify` namespace of the application configuration. All fields have
//! defaults; an empty configuration yields a working substrate with push
//! notifications disabled.

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML for this schema.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration for the notification substrate.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyConfig {
    /// Cache sizing and lifetimes.
    #[serde(default)]
    pub caches: CachesConfig,

    /// Push notification settings.
    #[serde(default)]
    pub push: PushConfig,
}

impl NotifyConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not parse.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

/// Cache configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CachesConfig {
    /// The in-flight poll cache.
    #[serde(default)]
    pub poll: PollCacheConfig,

    /// The poll result cache.
    #[serde(default)]
    pub poll_result: PollResultCacheConfig,
}

/// Configuration for the in-flight poll cache.
///
/// The capacity doubles as a hard ceiling on concurrent distinct polling
/// operations in this process; exceeding it rejects the poll outright.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollCacheConfig {
    /// Maximum number of concurrent in-flight polls.
    #[serde(default = "default_poll_max")]
    pub max: usize,
}

const fn default_poll_max() -> usize {
    10_000
}

impl Default for PollCacheConfig {
    fn default() -> Self {
        Self {
            max: default_poll_max(),
        }
    }
}

/// Configuration for the poll result cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollResultCacheConfig {
    /// Result cache capacity.
    #[serde(default = "default_poll_result_max")]
    pub max: usize,

    /// Default time-to-live for a cached mutable result. Terminal results
    /// are held for longer regardless of this setting.
    #[serde(default = "default_poll_result_ttl")]
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

const fn default_poll_result_max() -> usize {
    100
}

const fn default_poll_result_ttl() -> Duration {
    Duration::from_secs(30)
}

impl Default for PollResultCacheConfig {
    fn default() -> Self {
        Self {
            max: default_poll_result_max(),
            ttl: default_poll_result_ttl(),
        }
    }
}

/// Push notification configuration.
///
/// When `hmac_key` is absent, push-token operations are unavailable and the
/// substrate runs in poll-only mode.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PushConfig {
    /// The process-wide HMAC key for push tokens.
    #[serde(default)]
    pub hmac_key: Option<HmacKeyConfig>,
}

/// An HMAC key reference.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HmacKeyConfig {
    /// Opaque key identifier.
    pub id: String,

    /// The secret key material as a multibase-`u` multikey string.
    ///
    /// Never logged; held behind [`SecretString`] so accidental `Debug`
    /// output does not expose it.
    pub secret_key_multibase: SecretString,
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
