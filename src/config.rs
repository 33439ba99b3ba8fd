//! Configuration management for the transfer relay

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::transfer::{
    DEFAULT_CHUNK_SIZE, DEFAULT_EXPIRY_MINUTES, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_TOPIC_PREFIX,
};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub transfer: TransferConfig,
    pub broker: BrokerConfig,
    pub reaper: ReaperConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    pub chunk_size_bytes: u64,
    /// Upper bound on the chunk size a registration may request
    pub max_chunk_size_bytes: u64,
    pub expires_in_minutes: i64,
    pub topic_prefix: String,
    /// Tombstone packets once a download completes
    pub purge_on_completion: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub publish_max_retries: u32,
    pub publish_backoff_ms: u64,
    pub publish_backoff_max_ms: u64,
    /// How long the consumer waits for the next record in a range
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            max_chunk_size_bytes: DEFAULT_MAX_CHUNK_SIZE,
            expires_in_minutes: DEFAULT_EXPIRY_MINUTES,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            purge_on_completion: true,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            publish_max_retries: 5,
            publish_backoff_ms: 100,
            publish_backoff_max_ms: 5_000,
            read_timeout_ms: 2_000,
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:./transfers.db".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            transfer: TransferConfig::default(),
            broker: BrokerConfig::default(),
            reaper: ReaperConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Config {
    /// Read the process environment; unset variables fall back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let config = Config {
            transfer: TransferConfig {
                chunk_size_bytes: parse(&lookup, "TRANSFER_CHUNK_SIZE_BYTES", defaults.transfer.chunk_size_bytes)?,
                max_chunk_size_bytes: parse(&lookup, "TRANSFER_MAX_CHUNK_SIZE_BYTES", defaults.transfer.max_chunk_size_bytes)?,
                expires_in_minutes: parse(&lookup, "TRANSFER_EXPIRES_IN_MINUTES", defaults.transfer.expires_in_minutes)?,
                topic_prefix: lookup("TRANSFER_TOPIC_PREFIX").unwrap_or(defaults.transfer.topic_prefix),
                purge_on_completion: parse_bool(&lookup, "TRANSFER_PURGE_ON_COMPLETION", defaults.transfer.purge_on_completion)?,
            },
            broker: BrokerConfig {
                publish_max_retries: parse(&lookup, "BROKER_PUBLISH_MAX_RETRIES", defaults.broker.publish_max_retries)?,
                publish_backoff_ms: parse(&lookup, "BROKER_PUBLISH_BACKOFF_MS", defaults.broker.publish_backoff_ms)?,
                publish_backoff_max_ms: parse(&lookup, "BROKER_PUBLISH_BACKOFF_MAX_MS", defaults.broker.publish_backoff_max_ms)?,
                read_timeout_ms: parse(&lookup, "BROKER_READ_TIMEOUT_MS", defaults.broker.read_timeout_ms)?,
            },
            reaper: ReaperConfig {
                interval_secs: parse(&lookup, "REAPER_INTERVAL_SECS", defaults.reaper.interval_secs)?,
            },
            database: DatabaseConfig {
                url: lookup("DATABASE_URL").unwrap_or(defaults.database.url),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let zero = |key: &'static str| ConfigError::Invalid {
            key,
            value: "0".into(),
            reason: "must be greater than zero".into(),
        };

        if self.transfer.chunk_size_bytes == 0 {
            return Err(zero("TRANSFER_CHUNK_SIZE_BYTES"));
        }
        if self.reaper.interval_secs == 0 {
            return Err(zero("REAPER_INTERVAL_SECS"));
        }
        if self.broker.read_timeout_ms == 0 {
            return Err(zero("BROKER_READ_TIMEOUT_MS"));
        }
        if self.transfer.chunk_size_bytes > self.transfer.max_chunk_size_bytes {
            return Err(ConfigError::Invalid {
                key: "TRANSFER_CHUNK_SIZE_BYTES",
                value: self.transfer.chunk_size_bytes.to_string(),
                reason: "must not exceed TRANSFER_MAX_CHUNK_SIZE_BYTES".into(),
            });
        }
        if self.transfer.expires_in_minutes <= 0 {
            return Err(ConfigError::Invalid {
                key: "TRANSFER_EXPIRES_IN_MINUTES",
                value: self.transfer.expires_in_minutes.to_string(),
                reason: "must be greater than zero".into(),
            });
        }

        if self.transfer.topic_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "TRANSFER_TOPIC_PREFIX",
                value: self.transfer.topic_prefix.clone(),
                reason: "cannot be empty".into(),
            });
        }

        if self.broker.publish_backoff_max_ms < self.broker.publish_backoff_ms {
            return Err(ConfigError::Invalid {
                key: "BROKER_PUBLISH_BACKOFF_MAX_MS",
                value: self.broker.publish_backoff_max_ms.to_string(),
                reason: "must not be below BROKER_PUBLISH_BACKOFF_MS".into(),
            });
        }

        Ok(())
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().parse() {
            Ok(value) => Ok(value),
            Err(e) => Err(ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value: raw,
            }),
        },
    }
}

fn parse_bool<F>(lookup: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value: raw,
                reason: "expected true or false".into(),
            }),
        },
    }
}
