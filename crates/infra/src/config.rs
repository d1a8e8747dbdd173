//! Configuration loading from the process environment.

use std::time::Duration;

use thiserror::Error;

use crate::jobs::SweeperConfig;

pub const DEFAULT_MONGODB_URI: &str = "mongodb://localhost:27017";
pub const DEFAULT_DATABASE: &str = "taskbroker";
pub const DEFAULT_COLLECTION: &str = "jobs";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be a non-negative integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("{key} must not be zero")]
    Zero { key: &'static str },
}

/// Queue deployment settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub mongodb_uri: String,
    pub database: String,
    pub collection: String,
    pub stale_threshold: Duration,
    /// `None` when `RETENTION_DAYS=0`.
    pub retention: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mongodb_uri: DEFAULT_MONGODB_URI.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            stale_threshold: Duration::from_secs(300),
            retention: Some(days(30)),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl QueueConfig {
    /// Read `MONGODB_URI`, `MONGODB_DATABASE`, `JOBS_COLLECTION`,
    /// `STALE_THRESHOLD_SECS`, `RETENTION_DAYS` and `SWEEP_INTERVAL_SECS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`QueueConfig::from_env`], reading values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let number = |key: &'static str| -> Result<Option<u64>, ConfigError> {
            lookup(key)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .map_err(|_| ConfigError::InvalidNumber { key, value })
                })
                .transpose()
        };

        let stale_threshold = match number("STALE_THRESHOLD_SECS")? {
            Some(0) => return Err(ConfigError::Zero { key: "STALE_THRESHOLD_SECS" }),
            Some(secs) => Duration::from_secs(secs),
            None => defaults.stale_threshold,
        };
        let sweep_interval = match number("SWEEP_INTERVAL_SECS")? {
            Some(0) => return Err(ConfigError::Zero { key: "SWEEP_INTERVAL_SECS" }),
            Some(secs) => Duration::from_secs(secs),
            None => defaults.sweep_interval,
        };
        let retention = match number("RETENTION_DAYS")? {
            Some(0) => None,
            Some(n) => Some(days(n)),
            None => defaults.retention,
        };

        Ok(Self {
            mongodb_uri: lookup("MONGODB_URI").unwrap_or(defaults.mongodb_uri),
            database: lookup("MONGODB_DATABASE").unwrap_or(defaults.database),
            collection: lookup("JOBS_COLLECTION").unwrap_or(defaults.collection),
            stale_threshold,
            retention,
            sweep_interval,
        })
    }

    pub fn sweeper(&self) -> SweeperConfig {
        SweeperConfig {
            stale_threshold: self.stale_threshold,
            retention: self.retention,
            interval: self.sweep_interval,
        }
    }
}

fn days(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(24 * 60 * 60))
}
