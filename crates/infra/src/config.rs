//! Scheduler configuration.
//!
//! Defaults can be overridden through `JOBTRACK_*` environment variables;
//! durations are given in milliseconds.

use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::jobs::RetryPolicy;

pub const ENV_QUEUE_CAPACITY: &str = "JOBTRACK_QUEUE_CAPACITY";
pub const ENV_POLL_INTERVAL_MS: &str = "JOBTRACK_POLL_INTERVAL_MS";
pub const ENV_MAX_RETRIES: &str = "JOBTRACK_MAX_RETRIES";
pub const ENV_BACKOFF_UNIT_MS: &str = "JOBTRACK_BACKOFF_UNIT_MS";
pub const ENV_PROBE_TIMEOUT_MS: &str = "JOBTRACK_PROBE_TIMEOUT_MS";
pub const ENV_SUBMIT_TIMEOUT_MS: &str = "JOBTRACK_SUBMIT_TIMEOUT_MS";
pub const ENV_WORKERS: &str = "JOBTRACK_WORKERS";

/// Upper bound for every configured duration.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is not valid: {reason}")]
    Parse {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerConfig {
    /// Name for logging
    pub name: String,
    /// Maximum number of tracked tasks
    pub queue_capacity: usize,
    /// Period of the backlog sweep
    pub poll_interval: Duration,
    pub max_retries: u32,
    /// Base of the exponential backoff
    pub backoff_unit: Duration,
    pub probe_timeout: Duration,
    pub submit_timeout: Duration,
    /// Number of worker loops
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "jobtrack".to_string(),
            queue_capacity: 100,
            poll_interval: Duration::from_secs(5),
            max_retries: 3,
            backoff_unit: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
            submit_timeout: Duration::from_secs(30),
            workers: 1,
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `JOBTRACK_*` key.
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_key(&mut lookup, ENV_QUEUE_CAPACITY)? {
            config.queue_capacity = v;
        }
        if let Some(ms) = parse_key(&mut lookup, ENV_POLL_INTERVAL_MS)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(v) = parse_key(&mut lookup, ENV_MAX_RETRIES)? {
            config.max_retries = v;
        }
        if let Some(ms) = parse_key(&mut lookup, ENV_BACKOFF_UNIT_MS)? {
            config.backoff_unit = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_key(&mut lookup, ENV_PROBE_TIMEOUT_MS)? {
            config.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_key(&mut lookup, ENV_SUBMIT_TIMEOUT_MS)? {
            config.submit_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = parse_key(&mut lookup, ENV_WORKERS)? {
            config.workers = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn bounded(field: &'static str, d: Duration) -> Result<(), ConfigError> {
            if d.is_zero() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
            if d > MAX_DURATION {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("must not exceed {}ms", MAX_DURATION.as_millis()),
                });
            }
            Ok(())
        }

        self.capacity()?;
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "workers",
                reason: "at least one worker is required".to_string(),
            });
        }
        bounded("poll_interval", self.poll_interval)?;
        bounded("backoff_unit", self.backoff_unit)?;
        bounded("probe_timeout", self.probe_timeout)?;
        bounded("submit_timeout", self.submit_timeout)?;
        Ok(())
    }

    pub fn capacity(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.queue_capacity).ok_or_else(|| ConfigError::Invalid {
            field: "queue_capacity",
            reason: "must be greater than zero".to_string(),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.backoff_unit)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

fn parse_key<T, F>(lookup: &mut F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Parse {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        })
}
