//! QueueConfig - 実行時パラメータ
//!
//! 環境変数から読む。未設定ならデフォルト、パースできなければ Config エラー。

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::{QueueError, Result};

pub const ENV_LOCK_TIMEOUT: &str = "QUEUE_LOCK_TIMEOUT_SECONDS";
pub const ENV_POLL_INTERVAL: &str = "QUEUE_POLL_INTERVAL_SECONDS";
pub const ENV_CONCURRENCY: &str = "QUEUE_CONCURRENCY";
pub const ENV_MAX_ATTEMPTS: &str = "QUEUE_MAX_ATTEMPTS";
pub const ENV_HINT_TIMEOUT: &str = "QUEUE_HINT_TIMEOUT_SECONDS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// A RUNNING lease older than this is treated as abandoned at startup.
    pub lease_timeout_secs: u64,

    /// Idle wait while globally paused, and after a store error.
    pub poll_interval_secs: f64,

    /// Number of workers (at least 1).
    pub concurrency: usize,

    /// Attempt budget when the payload does not carry `max_attempts`.
    pub default_max_attempts: u32,

    /// How long a worker waits on the hint channel before polling the store.
    pub hint_timeout_secs: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout_secs: 600,
            poll_interval_secs: 0.5,
            concurrency: 1,
            default_max_attempts: 3,
            hint_timeout_secs: 0.5,
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; missing keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = lookup(ENV_LOCK_TIMEOUT) {
            config.lease_timeout_secs = parse(ENV_LOCK_TIMEOUT, &v)?;
        }
        if let Some(v) = lookup(ENV_POLL_INTERVAL) {
            config.poll_interval_secs = parse(ENV_POLL_INTERVAL, &v)?;
        }
        if let Some(v) = lookup(ENV_CONCURRENCY) {
            config.concurrency = parse(ENV_CONCURRENCY, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_ATTEMPTS) {
            config.default_max_attempts = parse(ENV_MAX_ATTEMPTS, &v)?;
        }
        if let Some(v) = lookup(ENV_HINT_TIMEOUT) {
            config.hint_timeout_secs = parse(ENV_HINT_TIMEOUT, &v)?;
        }
        config.validate()
    }

    /// Clamp concurrency to 1 and reject zero, negative or non-finite intervals.
    /// A zero poll interval with a zero hint timeout would spin an idle worker.
    pub fn validate(mut self) -> Result<Self> {
        self.concurrency = self.concurrency.max(1);
        for (name, secs) in [
            (ENV_POLL_INTERVAL, self.poll_interval_secs),
            (ENV_HINT_TIMEOUT, self.hint_timeout_secs),
        ] {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(QueueError::config(format!(
                    "{name} must be a positive number of seconds, got {secs}"
                )));
            }
        }
        Ok(self)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn hint_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.hint_timeout_secs)
    }
}

fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| QueueError::config(format!("{key}: cannot parse {raw:?}")))
}
