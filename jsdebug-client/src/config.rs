// Client configuration
//
// Defaults can be overridden from the environment

use crate::rendezvous::DEFAULT_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const ENV_EVALUATE_TIMEOUT_MS: &str = "JSDEBUG_EVALUATE_TIMEOUT_MS";
pub const ENV_EVENT_BUFFER: &str = "JSDEBUG_EVENT_BUFFER";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Upper bound on how long `evaluate_sync` blocks
    pub evaluate_timeout_ms: u64,
    /// Capacity of the inbound event channel
    pub event_buffer: usize,
    /// Capacity of the outbound transport channel
    pub outgoing_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            evaluate_timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            // Pause events must not be dropped under load
            event_buffer: 256,
            outgoing_buffer: 32,
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with any `JSDEBUG_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_EVALUATE_TIMEOUT_MS) {
            config.evaluate_timeout_ms = parse_positive(ENV_EVALUATE_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_EVENT_BUFFER) {
            config.event_buffer = parse_positive(ENV_EVENT_BUFFER, &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the session cannot run with. Deserialized and hand-built
    /// configs skip the environment parser, so `DebugSession::start` calls this.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("evaluate_timeout_ms", self.evaluate_timeout_ms)?;
        require_positive("event_buffer", self.event_buffer)?;
        require_positive("outgoing_buffer", self.outgoing_buffer)?;
        Ok(())
    }

    pub fn evaluate_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluate_timeout_ms)
    }

    pub fn with_evaluate_timeout(mut self, timeout: Duration) -> Self {
        self.evaluate_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

fn parse_positive<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let invalid = |reason: String| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
        reason,
    };

    let value: T = raw.trim().parse().map_err(|e: T::Err| invalid(e.to_string()))?;
    if value <= T::default() {
        return Err(invalid("must be greater than zero".to_string()));
    }
    Ok(value)
}

fn require_positive<T>(key: &'static str, value: T) -> Result<(), ConfigError>
where
    T: PartialOrd + Default + ToString,
{
    if value <= T::default() {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}
