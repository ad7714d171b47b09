//! Engine and runner configuration.

use ayumi_core::DEFAULT_EVENT_CAPACITY;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Error returned when a configuration value is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub &'static str);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Settings of the throttled runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Longest stretch of synchronously completing steps before a forced
    /// yield.
    pub interval: Duration,
    /// Length of the forced yield.
    pub delay: Duration,
}

impl ThrottleConfig {
    /// Creates a validated throttle configuration.
    pub fn new(interval: Duration, delay: Duration) -> Result<Self, ConfigError> {
        let config = Self { interval, delay };
        config.validate()?;
        Ok(config)
    }

    /// Checks the values; useful after deserializing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delay.is_zero() {
            return Err(ConfigError("throttle delay must be greater than 0"));
        }
        if self.interval.is_zero() {
            return Err(ConfigError("throttle interval must be greater than 0"));
        }
        Ok(())
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            delay: Duration::from_millis(1),
        }
    }
}

/// Settings shared by machines and runners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ring buffer size of every event bus (per machine and fan-in).
    pub event_capacity: usize,
    /// Throttled runner settings.
    pub throttle: ThrottleConfig,
}

impl EngineConfig {
    /// Checks the values; useful after deserializing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_capacity == 0 {
            return Err(ConfigError("event capacity must be greater than 0"));
        }
        self.throttle.validate()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            throttle: ThrottleConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.event_capacity, 1024);
        assert_eq!(config.throttle.interval, Duration::from_millis(50));
        assert_eq!(config.throttle.delay, Duration::from_millis(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"event_capacity": 16}"#).expect("valid json");
        assert_eq!(config.event_capacity, 16);
        assert_eq!(config.throttle, ThrottleConfig::default());

        let throttle: ThrottleConfig =
            serde_json::from_str(r#"{"interval": {"secs": 0, "nanos": 1000000}}"#)
                .expect("valid json");
        assert_eq!(throttle.interval, Duration::from_millis(1));
        assert_eq!(throttle.delay, Duration::from_millis(1));
    }

    #[test]
    fn test_validation() {
        assert!(ThrottleConfig::new(Duration::from_millis(1), Duration::ZERO).is_err());
        assert!(ThrottleConfig::new(Duration::ZERO, Duration::from_millis(1)).is_err());

        let config = EngineConfig {
            event_capacity: 0,
            ..EngineConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError("event capacity must be greater than 0"))
        );
    }
}
