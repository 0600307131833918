//! Engine configuration.
//!
//! Loaded from TOML. Every field has a default, so an empty file is a valid
//! configuration. Durations use humantime syntax (`"30s"`, `"5m"`, `"1h30m"`).
//!
//! ```toml
//! shards = 4
//! group_retention = "10m"
//! operator_id = "claw-router"
//!
//! [retry]
//! initial_delay = "500ms"
//! max_attempts = 5
//!
//! [[time_intervals]]
//! name = "weekends"
//! [[time_intervals.time_intervals]]
//! weekdays = ["saturday:sunday"]
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RoutingError};
use crate::mute::{MuteResolver, StaticIntervalRegistry, TimeIntervalSpec};

/// Backoff policy for notification delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the second attempt.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Total attempts per notification, first attempt included.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64)
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Routing engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of group shards.
    pub shards: usize,
    /// Capacity of each shard's inbound queue.
    pub queue_capacity: usize,
    /// How long an empty group is kept to absorb flapping alerts.
    #[serde(with = "humantime_serde")]
    pub group_retention: Duration,
    /// Hard cap on groups per shard. At the cap a shard releases its empty
    /// groups early; if none are empty, alerts for new groups are dropped
    /// with a warning.
    pub max_groups_per_shard: usize,
    /// Key under which status is written to the tree resource.
    pub operator_id: String,
    /// Only trees with this name are applied; any name when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree_name: Option<String>,
    /// Delivery backoff.
    pub retry: RetryConfig,
    /// Mute time interval definitions.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub time_intervals: Vec<TimeIntervalSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shards: std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get),
            queue_capacity: 1024,
            group_retention: Duration::from_secs(5 * 60),
            max_groups_per_shard: 10_000,
            operator_id: "claw-router".to_string(),
            tree_name: None,
            retry: RetryConfig::default(),
            time_intervals: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RoutingError::config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| RoutingError::config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::Config` for the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 {
            return Err(RoutingError::config("shards must be greater than 0"));
        }
        if self.queue_capacity == 0 {
            return Err(RoutingError::config("queue_capacity must be greater than 0"));
        }
        if self.max_groups_per_shard == 0 {
            return Err(RoutingError::config("max_groups_per_shard must be greater than 0"));
        }
        if self.operator_id.is_empty() {
            return Err(RoutingError::config("operator_id cannot be empty"));
        }
        if self.retry.max_attempts == 0 {
            return Err(RoutingError::config("retry.max_attempts must be greater than 0"));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(RoutingError::config("retry.multiplier must be at least 1.0"));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(RoutingError::config("retry.initial_delay cannot exceed retry.max_delay"));
        }
        StaticIntervalRegistry::from_specs(&self.time_intervals)?;
        Ok(())
    }

    /// Builds the mute resolver for the configured intervals.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::Config` if an interval definition is invalid.
    pub fn mute_resolver(&self) -> Result<MuteResolver> {
        let registry = StaticIntervalRegistry::from_specs(&self.time_intervals)?;
        Ok(MuteResolver::new(Arc::new(registry)))
    }
}
