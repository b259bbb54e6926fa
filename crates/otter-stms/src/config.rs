//! Collector tuning.
//!
//! Thresholds are fixed once a [`GcCoordinator`](crate::GcCoordinator) is built and are read
//! concurrently by every mutator's probes.

use std::time::Duration;

use crate::error::{GcError, GcResult};

/// Selects the aggressive profile as the base configuration
pub const ENV_AGGRESSIVE: &str = "OTTER_GC_AGGRESSIVE";
/// Overrides [`GcConfig::safepoint_threshold`]
pub const ENV_SAFEPOINT_THRESHOLD: &str = "OTTER_GC_SAFEPOINT_THRESHOLD";
/// Overrides [`GcConfig::allocation_threshold_bytes`]
pub const ENV_ALLOCATION_THRESHOLD: &str = "OTTER_GC_ALLOCATION_THRESHOLD";
/// Overrides [`GcConfig::cooldown`], in microseconds
pub const ENV_COOLDOWN_US: &str = "OTTER_GC_COOLDOWN_US";

/// GC configuration
///
/// # Example
///
/// ```
/// use otter_stms::GcConfig;
/// use std::time::Duration;
///
/// let config = GcConfig {
///     cooldown: Duration::from_millis(50),
///     ..GcConfig::default()
/// };
/// assert_eq!(config.safepoint_threshold, 100_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcConfig {
    /// Weighted safepoint visits per thread before that thread asks for a collection.
    ///
    /// Default: 100_000 (roughly one collection per 10ms of busy mutator)
    pub safepoint_threshold: usize,

    /// Bytes a thread may allocate before its allocation probe asks for a collection.
    ///
    /// Default: 10MiB
    pub allocation_threshold_bytes: usize,

    /// Minimum time between two safepoint-triggered collections from the same thread.
    /// Allocation and out-of-memory triggers ignore it.
    ///
    /// Default: 200ms
    pub cooldown: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            safepoint_threshold: 100_000,
            allocation_threshold_bytes: 10 * 1024 * 1024,
            cooldown: Duration::from_millis(200),
        }
    }
}

impl GcConfig {
    /// Stress-testing profile: collect very often, never wait for cooldown.
    pub fn aggressive() -> Self {
        Self {
            safepoint_threshold: 1_000,
            allocation_threshold_bytes: 10_000,
            cooldown: Duration::ZERO,
        }
    }

    /// Build a configuration from `OTTER_GC_*` environment variables.
    pub fn from_env() -> GcResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// The aggressive flag picks the base profile; individual keys then override it.
    pub fn from_lookup<F>(lookup: F) -> GcResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(ENV_AGGRESSIVE) {
            Some(value) if parse_flag(ENV_AGGRESSIVE, &value)? => Self::aggressive(),
            _ => Self::default(),
        };

        if let Some(value) = lookup(ENV_SAFEPOINT_THRESHOLD) {
            config.safepoint_threshold = parse_number(ENV_SAFEPOINT_THRESHOLD, &value)? as usize;
        }
        if let Some(value) = lookup(ENV_ALLOCATION_THRESHOLD) {
            config.allocation_threshold_bytes =
                parse_number(ENV_ALLOCATION_THRESHOLD, &value)? as usize;
        }
        if let Some(value) = lookup(ENV_COOLDOWN_US) {
            config.cooldown = Duration::from_micros(parse_number(ENV_COOLDOWN_US, &value)?);
        }

        Ok(config)
    }
}

fn parse_flag(key: &'static str, value: &str) -> GcResult<bool> {
    match value.trim() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(GcError::InvalidConfig {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_number(key: &'static str, value: &str) -> GcResult<u64> {
    value.trim().parse().map_err(|_| GcError::InvalidConfig {
        key,
        value: value.to_string(),
    })
}
