//! Resilience Configuration Profiles
//!
//! Bundles every component configuration into one [`ResilienceConfig`] and
//! ships four named profiles with sensible defaults for common deployment
//! shapes. Profiles are selectable by name, so hosts can wire them straight
//! from an environment variable or CLI flag.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::history::{HistoryConfig, TokenEstimator, TruncationStrategy};
use crate::retry::RetryPolicy;
use crate::timeout::TimeoutConfig;

/// Errors from profile selection
#[derive(Debug, Clone, Error)]
pub enum ProfileError {
    #[error("Unknown resilience profile: {name}")]
    Unknown { name: String },
}

/// Configuration for the full resilience pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Retry policy configuration
    pub retry: RetryPolicy,

    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,

    /// Timeout configuration
    pub timeout: TimeoutConfig,

    /// History configuration
    pub history: HistoryConfig,

    /// Run validation on successful results
    pub enable_validation: bool,

    /// Apply registered fallbacks when validation fails
    pub enable_fallbacks: bool,

    /// Interval for background window and sample pruning
    pub maintenance_interval: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            timeout: TimeoutConfig::default(),
            history: HistoryConfig::default(),
            enable_validation: true,
            enable_fallbacks: true,
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

impl ResilienceConfig {
    /// Balanced defaults for normal production traffic
    pub fn production() -> Self {
        Self {
            history: HistoryConfig {
                token_estimator: TokenEstimator::Advanced,
                ..HistoryConfig::default()
            },
            ..Self::default()
        }
    }

    /// Fast feedback for local work: short delays, no jitter, no fallback
    /// substitution so problems stay visible
    pub fn development() -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(5),
                jitter_enabled: false,
                ..RetryPolicy::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_secs(5),
                monitoring_period: Duration::from_secs(30),
                success_threshold: 1,
            },
            timeout: TimeoutConfig {
                default_timeout: Duration::from_secs(10),
                min_timeout: Duration::from_secs(1),
                max_timeout: Duration::from_secs(60),
                enable_adaptive_timeout: false,
                grace_period: Duration::from_secs(2),
                ..TimeoutConfig::default()
            },
            history: HistoryConfig {
                max_tokens: 2000,
                max_messages: 20,
                preserve_recent_messages: 3,
                ..HistoryConfig::default()
            },
            enable_validation: true,
            enable_fallbacks: false,
            maintenance_interval: Duration::from_secs(10),
        }
    }

    /// Maximum protection for traffic that must not be dropped: more
    /// attempts, earlier circuit trips, longer deadlines
    pub fn critical() -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
                ..RetryPolicy::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_secs(60),
                monitoring_period: Duration::from_secs(120),
                success_threshold: 5,
            },
            timeout: TimeoutConfig {
                default_timeout: Duration::from_secs(60),
                min_timeout: Duration::from_secs(10),
                max_timeout: Duration::from_secs(600),
                timeout_multiplier: 1.5,
                enable_adaptive_timeout: true,
                grace_period: Duration::from_secs(30),
            },
            history: HistoryConfig {
                max_tokens: 8000,
                max_messages: 100,
                preserve_recent_messages: 10,
                truncation_strategy: TruncationStrategy::Middle,
                token_estimator: TokenEstimator::Advanced,
                ..HistoryConfig::default()
            },
            enable_validation: true,
            enable_fallbacks: true,
            maintenance_interval: Duration::from_secs(15),
        }
    }

    /// Minimal overhead for cheap, high-volume calls
    pub fn lightweight() -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(2),
                jitter_enabled: false,
                ..RetryPolicy::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 10,
                recovery_timeout: Duration::from_secs(10),
                monitoring_period: Duration::from_secs(30),
                success_threshold: 1,
            },
            timeout: TimeoutConfig {
                default_timeout: Duration::from_secs(10),
                min_timeout: Duration::from_secs(2),
                max_timeout: Duration::from_secs(30),
                enable_adaptive_timeout: false,
                grace_period: Duration::ZERO,
                ..TimeoutConfig::default()
            },
            history: HistoryConfig {
                max_tokens: 1000,
                max_messages: 10,
                preserve_system_messages: false,
                preserve_recent_messages: 2,
                truncation_strategy: TruncationStrategy::Newest,
                ..HistoryConfig::default()
            },
            enable_validation: false,
            enable_fallbacks: false,
            maintenance_interval: Duration::from_secs(60),
        }
    }

    /// Look up a profile by name (case-insensitive).
    pub fn profile(name: &str) -> Result<Self, ProfileError> {
        match name.to_ascii_lowercase().as_str() {
            "production" => Ok(Self::production()),
            "development" => Ok(Self::development()),
            "critical" => Ok(Self::critical()),
            "lightweight" => Ok(Self::lightweight()),
            _ => Err(ProfileError::Unknown {
                name: name.to_string(),
            }),
        }
    }
}

impl FromStr for ResilienceConfig {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::profile(s)
    }
}
