//! Engine configuration
//!
//! Values are read from the environment with safe defaults, so the engine can
//! run embedded (tests, scripts) without any configuration at all.

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Default processing fee: 4%
pub const DEFAULT_PROCESSING_FEE_BPS: i64 = 400;
/// Upline walk bound for the commission chain
pub const DEFAULT_MAX_HIERARCHY_DEPTH: usize = 16;
/// $1.00
pub const DEFAULT_OVERRIDE_RATE_MIN_CENTS: i64 = 100;
/// $10.00
pub const DEFAULT_OVERRIDE_RATE_MAX_CENTS: i64 = 1_000;
pub const DEFAULT_CAS_MAX_RETRIES: usize = 5;
pub const DEFAULT_CAS_RETRY_BASE_MS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Processing fee applied after discounts, in basis points
    pub processing_fee_bps: i64,
    /// Maximum number of uplines visited when building override commissions
    pub max_hierarchy_depth: usize,
    /// Lowest override rate an admin may configure
    pub override_rate_min_cents: i64,
    /// Highest override rate an admin may configure
    pub override_rate_max_cents: i64,
    /// Attempts after the first for compare-and-swap writes
    pub cas_max_retries: usize,
    /// Backoff unit between compare-and-swap attempts
    pub cas_retry_base_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            processing_fee_bps: DEFAULT_PROCESSING_FEE_BPS,
            max_hierarchy_depth: DEFAULT_MAX_HIERARCHY_DEPTH,
            override_rate_min_cents: DEFAULT_OVERRIDE_RATE_MIN_CENTS,
            override_rate_max_cents: DEFAULT_OVERRIDE_RATE_MAX_CENTS,
            cas_max_retries: DEFAULT_CAS_MAX_RETRIES,
            cas_retry_base_ms: DEFAULT_CAS_RETRY_BASE_MS,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// - `PROCESSING_FEE_BPS`
    /// - `MAX_HIERARCHY_DEPTH`
    /// - `OVERRIDE_RATE_MIN_CENTS` / `OVERRIDE_RATE_MAX_CENTS`
    /// - `CAS_MAX_RETRIES` / `CAS_RETRY_BASE_MS`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let config = Self {
            processing_fee_bps: env_or("PROCESSING_FEE_BPS", defaults.processing_fee_bps),
            max_hierarchy_depth: env_or("MAX_HIERARCHY_DEPTH", defaults.max_hierarchy_depth),
            override_rate_min_cents: env_or(
                "OVERRIDE_RATE_MIN_CENTS",
                defaults.override_rate_min_cents,
            ),
            override_rate_max_cents: env_or(
                "OVERRIDE_RATE_MAX_CENTS",
                defaults.override_rate_max_cents,
            ),
            cas_max_retries: env_or("CAS_MAX_RETRIES", defaults.cas_max_retries),
            cas_retry_base_ms: env_or("CAS_RETRY_BASE_MS", defaults.cas_retry_base_ms),
        };

        if config.processing_fee_bps < 0
            || config.override_rate_min_cents > config.override_rate_max_cents
        {
            tracing::warn!(
                processing_fee_bps = config.processing_fee_bps,
                override_rate_min_cents = config.override_rate_min_cents,
                override_rate_max_cents = config.override_rate_max_cents,
                "Inconsistent engine configuration, using defaults"
            );
            return defaults;
        }

        config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.cas_max_retries, self.cas_retry_base_ms)
    }
}

fn env_or<T: std::str::FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, default = %default, "Invalid config value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "PROCESSING_FEE_BPS",
            "MAX_HIERARCHY_DEPTH",
            "OVERRIDE_RATE_MIN_CENTS",
            "OVERRIDE_RATE_MAX_CENTS",
            "CAS_MAX_RETRIES",
            "CAS_RETRY_BASE_MS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        clear_env();
        let config = EngineConfig::from_env();
        assert_eq!(config.processing_fee_bps, 400);
        assert_eq!(config.max_hierarchy_depth, 16);
        assert_eq!(config.override_rate_min_cents, 100);
        assert_eq!(config.override_rate_max_cents, 1_000);
    }

    #[test]
    #[serial]
    fn test_reads_overrides_from_env() {
        clear_env();
        std::env::set_var("PROCESSING_FEE_BPS", "350");
        std::env::set_var("MAX_HIERARCHY_DEPTH", "4");
        let config = EngineConfig::from_env();
        assert_eq!(config.processing_fee_bps, 350);
        assert_eq!(config.max_hierarchy_depth, 4);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_unparseable_value_falls_back() {
        clear_env();
        std::env::set_var("CAS_MAX_RETRIES", "lots");
        let config = EngineConfig::from_env();
        assert_eq!(config.cas_max_retries, DEFAULT_CAS_MAX_RETRIES);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_inverted_rate_bounds_use_defaults() {
        clear_env();
        std::env::set_var("OVERRIDE_RATE_MIN_CENTS", "2000");
        std::env::set_var("OVERRIDE_RATE_MAX_CENTS", "500");
        let config = EngineConfig::from_env();
        assert_eq!(config.override_rate_min_cents, DEFAULT_OVERRIDE_RATE_MIN_CENTS);
        assert_eq!(config.override_rate_max_cents, DEFAULT_OVERRIDE_RATE_MAX_CENTS);
        clear_env();
    }
}
