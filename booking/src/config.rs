//! Configuration management for the venue booking services.
//!
//! Loads configuration from `VENUE_*` environment variables with sensible
//! defaults.

use crate::aggregates::DEFAULT_RETAINED_ATTEMPTS;
use crate::types::Money;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use venue_runtime::retry::RetryPolicy;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Collaborator deadlines for checkout
    pub checkout: CheckoutConfig,
    /// Background reconciliation retry budget
    pub reconciliation: ReconciliationConfig,
    /// Code scanner polling
    pub scanner: ScannerConfig,
    /// Retail pricing
    pub retail: RetailConfig,
    /// Logging
    pub logging: LoggingConfig,
}

/// Deadlines applied to each checkout collaborator call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutConfig {
    /// Inventory re-validation deadline in seconds (default: 10)
    pub validation_timeout_secs: u64,
    /// Payment authorization deadline in seconds (default: 120)
    pub authorization_timeout_secs: u64,
    /// Durable write deadline in seconds (default: 15)
    pub commit_timeout_secs: u64,
    /// Finished attempts kept for inspection (default: 1024)
    pub retained_attempts: usize,
}

/// Retry budget for post-commit stock decrements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Retries after the first attempt (default: 3)
    pub max_retries: u32,
    /// First backoff delay in milliseconds (default: 100)
    pub initial_delay_ms: u64,
    /// Backoff cap in milliseconds (default: 2000)
    pub max_delay_ms: u64,
}

/// Scanner configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Interval between frame pulls in milliseconds (default: 33, about 30 fps)
    pub frame_interval_ms: u64,
}

/// Retail configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetailConfig {
    /// Flat shipping fee in pence (default: 395)
    pub shipping_fee_pence: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset (default: info)
    pub level: String,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Unset or unparsable variables fall back to their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            checkout: CheckoutConfig {
                validation_timeout_secs: parsed(&lookup, "VENUE_VALIDATION_TIMEOUT_SECS", 10),
                authorization_timeout_secs: parsed(&lookup, "VENUE_AUTHORIZATION_TIMEOUT_SECS", 120),
                commit_timeout_secs: parsed(&lookup, "VENUE_COMMIT_TIMEOUT_SECS", 15),
                retained_attempts: parsed(&lookup, "VENUE_RETAINED_ATTEMPTS", DEFAULT_RETAINED_ATTEMPTS),
            },
            reconciliation: ReconciliationConfig {
                max_retries: parsed(&lookup, "VENUE_RECONCILE_MAX_RETRIES", 3),
                initial_delay_ms: parsed(&lookup, "VENUE_RECONCILE_INITIAL_DELAY_MS", 100),
                max_delay_ms: parsed(&lookup, "VENUE_RECONCILE_MAX_DELAY_MS", 2000),
            },
            scanner: ScannerConfig {
                frame_interval_ms: parsed(&lookup, "VENUE_SCANNER_FRAME_INTERVAL_MS", 33),
            },
            retail: RetailConfig {
                shipping_fee_pence: parsed(&lookup, "VENUE_SHIPPING_FEE_PENCE", 395),
            },
            logging: LoggingConfig {
                level: lookup("VENUE_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl CheckoutConfig {
    /// Inventory re-validation deadline
    #[must_use]
    pub const fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }

    /// Payment authorization deadline
    #[must_use]
    pub const fn authorization_timeout(&self) -> Duration {
        Duration::from_secs(self.authorization_timeout_secs)
    }

    /// Durable write deadline
    #[must_use]
    pub const fn commit_timeout(&self) -> Duration {
        Duration::from_secs(self.commit_timeout_secs)
    }
}

impl ReconciliationConfig {
    /// Backoff policy for stock decrements
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.max_retries)
            .initial_delay(Duration::from_millis(self.initial_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .build()
    }
}

impl ScannerConfig {
    /// Interval between frame pulls
    #[must_use]
    pub const fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

impl RetailConfig {
    /// Flat shipping fee
    #[must_use]
    pub const fn shipping_fee(&self) -> Money {
        Money::from_pence(self.shipping_fee_pence)
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key).and_then(|value| value.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.checkout.authorization_timeout(), Duration::from_secs(120));
        assert_eq!(config.checkout.commit_timeout(), Duration::from_secs(15));
        assert_eq!(config.checkout.validation_timeout(), Duration::from_secs(10));
        assert_eq!(config.checkout.retained_attempts, 1024);
        assert_eq!(config.reconciliation.retry_policy().max_retries(), 3);
        assert_eq!(config.scanner.frame_interval(), Duration::from_millis(33));
        assert_eq!(config.retail.shipping_fee(), Money::from_pence(395));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_overrides_and_unparsable_values() {
        let vars = HashMap::from([
            ("VENUE_COMMIT_TIMEOUT_SECS", "3"),
            ("VENUE_SHIPPING_FEE_PENCE", "free"),
            ("VENUE_LOG_LEVEL", "venue_booking=debug"),
        ]);

        let config = Config::from_lookup(|key| vars.get(key).map(ToString::to_string));

        assert_eq!(config.checkout.commit_timeout(), Duration::from_secs(3));
        assert_eq!(config.retail.shipping_fee_pence, 395);
        assert_eq!(config.logging.level, "venue_booking=debug");
    }
}
