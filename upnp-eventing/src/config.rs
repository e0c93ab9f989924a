//! Configuration types for the upnp-eventing crate
//!
//! [`EventingConfig`] controls the subscription manager: requested timeouts,
//! when and how hard renewals are attempted, and how long shutdown waits for
//! outstanding UNSUBSCRIBE exchanges.

use std::time::Duration;

use crate::error::EventingError;

/// Configuration for the SubscriptionManager
#[derive(Debug, Clone)]
pub struct EventingConfig {
    /// Timeout requested when the caller does not supply one
    /// Default: 1800 seconds (30 minutes)
    pub default_timeout: Duration,

    /// Renew once the remaining time drops below this threshold.
    /// Capped at half the granted timeout for short grants.
    /// Default: 5 minutes
    pub renewal_threshold: Duration,

    /// Number of RENEW attempts before a subscription is considered lost
    /// Default: 3
    pub max_renewal_attempts: u32,

    /// Base delay between renewal attempts, doubled after each failure
    /// Default: 2 seconds
    pub retry_backoff_base: Duration,

    /// Upper bound `shutdown` waits for outstanding UNSUBSCRIBE requests
    /// Default: 5 seconds
    pub shutdown_wait: Duration,

    /// Path prefix under the callback root for NOTIFY delivery
    /// Default: "/notify"
    pub callback_path: String,
}

impl Default for EventingConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(1800), // 30 minutes
            renewal_threshold: Duration::from_secs(300), // 5 minutes
            max_renewal_attempts: 3,
            retry_backoff_base: Duration::from_secs(2),
            shutdown_wait: Duration::from_secs(5),
            callback_path: "/notify".to_string(),
        }
    }
}

impl EventingConfig {
    /// Create a new EventingConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an EventingConfig for short-lived subscriptions
    pub fn short_lived() -> Self {
        Self {
            default_timeout: Duration::from_secs(120),
            renewal_threshold: Duration::from_secs(30),
            retry_backoff_base: Duration::from_millis(500),
            shutdown_wait: Duration::from_secs(1),
            ..Default::default()
        }
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<(), EventingError> {
        if self.default_timeout < Duration::from_secs(1) {
            return Err(EventingError::Configuration(
                "Default timeout must be at least one second".to_string(),
            ));
        }

        if self.renewal_threshold >= self.default_timeout {
            return Err(EventingError::Configuration(
                "Renewal threshold must be less than the default timeout".to_string(),
            ));
        }

        if self.max_renewal_attempts == 0 {
            return Err(EventingError::Configuration(
                "Max renewal attempts must be greater than 0".to_string(),
            ));
        }

        if !self.callback_path.starts_with('/') {
            return Err(EventingError::Configuration(
                "Callback path must start with '/'".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_renewal_threshold(mut self, threshold: Duration) -> Self {
        self.renewal_threshold = threshold;
        self
    }

    pub fn with_renewal_retries(mut self, attempts: u32, backoff_base: Duration) -> Self {
        self.max_renewal_attempts = attempts;
        self.retry_backoff_base = backoff_base;
        self
    }

    pub fn with_shutdown_wait(mut self, wait: Duration) -> Self {
        self.shutdown_wait = wait;
        self
    }

    pub fn with_callback_path(mut self, path: impl Into<String>) -> Self {
        self.callback_path = path.into();
        self
    }

    /// Delay after failed renewal attempt `attempt` (1-based) before the next one.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_backoff_base.saturating_mul(1u32 << exponent)
    }
}
