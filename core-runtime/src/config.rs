//! # Sync Engine Configuration
//!
//! Provides the tunables of the offline-first sync engine.
//!
//! ## Overview
//!
//! The configuration uses a builder to construct a [`SyncEngineConfig`].
//! `build()` fills in defaults and runs [`SyncEngineConfig::validate`] so an
//! engine never starts with nonsensical limits.
//!
//! ## Defaults
//!
//! | Setting | Default |
//! |---------|---------|
//! | `batch_size` | 50 deltas per upload chunk |
//! | `max_retries` | 5 attempts before dead-lettering |
//! | `backoff_base` / `backoff_cap` | 1 s / 60 s |
//! | `breaker_threshold` / `breaker_cooldown` | 5 failures / 5 min |
//! | `fallback_interval` | 5 min |
//! | `change_retention_days` | 30 |
//! | `notify_after_failures` | 3 |
//! | `sync_timeout` | 5 min |
//!
//! ## Usage
//!
//! ```
//! use core_runtime::config::SyncEngineConfig;
//! use std::time::Duration;
//!
//! let config = SyncEngineConfig::builder()
//!     .device_id("tablet-07")
//!     .tenant_id("cobros-norte")
//!     .batch_size(25)
//!     .fallback_interval(Duration::from_secs(120))
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(config.batch_size, 25);
//! assert_eq!(config.max_retries, 5);
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::SyncEngineConfig;
//!
//! // A device id is mandatory: version vectors are keyed by it
//! SyncEngineConfig::builder()
//!     .build()
//!     .expect("Should fail - missing device id");
//! ```

use crate::error::{Error, Result};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(60);
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 5;
pub const DEFAULT_BREAKER_COOLDOWN: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_FALLBACK_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CHANGE_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_NOTIFY_AFTER_FAILURES: u32 = 3;
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Largest accepted upload chunk.
const MAX_BATCH_SIZE: usize = 1_000;

/// Sync engine configuration.
///
/// Use [`SyncEngineConfigBuilder`] to construct instances.
#[derive(Clone, PartialEq, Eq)]
pub struct SyncEngineConfig {
    /// Identifier of this device; keys its entries in version vectors.
    pub device_id: String,

    /// Tenant the local data belongs to, when the remote store is shared.
    pub tenant_id: Option<String>,

    /// Maximum number of deltas pushed per upload chunk.
    pub batch_size: usize,

    /// Failures after which a queue item is dead-lettered.
    pub max_retries: u32,

    /// Base delay of the exponential retry backoff.
    pub backoff_base: Duration,

    /// Upper bound of the retry backoff.
    pub backoff_cap: Duration,

    /// Consecutive failed passes that open the circuit breaker.
    pub breaker_threshold: u32,

    /// How long an open breaker suppresses automatic passes.
    pub breaker_cooldown: Duration,

    /// Period of the fallback timer when no platform scheduler is available.
    pub fallback_interval: Duration,

    /// Age after which synced change-log entries are swept.
    pub change_retention_days: u32,

    /// Consecutive failed background passes before a passive notification.
    pub notify_after_failures: u32,

    /// Upper bound for a single remote call.
    pub sync_timeout: Duration,
}

impl fmt::Debug for SyncEngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngineConfig")
            .field("device_id", &self.device_id)
            .field("tenant_id", &self.tenant_id.as_ref().map(|_| "[REDACTED]"))
            .field("batch_size", &self.batch_size)
            .field("max_retries", &self.max_retries)
            .field("backoff_base", &self.backoff_base)
            .field("backoff_cap", &self.backoff_cap)
            .field("breaker_threshold", &self.breaker_threshold)
            .field("breaker_cooldown", &self.breaker_cooldown)
            .field("fallback_interval", &self.fallback_interval)
            .field("change_retention_days", &self.change_retention_days)
            .field("notify_after_failures", &self.notify_after_failures)
            .field("sync_timeout", &self.sync_timeout)
            .finish()
    }
}

impl SyncEngineConfig {
    /// Creates a new builder for constructing a `SyncEngineConfig`.
    pub fn builder() -> SyncEngineConfigBuilder {
        SyncEngineConfigBuilder::default()
    }

    /// Convenience constructor with every default and the given device id.
    pub fn for_device(device_id: impl Into<String>) -> Result<Self> {
        Self::builder().device_id(device_id).build()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Device id is non-empty and has no whitespace
    /// - Batch size is within `1..=1000`
    /// - Retry and breaker thresholds are positive
    /// - Backoff base does not exceed the cap
    /// - Intervals and timeouts are non-zero
    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(Error::Config("Device id cannot be empty".to_string()));
        }

        if self.device_id.chars().any(char::is_whitespace) {
            return Err(Error::Config(format!(
                "Device id '{}' must not contain whitespace",
                self.device_id
            )));
        }

        if let Some(tenant) = &self.tenant_id {
            if tenant.trim().is_empty() {
                return Err(Error::Config(
                    "Tenant id cannot be blank. Omit it instead of passing an empty string."
                        .to_string(),
                ));
            }
        }

        if self.batch_size == 0 {
            return Err(Error::Config(
                "Batch size must be greater than 0".to_string(),
            ));
        }

        if self.batch_size > MAX_BATCH_SIZE {
            return Err(Error::Config(format!(
                "Batch size exceeds maximum of {}",
                MAX_BATCH_SIZE
            )));
        }

        if self.max_retries == 0 {
            return Err(Error::Config(
                "Max retries must be at least 1, otherwise every failure is dead-lettered immediately"
                    .to_string(),
            ));
        }

        if self.backoff_base.is_zero() {
            return Err(Error::Config(
                "Backoff base must be greater than zero".to_string(),
            ));
        }

        if self.backoff_base > self.backoff_cap {
            return Err(Error::Config(format!(
                "Backoff base ({:?}) cannot exceed backoff cap ({:?})",
                self.backoff_base, self.backoff_cap
            )));
        }

        if self.breaker_threshold == 0 {
            return Err(Error::Config(
                "Circuit breaker threshold must be at least 1".to_string(),
            ));
        }

        if self.fallback_interval.is_zero() {
            return Err(Error::Config(
                "Fallback interval must be greater than zero".to_string(),
            ));
        }

        if self.sync_timeout.is_zero() {
            return Err(Error::Config(
                "Sync timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Retention window of synced change-log entries.
    pub fn change_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.change_retention_days) * 86_400)
    }
}

/// Builder for constructing [`SyncEngineConfig`] instances.
#[derive(Default)]
pub struct SyncEngineConfigBuilder {
    device_id: Option<String>,
    tenant_id: Option<String>,
    batch_size: Option<usize>,
    max_retries: Option<u32>,
    backoff_base: Option<Duration>,
    backoff_cap: Option<Duration>,
    breaker_threshold: Option<u32>,
    breaker_cooldown: Option<Duration>,
    fallback_interval: Option<Duration>,
    change_retention_days: Option<u32>,
    notify_after_failures: Option<u32>,
    sync_timeout: Option<Duration>,
}

impl SyncEngineConfigBuilder {
    /// Sets the device id (required).
    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Sets the maximum number of deltas per upload chunk.
    ///
    /// Default: 50
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets the retry backoff bounds.
    ///
    /// Default: 1 s base, 60 s cap
    pub fn backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = Some(base);
        self.backoff_cap = Some(cap);
        self
    }

    /// Sets the circuit breaker threshold and cooldown.
    ///
    /// Default: 5 consecutive failures, 5 minute cooldown
    pub fn circuit_breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.breaker_threshold = Some(threshold);
        self.breaker_cooldown = Some(cooldown);
        self
    }

    pub fn fallback_interval(mut self, interval: Duration) -> Self {
        self.fallback_interval = Some(interval);
        self
    }

    pub fn change_retention_days(mut self, days: u32) -> Self {
        self.change_retention_days = Some(days);
        self
    }

    pub fn notify_after_failures(mut self, failures: u32) -> Self {
        self.notify_after_failures = Some(failures);
        self
    }

    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = Some(timeout);
        self
    }

    /// Builds the configuration, applying defaults and validating.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the device id is missing or any value
    /// fails [`SyncEngineConfig::validate`].
    pub fn build(self) -> Result<SyncEngineConfig> {
        let device_id = self.device_id.ok_or_else(|| {
            Error::Config("Device id is required. Use .device_id() to set it.".to_string())
        })?;

        let config = SyncEngineConfig {
            device_id,
            tenant_id: self.tenant_id,
            batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            backoff_base: self.backoff_base.unwrap_or(DEFAULT_BACKOFF_BASE),
            backoff_cap: self.backoff_cap.unwrap_or(DEFAULT_BACKOFF_CAP),
            breaker_threshold: self.breaker_threshold.unwrap_or(DEFAULT_BREAKER_THRESHOLD),
            breaker_cooldown: self.breaker_cooldown.unwrap_or(DEFAULT_BREAKER_COOLDOWN),
            fallback_interval: self.fallback_interval.unwrap_or(DEFAULT_FALLBACK_INTERVAL),
            change_retention_days: self
                .change_retention_days
                .unwrap_or(DEFAULT_CHANGE_RETENTION_DAYS),
            notify_after_failures: self
                .notify_after_failures
                .unwrap_or(DEFAULT_NOTIFY_AFTER_FAILURES),
            sync_timeout: self.sync_timeout.unwrap_or(DEFAULT_SYNC_TIMEOUT),
        };

        config.validate()?;

        Ok(config)
    }
}
