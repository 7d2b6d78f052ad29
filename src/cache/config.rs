//! Scheduler and cache tuning.
//!
//! Controls the refresh scheduler via the `[scheduler]` section of `subrelay.toml`.

use std::time::Duration;

use thiserror::Error;

// Default values for scheduler configuration
const DEFAULT_WORKER_CAPACITY: usize = 4;
const DEFAULT_SCAN_PERIOD_SECS: u64 = 15;
const DEFAULT_RELOAD_PERIOD_SECS: u64 = 300;
const DEFAULT_RETRY_BASE_SECS: u64 = 30;
const DEFAULT_RETRY_CAP_SECS: u64 = 600;
const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RELOAD_TIMEOUT_SECS: u64 = 30;
const DEFAULT_INTERVAL_SECS: u64 = crate::domain::entities::DEFAULT_INTERVAL_SECS as u64;

/// Effective scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum number of refresh workers running at once.
    pub worker_capacity: usize,
    /// Period of the due-configuration scan.
    pub scan_period: Duration,
    /// Period of the full configuration reload.
    pub reload_period: Duration,
    /// First backoff delay after a failure.
    pub retry_base: Duration,
    /// Upper bound for the doubling backoff delay.
    pub retry_cap: Duration,
    /// Deadline for a single refresh call.
    pub refresh_timeout: Duration,
    /// Deadline for listing configurations during a reload.
    pub reload_timeout: Duration,
    /// Interval applied to configurations whose own interval is not positive.
    pub default_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_capacity: DEFAULT_WORKER_CAPACITY,
            scan_period: Duration::from_secs(DEFAULT_SCAN_PERIOD_SECS),
            reload_period: Duration::from_secs(DEFAULT_RELOAD_PERIOD_SECS),
            retry_base: Duration::from_secs(DEFAULT_RETRY_BASE_SECS),
            retry_cap: Duration::from_secs(DEFAULT_RETRY_CAP_SECS),
            refresh_timeout: Duration::from_secs(DEFAULT_REFRESH_TIMEOUT_SECS),
            reload_timeout: Duration::from_secs(DEFAULT_RELOAD_TIMEOUT_SECS),
            default_interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
        }
    }
}

impl From<&crate::config::SchedulerSettings> for SchedulerConfig {
    fn from(settings: &crate::config::SchedulerSettings) -> Self {
        Self {
            worker_capacity: settings.worker_capacity.get() as usize,
            scan_period: settings.scan_period,
            reload_period: settings.reload_period,
            retry_base: settings.retry_base,
            retry_cap: settings.retry_cap,
            refresh_timeout: settings.refresh_timeout,
            reload_timeout: settings.reload_timeout,
            default_interval: settings.default_interval,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid scheduler configuration `{field}`: {reason}")]
pub struct InvalidSchedulerConfig {
    pub field: &'static str,
    pub reason: &'static str,
}

impl SchedulerConfig {
    /// Reject settings the scheduler cannot operate with.
    pub fn validate(&self) -> Result<(), InvalidSchedulerConfig> {
        let positive = [
            ("worker_capacity", self.worker_capacity > 0),
            ("scan_period", !self.scan_period.is_zero()),
            ("reload_period", !self.reload_period.is_zero()),
            ("retry_base", !self.retry_base.is_zero()),
            ("refresh_timeout", !self.refresh_timeout.is_zero()),
            ("reload_timeout", !self.reload_timeout.is_zero()),
            ("default_interval", !self.default_interval.is_zero()),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, ok)| !ok) {
            return Err(InvalidSchedulerConfig {
                field,
                reason: "must be greater than zero",
            });
        }

        if self.retry_cap < self.retry_base {
            return Err(InvalidSchedulerConfig {
                field: "retry_cap",
                reason: "must not be smaller than retry_base",
            });
        }

        Ok(())
    }
}
