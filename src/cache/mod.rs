//! Provider cache and refresh scheduler.
//!
//! - **Store**: latest successful rendering per configuration
//! - **Sync state**: per-configuration backoff and running set
//! - **Subscription memo**: per-scan deduplication of subscription lookups
//! - **Scheduler**: reload/scan loop with a bounded worker pool
//! - **Provider service**: serve-time read path with synchronous fallback
//!
//! ## Configuration
//!
//! Scheduler behavior is controlled via `subrelay.toml`:
//!
//! ```toml
//! [scheduler]
//! worker_capacity = 4
//! scan_period_seconds = 15
//! reload_period_seconds = 300
//! # ... see config.rs for all options
//! ```

mod config;
mod lock;
mod provider;
mod scheduler;
mod store;
mod subscriptions;
mod sync_state;

pub use config::{InvalidSchedulerConfig, SchedulerConfig};
pub use provider::{ProviderService, ServeError};
pub use scheduler::{Clock, DueReason, ScheduledJob, Scheduler, SchedulerError};
pub use store::{CacheEntry, ProviderCache, ProviderStatus};
pub use subscriptions::SubscriptionMemo;
pub use sync_state::{SyncState, SyncTracker};
