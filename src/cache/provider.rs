//! Serve-time access to materialized providers.
//!
//! Reads hit the [`ProviderCache`] directly; a miss or an expired entry
//! triggers a synchronous refresh whose result is written back. This path
//! never consults the scheduler's backoff or running set, so it may race
//! with a background refresh of the same configuration. Both sides write
//! whole entries and the store keeps the newest one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::{counter, histogram};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::application::refresh::{ProviderRefresher, RefreshError, refresh_with_timeout};
use crate::application::repos::{RepoError, SubscriptionsRepo};
use crate::domain::entities::{ConfigId, Configuration, SubscriptionRecord};

use super::store::{CacheEntry, ProviderCache, ProviderStatus};

const METRIC_REFRESH_TOTAL: &str = "subrelay_refresh_total";
const METRIC_REFRESH_MS: &str = "subrelay_refresh_ms";

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Refresh(#[from] RefreshError),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

pub struct ProviderService {
    cache: Arc<ProviderCache>,
    refresher: Arc<dyn ProviderRefresher>,
    refresh_timeout: Duration,
}

impl ProviderService {
    pub fn new(
        cache: Arc<ProviderCache>,
        refresher: Arc<dyn ProviderRefresher>,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            refresher,
            refresh_timeout,
        }
    }

    pub fn cache(&self) -> &Arc<ProviderCache> {
        &self.cache
    }

    /// Return the cached document for `config`, refreshing it first when the
    /// entry is missing or expired.
    ///
    /// The subscription is only resolved when a refresh is needed. When an
    /// expired entry exists and the refresh fails, the stale document is
    /// served instead; errors surface only on a cache miss.
    #[instrument(skip(self, config, subscriptions), fields(config_id = %config.id))]
    pub async fn get_or_refresh(
        &self,
        config: &Configuration,
        subscriptions: &dyn SubscriptionsRepo,
    ) -> Result<Bytes, ServeError> {
        let now = OffsetDateTime::now_utc();
        let cached = self.cache.get(config.id);
        if let Some(entry) = cached.as_deref() {
            if !self.cache.is_expired(Some(entry), now) {
                debug!("Serving cached provider");
                return Ok(entry.document.clone());
            }
        }

        let refreshed = match subscriptions
            .get_subscription(config.subscription_id, &config.owner)
            .await
        {
            Ok(subscription) => self.refresh(config, &subscription).await,
            Err(err) => Err(err.into()),
        };

        match (refreshed, cached) {
            (Ok(entry), _) => Ok(entry.document.clone()),
            (Err(err), Some(stale)) => {
                warn!(
                    error = %err,
                    fetched_at = %stale.fetched_at,
                    "Refresh failed, serving stale provider"
                );
                Ok(stale.document.clone())
            }
            (Err(err), None) => Err(err),
        }
    }

    /// Refresh `config` unconditionally and store the result.
    pub async fn refresh(
        &self,
        config: &Configuration,
        subscription: &SubscriptionRecord,
    ) -> Result<Arc<CacheEntry>, ServeError> {
        let started_at = Instant::now();
        let result = refresh_with_timeout(
            self.refresher.as_ref(),
            subscription,
            config,
            self.refresh_timeout,
        )
        .await;
        histogram!(METRIC_REFRESH_MS, "origin" => "on_demand")
            .record(started_at.elapsed().as_secs_f64() * 1000.0);

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                counter!(METRIC_REFRESH_TOTAL, "origin" => "on_demand", "outcome" => err.kind())
                    .increment(1);
                warn!(
                    config_id = %config.id,
                    error = %err,
                    kind = err.kind(),
                    "On-demand refresh failed"
                );
                return Err(err.into());
            }
        };

        let entry = Arc::new(CacheEntry::from_refresh(
            config.id,
            output,
            OffsetDateTime::now_utc(),
            config.interval_secs,
        ));
        self.cache.set(CacheEntry::clone(&entry));

        counter!(METRIC_REFRESH_TOTAL, "origin" => "on_demand", "outcome" => "success")
            .increment(1);
        info!(
            config_id = %config.id,
            node_count = entry.node_count,
            "Provider refreshed on demand"
        );
        Ok(entry)
    }

    pub fn status(&self, id: ConfigId) -> ProviderStatus {
        self.cache.status(id, OffsetDateTime::now_utc())
    }

    pub fn snapshot(&self) -> BTreeMap<ConfigId, ProviderStatus> {
        self.cache.snapshot(OffsetDateTime::now_utc())
    }
}
