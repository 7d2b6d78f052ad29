//! Scan-cycle memo of upstream subscription records.
//!
//! Several configurations commonly filter the same upstream subscription.
//! The memo is cleared once at the start of every scan so each distinct
//! subscription is looked up at most once per cycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use metrics::counter;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::application::repos::{RepoError, SubscriptionsRepo};
use crate::domain::entities::{SubscriptionId, SubscriptionRecord};

use super::lock::mutex_lock;

const SOURCE: &str = "cache::subscriptions";
const METRIC_LOOKUP_TOTAL: &str = "subrelay_subscription_lookup_total";

#[derive(Default)]
pub struct SubscriptionMemo {
    records: Mutex<HashMap<SubscriptionId, Arc<OnceCell<SubscriptionRecord>>>>,
}

impl SubscriptionMemo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the memoized record for `id` or fetch it from `repo`.
    ///
    /// The second element reports whether the record came from the memo.
    /// Concurrent callers for the same id share one lookup; failed lookups
    /// are not memoized.
    pub async fn get_or_fetch(
        &self,
        repo: &dyn SubscriptionsRepo,
        id: SubscriptionId,
        owner: &str,
    ) -> Result<(SubscriptionRecord, bool), RepoError> {
        let cell = mutex_lock(&self.records, SOURCE, "get_or_fetch")
            .entry(id)
            .or_default()
            .clone();

        let mut fetched = false;
        let record = cell
            .get_or_try_init(|| async {
                fetched = true;
                repo.get_subscription(id, owner).await
            })
            .await?
            .clone();

        if fetched {
            counter!(METRIC_LOOKUP_TOTAL, "source" => "catalog").increment(1);
            debug!(subscription_id = %id, owner, "Fetched subscription record");
        } else {
            counter!(METRIC_LOOKUP_TOTAL, "source" => "memo").increment(1);
        }
        Ok((record, !fetched))
    }

    pub fn clear(&self) {
        mutex_lock(&self.records, SOURCE, "clear").clear();
    }

    /// Number of subscriptions resolved in the current cycle.
    pub fn len(&self) -> usize {
        mutex_lock(&self.records, SOURCE, "len")
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
