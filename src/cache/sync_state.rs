//! Per-configuration retry backoff and in-flight bookkeeping.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use time::OffsetDateTime;

use crate::domain::entities::ConfigId;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::sync_state";

/// Retry state of one configuration.
///
/// `retry_delay` is zero exactly when `block_until` is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncState {
    pub block_until: Option<OffsetDateTime>,
    pub retry_delay: Duration,
}

impl SyncState {
    pub fn is_blocked(&self, now: OffsetDateTime) -> bool {
        self.block_until.is_some_and(|until| now < until)
    }

    fn fail(&mut self, now: OffsetDateTime, base: Duration, cap: Duration) -> Duration {
        let delay = if self.retry_delay.is_zero() {
            base
        } else {
            self.retry_delay.saturating_mul(2).min(cap)
        };
        self.retry_delay = delay;
        self.block_until = Some(now + delay);
        delay
    }

    fn succeed(&mut self) {
        *self = Self::default();
    }
}

#[derive(Default)]
struct TrackerInner {
    states: HashMap<ConfigId, SyncState>,
    running: HashSet<ConfigId>,
}

/// Backoff states and the running set, guarded by one mutex so due
/// selection can claim configurations atomically.
pub struct SyncTracker {
    inner: Mutex<TrackerInner>,
    retry_base: Duration,
    retry_cap: Duration,
}

impl SyncTracker {
    pub fn new(retry_base: Duration, retry_cap: Duration) -> Self {
        Self {
            inner: Mutex::new(TrackerInner::default()),
            retry_base,
            retry_cap,
        }
    }

    pub fn ensure_state(&self, id: ConfigId) -> SyncState {
        *mutex_lock(&self.inner, SOURCE, "ensure_state")
            .states
            .entry(id)
            .or_default()
    }

    pub fn state(&self, id: ConfigId) -> Option<SyncState> {
        mutex_lock(&self.inner, SOURCE, "state")
            .states
            .get(&id)
            .copied()
    }

    pub fn record_failure(&self, id: ConfigId) -> Option<Duration> {
        self.record_failure_at(id, OffsetDateTime::now_utc())
    }

    /// Grow the backoff window of `id` as of `now` and return the new delay.
    ///
    /// Only existing states are updated; `None` means `id` was removed.
    pub fn record_failure_at(&self, id: ConfigId, now: OffsetDateTime) -> Option<Duration> {
        let mut inner = mutex_lock(&self.inner, SOURCE, "record_failure");
        inner
            .states
            .get_mut(&id)
            .map(|state| state.fail(now, self.retry_base, self.retry_cap))
    }

    /// Returns `false` when `id` has no state.
    pub fn record_success(&self, id: ConfigId) -> bool {
        match mutex_lock(&self.inner, SOURCE, "record_success")
            .states
            .get_mut(&id)
        {
            Some(state) => {
                state.succeed();
                true
            }
            None => false,
        }
    }

    /// Returns `false` when `id` was already running.
    pub fn mark_running(&self, id: ConfigId) -> bool {
        mutex_lock(&self.inner, SOURCE, "mark_running")
            .running
            .insert(id)
    }

    pub fn mark_finished(&self, id: ConfigId) {
        mutex_lock(&self.inner, SOURCE, "mark_finished")
            .running
            .remove(&id);
    }

    pub fn is_running(&self, id: ConfigId) -> bool {
        mutex_lock(&self.inner, SOURCE, "is_running")
            .running
            .contains(&id)
    }

    pub fn running_count(&self) -> usize {
        mutex_lock(&self.inner, SOURCE, "running_count")
            .running
            .len()
    }

    /// Forget everything about `id`.
    pub fn remove(&self, id: ConfigId) {
        let mut inner = mutex_lock(&self.inner, SOURCE, "remove");
        inner.states.remove(&id);
        inner.running.remove(&id);
    }

    /// Claim every candidate that is idle, outside its backoff window and
    /// reported due by `due`, marking each claimed id as running.
    ///
    /// The whole pass runs under the tracker lock, so two overlapping
    /// selections never claim the same configuration.
    pub fn claim_due<T, R, F>(
        &self,
        now: OffsetDateTime,
        candidates: impl IntoIterator<Item = (ConfigId, T)>,
        mut due: F,
    ) -> Vec<(T, R)>
    where
        F: FnMut(&T) -> Option<R>,
    {
        let mut inner = mutex_lock(&self.inner, SOURCE, "claim_due");
        let mut claimed = Vec::new();

        for (id, candidate) in candidates {
            if inner.running.contains(&id) {
                continue;
            }
            if inner.states.entry(id).or_default().is_blocked(now) {
                continue;
            }
            if let Some(reason) = due(&candidate) {
                inner.running.insert(id);
                claimed.push((candidate, reason));
            }
        }

        claimed
    }
}
