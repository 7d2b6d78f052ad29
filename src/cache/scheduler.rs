//! Background refresh scheduler.
//!
//! A single control loop selects over a slow reload timer, a fast scan
//! timer and the shutdown signal. Scans claim due configurations through
//! the [`SyncTracker`] and hand each one to a worker task gated by a
//! fixed-size semaphore.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant as StdInstant};

use metrics::{counter, gauge, histogram};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tracing::{debug, info, instrument, warn};

use crate::application::refresh::{
    ProviderRefresher, RefreshError, RefreshOutput, refresh_with_timeout,
};
use crate::application::repos::{ConfigsRepo, RepoError, SubscriptionsRepo};
use crate::domain::entities::{ConfigId, Configuration};

use super::config::{InvalidSchedulerConfig, SchedulerConfig};
use super::lock::{rw_read, rw_write};
use super::store::{CacheEntry, ProviderCache};
use super::subscriptions::SubscriptionMemo;
use super::sync_state::SyncTracker;

const SOURCE: &str = "cache::scheduler";
const METRIC_REFRESH_TOTAL: &str = "subrelay_refresh_total";
const METRIC_REFRESH_MS: &str = "subrelay_refresh_ms";
const METRIC_REFRESH_INFLIGHT: &str = "subrelay_refresh_inflight";
const METRIC_RELOAD_TOTAL: &str = "subrelay_reload_total";

/// Source of wall-clock time for scheduling decisions.
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] InvalidSchedulerConfig),
    #[error("configuration reload failed: {0}")]
    Reload(#[source] RepoError),
    #[error("configuration reload timed out after {}s", .after.as_secs())]
    ReloadTimeout { after: Duration },
}

/// Why a configuration was picked by a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueReason {
    NoCache,
    IntervalElapsed,
}

impl DueReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DueReason::NoCache => "no cache",
            DueReason::IntervalElapsed => "interval elapsed",
        }
    }
}

impl fmt::Display for DueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub config: Configuration,
    pub reason: DueReason,
}

/// Counts spawned workers so shutdown can wait for all of them.
#[derive(Default)]
struct WorkerGroup {
    active: AtomicUsize,
    idle: Notify,
}

impl WorkerGroup {
    fn enter(self: &Arc<Self>) -> WorkerGuard {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!(METRIC_REFRESH_INFLIGHT).set(active as f64);
        WorkerGuard {
            group: Arc::clone(self),
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct WorkerGuard {
    group: Arc<WorkerGroup>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let remaining = self.group.active.fetch_sub(1, Ordering::SeqCst) - 1;
        gauge!(METRIC_REFRESH_INFLIGHT).set(remaining as f64);
        if remaining == 0 {
            self.group.idle.notify_waiters();
        }
    }
}

/// Clears the running flag of a configuration when its worker ends.
struct RunningGuard {
    tracker: Arc<SyncTracker>,
    config_id: ConfigId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.tracker.mark_finished(self.config_id);
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    configs: Arc<dyn ConfigsRepo>,
    subscriptions: Arc<dyn SubscriptionsRepo>,
    refresher: Arc<dyn ProviderRefresher>,
    cache: Arc<ProviderCache>,
    tracker: Arc<SyncTracker>,
    memo: SubscriptionMemo,
    known: RwLock<BTreeMap<ConfigId, Configuration>>,
    permits: Arc<Semaphore>,
    workers: Arc<WorkerGroup>,
    clock: Clock,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        configs: Arc<dyn ConfigsRepo>,
        subscriptions: Arc<dyn SubscriptionsRepo>,
        refresher: Arc<dyn ProviderRefresher>,
        cache: Arc<ProviderCache>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;

        Ok(Self {
            tracker: Arc::new(SyncTracker::new(config.retry_base, config.retry_cap)),
            permits: Arc::new(Semaphore::new(config.worker_capacity)),
            config,
            configs,
            subscriptions,
            refresher,
            cache,
            memo: SubscriptionMemo::new(),
            known: RwLock::new(BTreeMap::new()),
            workers: Arc::new(WorkerGroup::default()),
            clock: Arc::new(OffsetDateTime::now_utc),
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn cache(&self) -> &Arc<ProviderCache> {
        &self.cache
    }

    pub fn tracker(&self) -> &Arc<SyncTracker> {
        &self.tracker
    }

    /// Configurations known since the last successful reload.
    pub fn known_configs(&self) -> Vec<Configuration> {
        rw_read(&self.known, SOURCE, "known_configs")
            .values()
            .cloned()
            .collect()
    }

    fn now(&self) -> OffsetDateTime {
        (self.clock)()
    }

    /// Drive reloads and scans until `shutdown` flips to `true`, then wait
    /// for every in-flight worker.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_capacity = self.config.worker_capacity,
            scan_period_secs = self.config.scan_period.as_secs(),
            reload_period_secs = self.config.reload_period.as_secs(),
            "Refresh scheduler started"
        );

        if self.reload_until_stopped(&mut shutdown).await {
            self.drain().await;
            return;
        }

        let mut reload_timer = interval_at(
            Instant::now() + self.config.reload_period,
            self.config.reload_period,
        );
        reload_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut scan_timer = interval(self.config.scan_period);
        scan_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop_requested(&mut shutdown) => break,
                _ = reload_timer.tick() => {
                    if self.reload_until_stopped(&mut shutdown).await {
                        break;
                    }
                }
                _ = scan_timer.tick() => {
                    self.scan(&mut shutdown).await;
                }
            }
        }

        self.drain().await;
    }

    /// Run one reload, abandoning it when shutdown is requested first.
    /// Returns `true` when the scheduler should stop.
    async fn reload_until_stopped(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = stop_requested(shutdown) => true,
            result = self.reload() => {
                if let Err(err) = result {
                    debug!(error = %err, "Reload cycle skipped");
                }
                false
            }
        }
    }

    async fn drain(&self) {
        info!(
            running = self.tracker.running_count(),
            "Refresh scheduler stopping, waiting for workers"
        );
        self.workers.wait().await;
        info!("Refresh scheduler stopped");
    }

    /// Resolves once no refresh worker is running.
    pub async fn wait_for_workers(&self) {
        self.workers.wait().await;
    }

    /// Replace the known configuration set from the catalog.
    ///
    /// On failure the previous set stays active. Removed configurations are
    /// dropped from the cache and the tracker; surviving ones get their
    /// current interval pushed into the cache.
    #[instrument(skip(self))]
    pub async fn reload(&self) -> Result<usize, SchedulerError> {
        let timeout = self.config.reload_timeout;
        let listed = match tokio::time::timeout(timeout, self.configs.list_eligible_configs()).await
        {
            Ok(Ok(configs)) => configs,
            Ok(Err(err)) => {
                warn!(error = %err, "Configuration reload failed, keeping previous set");
                counter!(METRIC_RELOAD_TOTAL, "outcome" => "error").increment(1);
                return Err(SchedulerError::Reload(err));
            }
            Err(_) => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "Configuration reload timed out, keeping previous set"
                );
                counter!(METRIC_RELOAD_TOTAL, "outcome" => "timeout").increment(1);
                return Err(SchedulerError::ReloadTimeout { after: timeout });
            }
        };

        let next: BTreeMap<ConfigId, Configuration> = listed
            .into_iter()
            .map(|config| (config.id, config))
            .collect();

        let removed: Vec<ConfigId> = {
            let mut known = rw_write(&self.known, SOURCE, "reload");
            let removed: Vec<ConfigId> = known
                .keys()
                .filter(|id| !next.contains_key(id))
                .copied()
                .collect();
            for id in &removed {
                self.tracker.remove(*id);
                self.cache.delete(*id);
            }
            *known = next.clone();
            removed
        };

        let mut retimed = 0usize;
        for config in next.values() {
            if self.cache.update_interval(config.id, config.interval_secs) {
                retimed += 1;
            }
        }

        counter!(METRIC_RELOAD_TOTAL, "outcome" => "success").increment(1);
        info!(
            configs = next.len(),
            removed = removed.len(),
            retimed,
            "Configuration set reloaded"
        );
        Ok(next.len())
    }

    /// One scan cycle at the current clock time. Returns the number of
    /// workers dispatched.
    pub async fn scan(self: &Arc<Self>, shutdown: &mut watch::Receiver<bool>) -> usize {
        let now = self.now();
        self.scan_at(now, shutdown).await
    }

    pub async fn scan_at(
        self: &Arc<Self>,
        now: OffsetDateTime,
        shutdown: &mut watch::Receiver<bool>,
    ) -> usize {
        self.memo.clear();

        let jobs = self.select_due(now);
        if jobs.is_empty() {
            return 0;
        }
        debug!(due = jobs.len(), "Dispatching refresh jobs");

        let mut dispatched = 0;
        let mut pending = jobs.into_iter();
        while let Some(job) = pending.next() {
            let Some(permit) = self.acquire_slot(shutdown).await else {
                self.tracker.mark_finished(job.config.id);
                for skipped in pending {
                    self.tracker.mark_finished(skipped.config.id);
                }
                info!(dispatched, "Scan interrupted by shutdown");
                break;
            };
            self.spawn_worker(job, permit);
            dispatched += 1;
        }
        dispatched
    }

    fn select_due(&self, now: OffsetDateTime) -> Vec<ScheduledJob> {
        let candidates = self.known_configs();
        self.tracker
            .claim_due(
                now,
                candidates.into_iter().map(|config| (config.id, config)),
                |config| match self.cache.get(config.id) {
                    None => Some(DueReason::NoCache),
                    Some(entry) if self.cache.is_due(Some(&entry), now) => {
                        Some(DueReason::IntervalElapsed)
                    }
                    Some(_) => None,
                },
            )
            .into_iter()
            .map(|(config, reason)| ScheduledJob { config, reason })
            .collect()
    }

    async fn acquire_slot(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<OwnedSemaphorePermit> {
        if *shutdown.borrow() {
            return None;
        }
        tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
            _ = stop_requested(shutdown) => None,
        }
    }

    fn spawn_worker(self: &Arc<Self>, job: ScheduledJob, permit: OwnedSemaphorePermit) {
        let worker = self.workers.enter();
        let running = RunningGuard {
            tracker: Arc::clone(&self.tracker),
            config_id: job.config.id,
        };
        let this = Arc::clone(self);

        tokio::spawn(async move {
            // Dropped in reverse order: slot, running flag, then the worker count.
            let _worker = worker;
            let _running = running;
            let _permit = permit;
            this.refresh_job(job).await;
        });
    }

    #[instrument(skip(self, job), fields(config_id = %job.config.id, reason = %job.reason))]
    async fn refresh_job(&self, job: ScheduledJob) {
        let config = &job.config;
        let started_at = StdInstant::now();

        let result = self.refresh_config(config).await;
        self.apply_outcome(config, result);

        histogram!(METRIC_REFRESH_MS, "origin" => "scheduler")
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
    }

    /// Write a worker's result back. Runs under the `known` read lock so a
    /// concurrent reload cannot remove the configuration halfway through.
    fn apply_outcome(
        &self,
        config: &Configuration,
        result: Result<RefreshOutput, RefreshError>,
    ) {
        let known = rw_read(&self.known, SOURCE, "apply_outcome");
        let still_known = known.contains_key(&config.id);

        match result {
            Ok(output) => {
                counter!(METRIC_REFRESH_TOTAL, "origin" => "scheduler", "outcome" => "success")
                    .increment(1);
                if !still_known {
                    debug!(
                        node_count = output.node_count,
                        "Configuration removed while refreshing, result discarded"
                    );
                    return;
                }

                let entry =
                    CacheEntry::from_refresh(config.id, output, self.now(), config.interval_secs);
                let node_count = entry.node_count;
                self.cache.set(entry);
                self.tracker.record_success(config.id);
                info!(node_count, "Provider refreshed");
            }
            Err(err) => {
                counter!(METRIC_REFRESH_TOTAL, "origin" => "scheduler", "outcome" => err.kind())
                    .increment(1);
                let retry_in = if still_known {
                    self.tracker.record_failure_at(config.id, self.now())
                } else {
                    None
                };

                match retry_in {
                    Some(delay) => warn!(
                        error = %err,
                        kind = err.kind(),
                        retry_in_secs = delay.as_secs(),
                        "Provider refresh failed"
                    ),
                    None => debug!(
                        error = %err,
                        kind = err.kind(),
                        "Refresh failed for a removed configuration"
                    ),
                }
            }
        }
    }

    async fn refresh_config(&self, config: &Configuration) -> Result<RefreshOutput, RefreshError> {
        let timeout = self.config.refresh_timeout;
        let lookup = self.memo.get_or_fetch(
            self.subscriptions.as_ref(),
            config.subscription_id,
            &config.owner,
        );

        let (subscription, from_memo) = tokio::time::timeout(timeout, lookup)
            .await
            .map_err(|_| RefreshError::Timeout { after: timeout })?
            .map_err(RefreshError::Resolution)?;
        debug!(
            subscription_id = %subscription.id,
            from_memo,
            "Subscription resolved"
        );

        refresh_with_timeout(self.refresher.as_ref(), &subscription, config, timeout).await
    }
}

/// Resolves once the shutdown flag is set. A dropped sender never resolves.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use bytes::Bytes;
    use time::macros::datetime;

    use super::*;
    use crate::domain::entities::{SubscriptionId, SubscriptionRecord};

    const T0: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

    #[derive(Default)]
    struct FakeCatalog {
        configs: Mutex<Vec<Configuration>>,
        fail_listing: AtomicBool,
        listing_delay: Mutex<Option<Duration>>,
        lookups: AtomicUsize,
        missing: Mutex<HashSet<SubscriptionId>>,
    }

    impl FakeCatalog {
        fn with_configs(configs: Vec<Configuration>) -> Arc<Self> {
            Arc::new(Self {
                configs: Mutex::new(configs),
                ..Default::default()
            })
        }

        fn replace(&self, configs: Vec<Configuration>) {
            *self.configs.lock().unwrap() = configs;
        }
    }

    #[async_trait]
    impl ConfigsRepo for FakeCatalog {
        async fn list_eligible_configs(&self) -> Result<Vec<Configuration>, RepoError> {
            if self.fail_listing.load(Ordering::SeqCst) {
                return Err(RepoError::from_persistence("catalog offline"));
            }
            let delay = *self.listing_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.configs.lock().unwrap().clone())
        }

        async fn find_config(&self, id: ConfigId) -> Result<Option<Configuration>, RepoError> {
            Ok(self
                .configs
                .lock()
                .unwrap()
                .iter()
                .find(|config| config.id == id)
                .cloned())
        }
    }

    #[async_trait]
    impl SubscriptionsRepo for FakeCatalog {
        async fn get_subscription(
            &self,
            id: SubscriptionId,
            owner: &str,
        ) -> Result<SubscriptionRecord, RepoError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.missing.lock().unwrap().contains(&id) {
                return Err(RepoError::NotFound);
            }
            Ok(SubscriptionRecord::new(
                id,
                owner,
                "upstream",
                "https://sub.example.com/link",
                None,
            )?)
        }
    }

    #[derive(Default)]
    struct FakeRefresher {
        calls: AtomicUsize,
        current: AtomicUsize,
        max_seen: AtomicUsize,
        failing: Mutex<HashSet<ConfigId>>,
        delay: Option<Duration>,
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl ProviderRefresher for FakeRefresher {
        async fn refresh(
            &self,
            _subscription: &SubscriptionRecord,
            config: &Configuration,
        ) -> Result<RefreshOutput, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(current, Ordering::SeqCst);

            if let Some(gate) = &self.gate {
                gate.acquire().await.expect("gate open").forget();
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            self.current.fetch_sub(1, Ordering::SeqCst);
            if self.failing.lock().unwrap().contains(&config.id) {
                return Err(RefreshError::Upstream { status: 503 });
            }
            Ok(RefreshOutput {
                document: Bytes::from(format!("proxies:\n- name: node-{}\n", config.id)),
                nodes: vec![serde_json::json!({ "name": format!("node-{}", config.id) })],
                node_names: vec![format!("node-{}", config.id)],
                node_count: 1,
            })
        }
    }

    fn configuration(id: i64, subscription: i64, interval_secs: i64) -> Configuration {
        Configuration {
            id: ConfigId(id),
            owner: "alice".to_string(),
            name: format!("config-{id}"),
            subscription_id: SubscriptionId(subscription),
            interval_secs,
            params: serde_json::Value::Null,
        }
    }

    struct Harness {
        scheduler: Arc<Scheduler>,
        catalog: Arc<FakeCatalog>,
        refresher: Arc<FakeRefresher>,
        clock: Arc<Mutex<OffsetDateTime>>,
        shutdown_tx: watch::Sender<bool>,
        shutdown: watch::Receiver<bool>,
    }

    impl Harness {
        fn new(configs: Vec<Configuration>, refresher: FakeRefresher) -> Self {
            let catalog = FakeCatalog::with_configs(configs);
            let refresher = Arc::new(refresher);
            let cache = Arc::new(ProviderCache::new(Duration::from_secs(3600)));
            let clock = Arc::new(Mutex::new(T0));
            let clock_source = Arc::clone(&clock);

            let scheduler = Scheduler::new(
                SchedulerConfig::default(),
                catalog.clone(),
                catalog.clone(),
                refresher.clone(),
                cache,
            )
            .expect("valid scheduler")
            .with_clock(Arc::new(move || *clock_source.lock().unwrap()));

            let (shutdown_tx, shutdown) = watch::channel(false);
            Self {
                scheduler: Arc::new(scheduler),
                catalog,
                refresher,
                clock,
                shutdown_tx,
                shutdown,
            }
        }

        fn set_now(&self, now: OffsetDateTime) {
            *self.clock.lock().unwrap() = now;
        }

        async fn scan_at(&mut self, now: OffsetDateTime) -> usize {
            let dispatched = self.scheduler.scan_at(now, &mut self.shutdown).await;
            self.scheduler.wait_for_workers().await;
            dispatched
        }
    }

    #[test]
    fn zero_capacity_fails_at_construction() {
        let catalog = FakeCatalog::with_configs(Vec::new());
        let config = SchedulerConfig {
            worker_capacity: 0,
            ..Default::default()
        };
        let result = Scheduler::new(
            config,
            catalog.clone(),
            catalog,
            Arc::new(FakeRefresher::default()),
            Arc::new(ProviderCache::new(Duration::from_secs(3600))),
        );
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }

    #[tokio::test]
    async fn first_scan_materializes_uncached_configuration() {
        let mut h = Harness::new(vec![configuration(1, 10, 0)], FakeRefresher::default());
        h.scheduler.reload().await.expect("reload");

        let jobs = h.scheduler.select_due(T0);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].reason, DueReason::NoCache);
        assert_eq!(jobs[0].reason.to_string(), "no cache");
        h.scheduler.tracker().mark_finished(ConfigId(1));

        assert_eq!(h.scan_at(T0).await, 1);

        let cache = h.scheduler.cache();
        let entry = cache.get(ConfigId(1)).expect("entry written");
        assert_eq!(entry.fetched_at, T0);
        assert_eq!(entry.interval_secs, 0);
        assert_eq!(entry.node_names, vec!["node-1".to_string()]);
        assert!(!cache.is_expired(Some(&entry), T0 + Duration::from_secs(3600)));
        assert!(cache.is_expired(Some(&entry), T0 + Duration::from_secs(3601)));
        assert!(!h.scheduler.tracker().is_running(ConfigId(1)));
    }

    #[tokio::test]
    async fn elapsed_interval_is_rescheduled() {
        let mut h = Harness::new(vec![configuration(1, 10, 60)], FakeRefresher::default());
        h.scheduler.reload().await.expect("reload");
        h.set_now(T0 - Duration::from_secs(120));
        h.scan_at(T0 - Duration::from_secs(120)).await;

        let entry = h.scheduler.cache().get(ConfigId(1)).expect("entry");
        assert!(h.scheduler.cache().is_expired(Some(&entry), T0));

        let jobs = h.scheduler.select_due(T0);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].reason, DueReason::IntervalElapsed);
    }

    #[tokio::test]
    async fn fresh_entries_are_not_rescheduled() {
        let mut h = Harness::new(vec![configuration(1, 10, 60)], FakeRefresher::default());
        h.scheduler.reload().await.expect("reload");
        assert_eq!(h.scan_at(T0).await, 1);
        assert_eq!(h.scan_at(T0 + Duration::from_secs(59)).await, 0);
        assert_eq!(h.scan_at(T0 + Duration::from_secs(60)).await, 1);
    }

    #[tokio::test]
    async fn repeated_failures_back_off() {
        let refresher = FakeRefresher::default();
        refresher.failing.lock().unwrap().insert(ConfigId(1));
        let mut h = Harness::new(vec![configuration(1, 10, 0)], refresher);
        h.scheduler.reload().await.expect("reload");

        let mut now = T0;
        for expected in [30, 60, 120] {
            h.set_now(now);
            assert_eq!(h.scan_at(now).await, 1);
            let state = h.scheduler.tracker().state(ConfigId(1)).expect("state");
            assert_eq!(state.retry_delay, Duration::from_secs(expected));
            assert_eq!(state.block_until, Some(now + Duration::from_secs(expected)));
            now += Duration::from_secs(expected);
        }

        let third_failure = now - Duration::from_secs(120);
        assert_eq!(h.scan_at(third_failure + Duration::from_secs(90)).await, 0);
        assert_eq!(h.scan_at(third_failure + Duration::from_secs(121)).await, 1);
        assert!(h.scheduler.cache().get(ConfigId(1)).is_none());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_entry() {
        let mut h = Harness::new(vec![configuration(1, 10, 60)], FakeRefresher::default());
        h.scheduler.reload().await.expect("reload");
        h.scan_at(T0).await;

        h.refresher.failing.lock().unwrap().insert(ConfigId(1));
        let later = T0 + Duration::from_secs(120);
        h.set_now(later);
        assert_eq!(h.scan_at(later).await, 1);

        let entry = h.scheduler.cache().get(ConfigId(1)).expect("entry kept");
        assert_eq!(entry.fetched_at, T0);
        let state = h.scheduler.tracker().state(ConfigId(1)).expect("state");
        assert_eq!(state.retry_delay, Duration::from_secs(30));

        h.refresher.failing.lock().unwrap().clear();
        let recovered = later + Duration::from_secs(30);
        h.set_now(recovered);
        assert_eq!(h.scan_at(recovered).await, 1);
        assert_eq!(
            h.scheduler.tracker().state(ConfigId(1)),
            Some(Default::default())
        );
    }

    #[tokio::test]
    async fn unresolvable_subscription_counts_as_failure() {
        let mut h = Harness::new(vec![configuration(1, 99, 0)], FakeRefresher::default());
        h.catalog.missing.lock().unwrap().insert(SubscriptionId(99));
        h.scheduler.reload().await.expect("reload");

        assert_eq!(h.scan_at(T0).await, 1);
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 0);
        let state = h.scheduler.tracker().state(ConfigId(1)).expect("state");
        assert_eq!(state.block_until, Some(T0 + Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn removed_configuration_is_forgotten_on_reload() {
        let mut h = Harness::new(
            vec![configuration(1, 10, 0), configuration(2, 10, 0)],
            FakeRefresher::default(),
        );
        h.scheduler.reload().await.expect("reload");
        h.scan_at(T0).await;
        assert!(h.scheduler.cache().get(ConfigId(1)).is_some());

        h.catalog.replace(vec![configuration(2, 10, 0)]);
        assert_eq!(h.scheduler.reload().await.expect("reload"), 1);

        assert!(h.scheduler.cache().get(ConfigId(1)).is_none());
        assert!(h.scheduler.tracker().state(ConfigId(1)).is_none());
        assert!(h.scheduler.cache().get(ConfigId(2)).is_some());
    }

    #[tokio::test]
    async fn interval_edit_applies_without_refetch() {
        let mut h = Harness::new(vec![configuration(1, 10, 3600)], FakeRefresher::default());
        h.scheduler.reload().await.expect("reload");
        h.scan_at(T0).await;

        h.catalog.replace(vec![configuration(1, 10, 60)]);
        h.scheduler.reload().await.expect("reload");

        let entry = h.scheduler.cache().get(ConfigId(1)).expect("entry");
        assert_eq!(entry.interval_secs, 60);
        assert_eq!(entry.fetched_at, T0);
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_set() {
        let h = Harness::new(vec![configuration(1, 10, 0)], FakeRefresher::default());
        h.scheduler.reload().await.expect("reload");

        h.catalog.fail_listing.store(true, Ordering::SeqCst);
        h.catalog.replace(Vec::new());
        let err = h.scheduler.reload().await.expect_err("listing fails");
        assert!(matches!(err, SchedulerError::Reload(_)));
        assert_eq!(h.scheduler.known_configs().len(), 1);
    }

    #[tokio::test]
    async fn shared_subscription_is_looked_up_once_per_scan() {
        let mut h = Harness::new(
            vec![
                configuration(1, 10, 0),
                configuration(2, 10, 0),
                configuration(3, 11, 0),
            ],
            FakeRefresher::default(),
        );
        h.scheduler.reload().await.expect("reload");

        assert_eq!(h.scan_at(T0).await, 3);
        assert_eq!(h.catalog.lookups.load(Ordering::SeqCst), 2);
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn running_configuration_is_not_scheduled_twice() {
        let gate = Arc::new(Semaphore::new(0));
        let refresher = FakeRefresher {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let mut h = Harness::new(vec![configuration(1, 10, 0)], refresher);
        h.scheduler.reload().await.expect("reload");

        let first = h.scheduler.scan_at(T0, &mut h.shutdown).await;
        let second = h
            .scheduler
            .scan_at(T0 + Duration::from_secs(15), &mut h.shutdown)
            .await;
        assert_eq!((first, second), (1, 0));
        assert!(h.scheduler.tracker().is_running(ConfigId(1)));

        gate.add_permits(1);
        h.scheduler.wait_for_workers().await;
        assert!(!h.scheduler.tracker().is_running(ConfigId(1)));
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_never_exceeds_capacity() {
        let configs = (1..=12).map(|id| configuration(id, id, 0)).collect();
        let refresher = FakeRefresher {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let mut h = Harness::new(configs, refresher);
        h.scheduler.reload().await.expect("reload");

        assert_eq!(h.scan_at(T0).await, 12);
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 12);
        let max = h.refresher.max_seen.load(Ordering::SeqCst);
        assert!(max <= 4, "observed {max} concurrent refreshes");
        assert_eq!(h.scheduler.cache().len(), 12);
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_workers() {
        let gate = Arc::new(Semaphore::new(0));
        let refresher = FakeRefresher {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let h = Harness::new(vec![configuration(1, 10, 0)], refresher);

        let handle = tokio::spawn(Arc::clone(&h.scheduler).run(h.shutdown.clone()));
        while h.refresher.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        h.shutdown_tx.send(true).expect("scheduler listening");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        gate.add_permits(1);
        handle.await.expect("scheduler task");
        assert_eq!(h.scheduler.tracker().running_count(), 0);
        assert!(h.scheduler.cache().get(ConfigId(1)).is_some());
    }

    #[tokio::test]
    async fn scan_after_shutdown_releases_claims() {
        let mut h = Harness::new(vec![configuration(1, 10, 0)], FakeRefresher::default());
        h.scheduler.reload().await.expect("reload");
        h.shutdown_tx.send(true).expect("receiver alive");

        assert_eq!(h.scan_at(T0).await, 0);
        assert!(!h.scheduler.tracker().is_running(ConfigId(1)));
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn result_for_configuration_removed_mid_refresh_is_discarded() {
        let gate = Arc::new(Semaphore::new(0));
        let refresher = FakeRefresher {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let mut h = Harness::new(vec![configuration(1, 10, 0)], refresher);
        h.scheduler.reload().await.expect("reload");
        assert_eq!(h.scheduler.scan_at(T0, &mut h.shutdown).await, 1);

        h.catalog.replace(Vec::new());
        assert_eq!(h.scheduler.reload().await.expect("reload"), 0);

        gate.add_permits(1);
        h.scheduler.wait_for_workers().await;
        assert!(h.scheduler.cache().get(ConfigId(1)).is_none());
        assert!(h.scheduler.tracker().state(ConfigId(1)).is_none());
    }

    #[tokio::test]
    async fn failure_for_configuration_removed_mid_refresh_leaves_no_state() {
        let gate = Arc::new(Semaphore::new(0));
        let refresher = FakeRefresher {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        refresher.failing.lock().unwrap().insert(ConfigId(1));
        let mut h = Harness::new(vec![configuration(1, 10, 0)], refresher);
        h.scheduler.reload().await.expect("reload");
        assert_eq!(h.scheduler.scan_at(T0, &mut h.shutdown).await, 1);

        h.catalog.replace(Vec::new());
        h.scheduler.reload().await.expect("reload");
        assert!(h.scheduler.tracker().state(ConfigId(1)).is_none());

        gate.add_permits(1);
        h.scheduler.wait_for_workers().await;
        h.scheduler.reload().await.expect("reload");

        assert!(h.scheduler.tracker().state(ConfigId(1)).is_none());
        assert!(!h.scheduler.tracker().is_running(ConfigId(1)));
        assert!(h.scheduler.cache().get(ConfigId(1)).is_none());
    }

    #[tokio::test]
    async fn shutdown_interrupts_slow_reload() {
        let h = Harness::new(vec![configuration(1, 10, 0)], FakeRefresher::default());
        *h.catalog.listing_delay.lock().unwrap() = Some(Duration::from_secs(60));

        let handle = tokio::spawn(Arc::clone(&h.scheduler).run(h.shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.shutdown_tx.send(true).expect("scheduler listening");

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler stops without waiting for the reload")
            .expect("scheduler task");
        assert!(h.scheduler.known_configs().is_empty());
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 0);
    }
}
