//! Materialized provider documents, keyed by configuration.
//!
//! Readers on the serve path vastly outnumber writers, so the map sits
//! behind a single `RwLock` and entries are shared as `Arc`s: a reader
//! clones the pointer and releases the lock before touching the payload.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use metrics::gauge;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;

use crate::application::refresh::RefreshOutput;
use crate::domain::entities::ConfigId;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";
const METRIC_CACHE_ENTRIES: &str = "subrelay_cache_entries";

/// The rendering produced by the last successful refresh of one configuration.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub config_id: ConfigId,
    pub document: Bytes,
    pub nodes: Vec<serde_json::Value>,
    pub node_names: Vec<String>,
    pub fetched_at: OffsetDateTime,
    /// Configured cadence in seconds; non-positive falls back to the store default.
    pub interval_secs: i64,
    pub node_count: usize,
}

impl CacheEntry {
    pub fn from_refresh(
        config_id: ConfigId,
        output: RefreshOutput,
        fetched_at: OffsetDateTime,
        interval_secs: i64,
    ) -> Self {
        Self {
            config_id,
            document: output.document,
            nodes: output.nodes,
            node_names: output.node_names,
            fetched_at,
            interval_secs,
            node_count: output.node_count,
        }
    }
}

/// Diagnostic view of a single configuration's cache slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderStatus {
    pub cached: bool,
    pub expired: bool,
    pub node_count: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub fetched_at: Option<OffsetDateTime>,
    pub interval_secs: i64,
}

pub struct ProviderCache {
    entries: RwLock<HashMap<ConfigId, Arc<CacheEntry>>>,
    default_interval: Duration,
}

impl ProviderCache {
    pub fn new(default_interval: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_interval,
        }
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    /// Interval used for freshness decisions.
    pub fn effective_interval(&self, interval_secs: i64) -> Duration {
        if interval_secs > 0 {
            Duration::from_secs(interval_secs as u64)
        } else {
            self.default_interval
        }
    }

    pub fn get(&self, id: ConfigId) -> Option<Arc<CacheEntry>> {
        rw_read(&self.entries, SOURCE, "get").get(&id).cloned()
    }

    /// Store a freshly materialized entry.
    ///
    /// An entry older than the one already held is dropped so that
    /// `fetched_at` never moves backwards for a configuration. Returns
    /// whether the entry was stored.
    pub fn set(&self, entry: CacheEntry) -> bool {
        let id = entry.config_id;
        let (stored, len) = {
            let mut entries = rw_write(&self.entries, SOURCE, "set");
            let stale = entries
                .get(&id)
                .is_some_and(|current| current.fetched_at > entry.fetched_at);
            if !stale {
                entries.insert(id, Arc::new(entry));
            }
            (!stale, entries.len())
        };

        if !stored {
            debug!(config_id = %id, "Dropped out-of-order cache write");
        }
        gauge!(METRIC_CACHE_ENTRIES).set(len as f64);
        stored
    }

    pub fn delete(&self, id: ConfigId) -> bool {
        let (removed, len) = {
            let mut entries = rw_write(&self.entries, SOURCE, "delete");
            let removed = entries.remove(&id).is_some();
            (removed, entries.len())
        };
        gauge!(METRIC_CACHE_ENTRIES).set(len as f64);
        removed
    }

    /// Replace the cadence of an existing entry without touching its content.
    ///
    /// Absent entries are left absent.
    pub fn update_interval(&self, id: ConfigId, interval_secs: i64) -> bool {
        let mut entries = rw_write(&self.entries, SOURCE, "update_interval");
        match entries.get_mut(&id) {
            Some(entry) if entry.interval_secs != interval_secs => {
                Arc::make_mut(entry).interval_secs = interval_secs;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
        gauge!(METRIC_CACHE_ENTRIES).set(0.0);
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` when the entry is missing or older than its effective interval.
    pub fn is_expired(&self, entry: Option<&CacheEntry>, now: OffsetDateTime) -> bool {
        match entry {
            None => true,
            Some(entry) => now - entry.fetched_at > self.effective_interval(entry.interval_secs),
        }
    }

    /// Scheduler due-ness: the interval boundary itself already counts as due.
    pub fn is_due(&self, entry: Option<&CacheEntry>, now: OffsetDateTime) -> bool {
        match entry {
            None => true,
            Some(entry) => now >= entry.fetched_at + self.effective_interval(entry.interval_secs),
        }
    }

    pub fn status(&self, id: ConfigId, now: OffsetDateTime) -> ProviderStatus {
        let entry = self.get(id);
        self.describe(entry.as_deref(), now)
    }

    /// Status of every cached configuration, ordered by id.
    pub fn snapshot(&self, now: OffsetDateTime) -> BTreeMap<ConfigId, ProviderStatus> {
        let entries: Vec<Arc<CacheEntry>> = rw_read(&self.entries, SOURCE, "snapshot")
            .values()
            .cloned()
            .collect();

        entries
            .iter()
            .map(|entry| (entry.config_id, self.describe(Some(entry), now)))
            .collect()
    }

    fn describe(&self, entry: Option<&CacheEntry>, now: OffsetDateTime) -> ProviderStatus {
        ProviderStatus {
            cached: entry.is_some(),
            expired: self.is_expired(entry, now),
            node_count: entry.map_or(0, |entry| entry.node_count),
            fetched_at: entry.map(|entry| entry.fetched_at),
            interval_secs: entry.map_or(0, |entry| entry.interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    const DEFAULT: Duration = Duration::from_secs(3600);

    fn entry(id: i64, fetched_at: OffsetDateTime, interval_secs: i64) -> CacheEntry {
        CacheEntry {
            config_id: ConfigId(id),
            document: Bytes::from_static(b"proxies: []\n"),
            nodes: Vec::new(),
            node_names: vec!["hk-01".to_string()],
            fetched_at,
            interval_secs,
            node_count: 1,
        }
    }

    #[test]
    fn missing_entry_is_expired() {
        let store = ProviderCache::new(DEFAULT);
        assert!(store.is_expired(None, OffsetDateTime::now_utc()));
        assert!(store.is_due(None, OffsetDateTime::now_utc()));
    }

    #[test]
    fn expiry_matches_effective_interval() {
        let store = ProviderCache::new(DEFAULT);
        let now = datetime!(2024-05-01 12:00 UTC);

        let cases = [
            (60, 59, false),
            (60, 60, false),
            (60, 61, true),
            (0, 3600, false),
            (0, 3601, true),
            (-5, 3601, true),
            (7200, 3601, false),
        ];
        for (interval, age, expected) in cases {
            let e = entry(1, now - Duration::from_secs(age), interval);
            assert_eq!(
                store.is_expired(Some(&e), now),
                expected,
                "interval={interval} age={age}"
            );
        }
    }

    #[test]
    fn entry_two_minutes_old_with_minute_interval_is_expired() {
        let store = ProviderCache::new(DEFAULT);
        let now = datetime!(2024-05-01 12:00 UTC);
        store.set(entry(7, now - Duration::from_secs(120), 60));

        let cached = store.get(ConfigId(7)).expect("entry stored");
        assert!(store.is_expired(Some(&cached), now));
        assert!(store.is_due(Some(&cached), now));
    }

    #[test]
    fn due_at_exact_boundary() {
        let store = ProviderCache::new(DEFAULT);
        let now = datetime!(2024-05-01 12:00 UTC);
        let e = entry(1, now - Duration::from_secs(60), 60);
        assert!(store.is_due(Some(&e), now));
        assert!(!store.is_expired(Some(&e), now));
    }

    #[test]
    fn update_interval_keeps_content() {
        let store = ProviderCache::new(DEFAULT);
        let fetched_at = datetime!(2024-05-01 11:00 UTC);
        store.set(entry(3, fetched_at, 3600));

        assert!(store.update_interval(ConfigId(3), 60));
        let updated = store.get(ConfigId(3)).expect("entry kept");
        assert_eq!(updated.interval_secs, 60);
        assert_eq!(updated.fetched_at, fetched_at);
        assert_eq!(updated.node_names, vec!["hk-01".to_string()]);
    }

    #[test]
    fn update_interval_on_absent_entry_is_noop() {
        let store = ProviderCache::new(DEFAULT);
        assert!(!store.update_interval(ConfigId(9), 60));
        assert!(store.get(ConfigId(9)).is_none());
    }

    #[test]
    fn older_write_does_not_replace_newer_entry() {
        let store = ProviderCache::new(DEFAULT);
        let newer = datetime!(2024-05-01 12:00 UTC);
        let older = datetime!(2024-05-01 11:00 UTC);

        assert!(store.set(entry(1, newer, 60)));
        assert!(!store.set(entry(1, older, 60)));
        assert_eq!(store.get(ConfigId(1)).expect("entry").fetched_at, newer);
    }

    #[test]
    fn readers_keep_their_snapshot_after_replacement() {
        let store = ProviderCache::new(DEFAULT);
        let t0 = datetime!(2024-05-01 11:00 UTC);
        store.set(entry(1, t0, 60));
        let held = store.get(ConfigId(1)).expect("entry");

        store.set(entry(1, t0 + Duration::from_secs(60), 60));
        assert_eq!(held.fetched_at, t0);
    }

    #[test]
    fn delete_and_clear() {
        let store = ProviderCache::new(DEFAULT);
        let now = OffsetDateTime::now_utc();
        store.set(entry(1, now, 0));
        store.set(entry(2, now, 0));

        assert!(store.delete(ConfigId(1)));
        assert!(!store.delete(ConfigId(1)));
        assert_eq!(store.len(), 1);

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn status_and_snapshot_report_entries() {
        let store = ProviderCache::new(DEFAULT);
        let now = datetime!(2024-05-01 12:00 UTC);
        store.set(entry(2, now - Duration::from_secs(30), 60));
        store.set(entry(1, now - Duration::from_secs(90), 60));

        let missing = store.status(ConfigId(5), now);
        assert!(!missing.cached);
        assert!(missing.expired);
        assert_eq!(missing.fetched_at, None);

        let snapshot = store.snapshot(now);
        let ids: Vec<_> = snapshot.keys().copied().collect();
        assert_eq!(ids, vec![ConfigId(1), ConfigId(2)]);
        assert!(snapshot[&ConfigId(1)].expired);
        assert!(!snapshot[&ConfigId(2)].expired);
        assert_eq!(snapshot[&ConfigId(2)].node_count, 1);
    }
}
