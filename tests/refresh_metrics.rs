mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use subrelay::application::repos::{ConfigsRepo, SubscriptionsRepo};
use subrelay::cache::{ProviderCache, Scheduler, SchedulerConfig};
use tokio::sync::watch;

use common::{MemoryCatalog, StaticRefresher, configuration, provider_service, subscription};

#[tokio::test]
async fn refresh_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let catalog = Arc::new(MemoryCatalog::new(
        vec![
            configuration(1, "alice", 1, 0),
            configuration(2, "alice", 1, 0),
        ],
        vec![subscription(1, "alice")],
    ));
    let refresher = Arc::new(StaticRefresher::default());
    let configs: Arc<dyn ConfigsRepo> = catalog.clone();
    let subscriptions: Arc<dyn SubscriptionsRepo> = catalog.clone();

    // Scheduler path: one reload and one scan refresh both configurations.
    let scheduler = Arc::new(
        Scheduler::new(
            SchedulerConfig {
                worker_capacity: 2,
                ..SchedulerConfig::default()
            },
            configs.clone(),
            subscriptions.clone(),
            refresher.clone(),
            Arc::new(ProviderCache::new(Duration::from_secs(3600))),
        )
        .expect("valid scheduler"),
    );
    assert_eq!(scheduler.reload().await.expect("reload"), 2);
    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
    assert_eq!(scheduler.scan(&mut shutdown_rx).await, 2);
    scheduler.wait_for_workers().await;
    assert_eq!(catalog.lookups(), 1);

    // On-demand path: one success and one upstream failure.
    let providers = provider_service(refresher.clone());
    let config = configuration(3, "alice", 1, 0);
    providers
        .get_or_refresh(&config, subscriptions.as_ref())
        .await
        .expect("on-demand refresh");
    refresher.set_failing(true);
    let record = subscription(1, "alice");
    assert!(providers.refresh(&config, &record).await.is_err());

    let snapshot = snapshotter.snapshot().into_vec();
    let names: HashSet<String> = snapshot
        .iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "subrelay_refresh_total",
        "subrelay_refresh_ms",
        "subrelay_subscription_lookup_total",
        "subrelay_reload_total",
        "subrelay_cache_entries",
        "subrelay_refresh_inflight",
    ];
    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }

    let refresh_count = |origin: &str, outcome: &str| -> u64 {
        snapshot
            .iter()
            .filter(|(composite_key, _, _, _)| {
                let key = composite_key.key();
                key.name() == "subrelay_refresh_total"
                    && key
                        .labels()
                        .any(|label| label.key() == "origin" && label.value() == origin)
                    && key
                        .labels()
                        .any(|label| label.key() == "outcome" && label.value() == outcome)
            })
            .map(|(_, _, _, value)| match value {
                DebugValue::Counter(count) => *count,
                _ => 0,
            })
            .sum()
    };

    assert_eq!(refresh_count("scheduler", "success"), 2);
    assert_eq!(refresh_count("on_demand", "success"), 1);
    assert_eq!(refresh_count("on_demand", "upstream_status"), 1);
}
