#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use subrelay::application::refresh::{ProviderRefresher, RefreshError, RefreshOutput};
use subrelay::application::repos::{ConfigsRepo, RepoError, SubscriptionsRepo};
use subrelay::cache::{ProviderCache, ProviderService};
use subrelay::domain::entities::{
    ConfigId, Configuration, SubscriptionId, SubscriptionRecord,
};
use subrelay::infra::upstream::render_provider;

pub const SUBSCRIPTION_BODY: &str = r#"
proxies:
  - name: "HK 01"
    type: ss
    server: hk.example.com
    port: 443
  - name: "SG 01"
    type: vmess
    server: sg.example.com
    port: 8443
rules:
  - MATCH,DIRECT
"#;

pub fn configuration(id: i64, owner: &str, subscription_id: i64, interval_secs: i64) -> Configuration {
    Configuration {
        id: ConfigId(id),
        owner: owner.to_string(),
        name: format!("config-{id}"),
        subscription_id: SubscriptionId(subscription_id),
        interval_secs,
        params: serde_json::Value::Null,
    }
}

pub fn subscription(id: i64, owner: &str) -> SubscriptionRecord {
    SubscriptionRecord::new(
        SubscriptionId(id),
        owner,
        format!("sub-{id}"),
        &format!("https://sub.example.com/{id}"),
        None,
    )
    .expect("valid subscription")
}

/// In-memory catalog implementing both collaborator traits.
#[derive(Default)]
pub struct MemoryCatalog {
    configs: Mutex<Vec<Configuration>>,
    subscriptions: Mutex<Vec<SubscriptionRecord>>,
    pub subscription_lookups: AtomicUsize,
}

impl MemoryCatalog {
    pub fn new(configs: Vec<Configuration>, subscriptions: Vec<SubscriptionRecord>) -> Self {
        Self {
            configs: Mutex::new(configs),
            subscriptions: Mutex::new(subscriptions),
            subscription_lookups: AtomicUsize::new(0),
        }
    }

    pub fn lookups(&self) -> usize {
        self.subscription_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigsRepo for MemoryCatalog {
    async fn list_eligible_configs(&self) -> Result<Vec<Configuration>, RepoError> {
        Ok(self.configs.lock().expect("configs lock").clone())
    }

    async fn find_config(&self, id: ConfigId) -> Result<Option<Configuration>, RepoError> {
        Ok(self
            .configs
            .lock()
            .expect("configs lock")
            .iter()
            .find(|config| config.id == id)
            .cloned())
    }
}

#[async_trait]
impl SubscriptionsRepo for MemoryCatalog {
    async fn get_subscription(
        &self,
        id: SubscriptionId,
        owner: &str,
    ) -> Result<SubscriptionRecord, RepoError> {
        self.subscription_lookups.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .lock()
            .expect("subscriptions lock")
            .iter()
            .find(|record| record.id == id && record.owner == owner)
            .cloned()
            .ok_or(RepoError::NotFound)
    }
}

/// Refresher rendering a fixed body, optionally failing with an upstream status.
#[derive(Default)]
pub struct StaticRefresher {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl StaticRefresher {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderRefresher for StaticRefresher {
    async fn refresh(
        &self,
        _subscription: &SubscriptionRecord,
        _config: &Configuration,
    ) -> Result<RefreshOutput, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RefreshError::Upstream { status: 503 });
        }
        render_provider(SUBSCRIPTION_BODY.as_bytes())
    }
}

pub fn provider_service(refresher: Arc<StaticRefresher>) -> Arc<ProviderService> {
    let cache = Arc::new(ProviderCache::new(Duration::from_secs(3600)));
    Arc::new(ProviderService::new(cache, refresher, Duration::from_secs(5)))
}
