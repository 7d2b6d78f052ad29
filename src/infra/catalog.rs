//! File-backed catalog of subscriptions and configurations.
//!
//! The TOML file is re-read on every call, so edits made by an
//! administrator show up at the next reload cycle without a restart.
//!
//! ```toml
//! [[subscriptions]]
//! id = 1
//! owner = "alice"
//! name = "main"
//! url = "https://sub.example.com/link?token=..."
//!
//! [[configs]]
//! id = 10
//! owner = "alice"
//! name = "hk-only"
//! subscription_id = 1
//! interval = 1800
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::application::repos::{ConfigsRepo, RepoError, SubscriptionsRepo};
use crate::domain::entities::{ConfigId, Configuration, SubscriptionId, SubscriptionRecord};

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    subscriptions: Vec<SubscriptionRow>,
    #[serde(default)]
    configs: Vec<ConfigRow>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionRow {
    id: i64,
    owner: String,
    name: String,
    url: String,
    #[serde(default)]
    user_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigRow {
    id: i64,
    owner: String,
    name: String,
    subscription_id: i64,
    #[serde(default)]
    interval: i64,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    #[serde(default)]
    params: toml::Table,
}

fn enabled_by_default() -> bool {
    true
}

impl CatalogFile {
    fn parse(data: &str) -> Result<Self, RepoError> {
        let file: CatalogFile =
            toml::from_str(data).map_err(|err| RepoError::invalid(format!("catalog: {err}")))?;

        let mut seen = HashSet::new();
        if let Some(row) = file.subscriptions.iter().find(|row| !seen.insert(row.id)) {
            return Err(RepoError::invalid(format!(
                "duplicate subscription id {}",
                row.id
            )));
        }

        let mut seen = HashSet::new();
        if let Some(row) = file.configs.iter().find(|row| !seen.insert(row.id)) {
            return Err(RepoError::invalid(format!(
                "duplicate configuration id {}",
                row.id
            )));
        }

        Ok(file)
    }
}

impl ConfigRow {
    fn to_configuration(&self) -> Result<Configuration, RepoError> {
        let params = serde_json::to_value(&self.params).map_err(|err| {
            RepoError::invalid(format!("configuration {} params: {err}", self.id))
        })?;

        Ok(Configuration {
            id: ConfigId(self.id),
            owner: self.owner.clone(),
            name: self.name.clone(),
            subscription_id: SubscriptionId(self.subscription_id),
            interval_secs: self.interval,
            params,
        })
    }
}

/// Catalog collaborator reading a TOML file.
#[derive(Debug, Clone)]
pub struct TomlCatalog {
    path: PathBuf,
}

impl TomlCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<CatalogFile, RepoError> {
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| {
                RepoError::from_persistence(format!("{}: {err}", self.path.display()))
            })?;
        CatalogFile::parse(&data)
    }
}

#[async_trait]
impl ConfigsRepo for TomlCatalog {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn list_eligible_configs(&self) -> Result<Vec<Configuration>, RepoError> {
        let file = self.read().await?;
        let configs = file
            .configs
            .iter()
            .filter(|row| row.enabled)
            .map(ConfigRow::to_configuration)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            eligible = configs.len(),
            total = file.configs.len(),
            "Catalog configurations listed"
        );
        Ok(configs)
    }

    async fn find_config(&self, id: ConfigId) -> Result<Option<Configuration>, RepoError> {
        let file = self.read().await?;
        file.configs
            .iter()
            .find(|row| row.id == id.0)
            .map(ConfigRow::to_configuration)
            .transpose()
    }
}

#[async_trait]
impl SubscriptionsRepo for TomlCatalog {
    async fn get_subscription(
        &self,
        id: SubscriptionId,
        owner: &str,
    ) -> Result<SubscriptionRecord, RepoError> {
        let file = self.read().await?;
        let row = file
            .subscriptions
            .into_iter()
            .find(|row| row.id == id.0 && row.owner == owner)
            .ok_or(RepoError::NotFound)?;

        SubscriptionRecord::new(id, row.owner, row.name, &row.url, row.user_agent)
            .map_err(|err| RepoError::invalid(format!("subscription {id}: {err}")))
    }
}
