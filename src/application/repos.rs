//! Repository traits describing the durable catalog collaborators.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::{ConfigId, Configuration, SubscriptionId, SubscriptionRecord};
use crate::domain::error::DomainError;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("resource not found")]
    NotFound,
    #[error("invalid record: {message}")]
    Invalid { message: String },
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// Source of the configuration set the scheduler keeps fresh.
#[async_trait]
pub trait ConfigsRepo: Send + Sync {
    /// Every configuration that should currently be materialized.
    async fn list_eligible_configs(&self) -> Result<Vec<Configuration>, RepoError>;

    /// Look up a single configuration regardless of eligibility.
    async fn find_config(&self, id: ConfigId) -> Result<Option<Configuration>, RepoError>;
}

/// Source of upstream subscription metadata.
#[async_trait]
pub trait SubscriptionsRepo: Send + Sync {
    /// Resolve a subscription owned by `owner`. Foreign records are reported as `NotFound`.
    async fn get_subscription(
        &self,
        id: SubscriptionId,
        owner: &str,
    ) -> Result<SubscriptionRecord, RepoError>;
}
