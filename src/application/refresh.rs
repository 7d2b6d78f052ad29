//! The refresh operation that materializes one configuration.
//!
//! Both the background scheduler and the serve-time fallback call the same
//! [`ProviderRefresher`]; it must be safe to invoke concurrently for
//! different configurations and must not touch shared state beyond its
//! return value.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::application::repos::RepoError;
use crate::domain::entities::{Configuration, SubscriptionRecord};

/// Rendered provider document plus the derived views used for previews.
#[derive(Debug, Clone)]
pub struct RefreshOutput {
    pub document: Bytes,
    pub nodes: Vec<serde_json::Value>,
    pub node_names: Vec<String>,
    pub node_count: usize,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("upstream responded with status {status}")]
    Upstream { status: u16 },
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("upstream payload is malformed: {0}")]
    Payload(String),
    #[error("refresh timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },
    #[error("subscription could not be resolved: {0}")]
    Resolution(#[source] RepoError),
}

impl RefreshError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn payload(message: impl Into<String>) -> Self {
        Self::Payload(message.into())
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RefreshError::Upstream { .. } => "upstream_status",
            RefreshError::Transport(_) => "transport",
            RefreshError::Payload(_) => "payload",
            RefreshError::Timeout { .. } => "timeout",
            RefreshError::Resolution(_) => "resolution",
        }
    }
}

#[async_trait]
pub trait ProviderRefresher: Send + Sync {
    async fn refresh(
        &self,
        subscription: &SubscriptionRecord,
        config: &Configuration,
    ) -> Result<RefreshOutput, RefreshError>;
}

/// Run a refresh under a deadline, folding an elapsed timer into [`RefreshError::Timeout`].
pub async fn refresh_with_timeout(
    refresher: &dyn ProviderRefresher,
    subscription: &SubscriptionRecord,
    config: &Configuration,
    timeout: Duration,
) -> Result<RefreshOutput, RefreshError> {
    match tokio::time::timeout(timeout, refresher.refresh(subscription, config)).await {
        Ok(result) => result,
        Err(_) => Err(RefreshError::Timeout { after: timeout }),
    }
}
