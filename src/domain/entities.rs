//! Records mirrored from the durable catalog.
//!
//! The cache only ever reads these; ownership stays with the catalog.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use super::error::DomainError;

/// Refresh cadence applied when a configuration leaves its interval unset.
pub const DEFAULT_INTERVAL_SECS: i64 = 3600;

/// Identifier of an administrator-defined configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigId(pub i64);

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an upstream subscription record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub i64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A filtering/transformation rule bound to one upstream subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub id: ConfigId,
    pub owner: String,
    pub name: String,
    pub subscription_id: SubscriptionId,
    /// Refresh cadence in seconds; non-positive means "use the default".
    pub interval_secs: i64,
    /// Transformation parameters, opaque to the cache.
    pub params: serde_json::Value,
}

/// An upstream subscription endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub id: SubscriptionId,
    pub owner: String,
    pub name: String,
    pub url: Url,
    pub user_agent: Option<String>,
}

impl SubscriptionRecord {
    /// Build a record, rejecting URLs that cannot be fetched over HTTP.
    pub fn new(
        id: SubscriptionId,
        owner: impl Into<String>,
        name: impl Into<String>,
        url: &str,
        user_agent: Option<String>,
    ) -> Result<Self, DomainError> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("url", "must not be empty"));
        }

        let url = Url::parse(trimmed)
            .map_err(|err| DomainError::validation("url", format!("`{trimmed}`: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DomainError::validation(
                "url",
                format!("unsupported scheme `{}`", url.scheme()),
            ));
        }

        let user_agent = user_agent.and_then(|value| {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        });

        Ok(Self {
            id,
            owner: owner.into(),
            name: name.into(),
            url,
            user_agent,
        })
    }
}
