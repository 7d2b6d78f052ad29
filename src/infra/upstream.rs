//! Upstream fetch of subscription documents.
//!
//! Fetches the subscription body over HTTP, validates its `proxies` list and
//! re-emits it as a provider document. Transformation parameters are carried
//! on the configuration but not interpreted here.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, header::USER_AGENT};
use serde::Serialize;
use serde_yaml::{Mapping, Value as YamlValue};
use tracing::{debug, instrument};

use crate::application::refresh::{ProviderRefresher, RefreshError, RefreshOutput};
use crate::config::UpstreamSettings;
use crate::domain::entities::{Configuration, SubscriptionRecord};

use super::error::InfraError;

#[derive(Serialize)]
struct ProviderDocument<'a> {
    proxies: &'a [YamlValue],
}

/// [`ProviderRefresher`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpRefresher {
    client: Client,
    default_user_agent: String,
    request_timeout: Duration,
}

impl HttpRefresher {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| InfraError::http_client(err.to_string()))?;

        Ok(Self {
            client,
            default_user_agent: settings.user_agent.clone(),
            request_timeout: settings.request_timeout,
        })
    }
}

#[async_trait]
impl ProviderRefresher for HttpRefresher {
    #[instrument(
        skip(self, subscription, config),
        fields(config_id = %config.id, subscription_id = %subscription.id)
    )]
    async fn refresh(
        &self,
        subscription: &SubscriptionRecord,
        config: &Configuration,
    ) -> Result<RefreshOutput, RefreshError> {
        let user_agent = subscription
            .user_agent
            .as_deref()
            .unwrap_or(&self.default_user_agent);

        let response = self
            .client
            .get(subscription.url.clone())
            .header(USER_AGENT, user_agent)
            .send()
            .await
            .map_err(|err| self.map_transport(err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefreshError::Upstream {
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| self.map_transport(err))?;
        debug!(bytes = body.len(), "Subscription body received");

        render_provider(&body)
    }
}

impl HttpRefresher {
    fn map_transport(&self, err: reqwest::Error) -> RefreshError {
        if err.is_timeout() {
            RefreshError::Timeout {
                after: self.request_timeout,
            }
        } else {
            RefreshError::transport(err)
        }
    }
}

/// Validate a subscription body and produce the provider document.
///
/// The body must be a YAML mapping with a `proxies` sequence whose entries
/// are mappings carrying a string `name`.
pub fn render_provider(body: &[u8]) -> Result<RefreshOutput, RefreshError> {
    let root: YamlValue = serde_yaml::from_slice(body)
        .map_err(|err| RefreshError::payload(format!("invalid YAML: {err}")))?;

    let proxies = root
        .get("proxies")
        .and_then(YamlValue::as_sequence)
        .ok_or_else(|| RefreshError::payload("missing `proxies` sequence"))?;

    let mut node_names = Vec::with_capacity(proxies.len());
    let mut nodes = Vec::with_capacity(proxies.len());
    for (index, proxy) in proxies.iter().enumerate() {
        let name = proxy
            .as_mapping()
            .and_then(|mapping: &Mapping| mapping.get("name"))
            .and_then(YamlValue::as_str)
            .ok_or_else(|| RefreshError::payload(format!("proxy #{index} has no string `name`")))?;
        node_names.push(name.to_string());

        let node = serde_json::to_value(proxy)
            .map_err(|err| RefreshError::payload(format!("proxy `{name}`: {err}")))?;
        nodes.push(node);
    }

    let document = serde_yaml::to_string(&ProviderDocument { proxies })
        .map_err(|err| RefreshError::payload(format!("failed to encode provider: {err}")))?;

    Ok(RefreshOutput {
        document: Bytes::from(document),
        node_count: nodes.len(),
        nodes,
        node_names,
    })
}
