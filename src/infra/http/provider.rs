use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header::CONTENT_TYPE},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;

use crate::{
    application::{
        error::HttpError,
        repos::{ConfigsRepo, SubscriptionsRepo},
    },
    cache::{ProviderService, ProviderStatus},
    domain::entities::{ConfigId, Configuration},
};

use super::{
    middleware::{log_responses, set_request_context},
    repo_error_to_http,
};

const PROVIDER_CONTENT_TYPE: &str = "text/yaml; charset=utf-8";

#[derive(Clone)]
pub struct HttpState {
    pub configs: Arc<dyn ConfigsRepo>,
    pub subscriptions: Arc<dyn SubscriptionsRepo>,
    pub providers: Arc<ProviderService>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/providers/{config_id}", get(provider_document))
        .route("/providers/{config_id}/status", get(provider_status))
        .route("/_health/cache", get(cache_health))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn provider_document(
    State(state): State<HttpState>,
    Path(config_id): Path<i64>,
) -> Result<Response, HttpError> {
    const SOURCE: &str = "infra::http::provider_document";

    let config = resolve_config(&state, SOURCE, ConfigId(config_id)).await?;
    let document = state
        .providers
        .get_or_refresh(&config, state.subscriptions.as_ref())
        .await?;

    Ok(([(CONTENT_TYPE, PROVIDER_CONTENT_TYPE)], document).into_response())
}

async fn provider_status(
    State(state): State<HttpState>,
    Path(config_id): Path<i64>,
) -> Result<Json<ProviderStatus>, HttpError> {
    const SOURCE: &str = "infra::http::provider_status";

    let config = resolve_config(&state, SOURCE, ConfigId(config_id)).await?;
    Ok(Json(state.providers.status(config.id)))
}

#[derive(Serialize)]
struct CacheHealth {
    entries: usize,
    providers: BTreeMap<ConfigId, ProviderStatus>,
}

async fn cache_health(State(state): State<HttpState>) -> Json<CacheHealth> {
    let providers = state.providers.snapshot();
    Json(CacheHealth {
        entries: providers.len(),
        providers,
    })
}

async fn resolve_config(
    state: &HttpState,
    source: &'static str,
    id: ConfigId,
) -> Result<Configuration, HttpError> {
    state
        .configs
        .find_config(id)
        .await
        .map_err(|err| repo_error_to_http(source, err))?
        .ok_or_else(|| {
            HttpError::new(
                source,
                StatusCode::NOT_FOUND,
                "Configuration not found",
                format!("configuration {id} does not exist"),
            )
        })
}
