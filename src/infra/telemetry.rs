use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "subrelay_refresh_total",
            Unit::Count,
            "Provider refresh attempts by origin and outcome."
        );
        describe_counter!(
            "subrelay_subscription_lookup_total",
            Unit::Count,
            "Subscription lookups by source (memo or catalog)."
        );
        describe_counter!(
            "subrelay_reload_total",
            Unit::Count,
            "Configuration reload cycles by outcome."
        );
        describe_gauge!(
            "subrelay_cache_entries",
            Unit::Count,
            "Number of materialized provider documents."
        );
        describe_gauge!(
            "subrelay_refresh_inflight",
            Unit::Count,
            "Refresh workers currently running."
        );
        describe_histogram!(
            "subrelay_refresh_ms",
            Unit::Milliseconds,
            "Provider refresh latency in milliseconds."
        );
    });
}
