use std::sync::Once;

use metrics::{Unit, describe_counter};
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

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "tagport_cache_versions_hit_total",
            Unit::Count,
            "Version lists served from the TTL cache."
        );
        describe_counter!(
            "tagport_cache_versions_miss_total",
            Unit::Count,
            "Version list lookups that went upstream."
        );
        describe_counter!(
            "tagport_cache_archive_hit_total",
            Unit::Count,
            "Archives served from the archive store."
        );
        describe_counter!(
            "tagport_cache_archive_miss_total",
            Unit::Count,
            "Archive requests that went upstream."
        );
        describe_counter!(
            "tagport_cache_fault_total",
            Unit::Count,
            "Archive store failures absorbed by the cache."
        );
        describe_counter!(
            "tagport_cache_swept_total",
            Unit::Count,
            "Expired version lists removed by the sweeper."
        );
        describe_counter!(
            "tagport_upstream_requests_total",
            Unit::Count,
            "Requests sent to the GitHub API, by endpoint."
        );
    });
}
