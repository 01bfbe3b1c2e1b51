//! Tracing installation and metric descriptions for embedding binaries.

use std::sync::Once;

use metrics::{Unit, describe_counter};
use serde::Deserialize;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter,
    filter::LevelFilter,
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::error::CacheError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Json,
}

/// Logging configuration for [`init`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level (`trace` through `error`, or `off`), overridable via
    /// `RUST_LOG`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Install a global tracing subscriber using the provided logging settings.
///
/// Intended for binaries embedding the engine; libraries and tests that
/// already installed a subscriber get a configuration error.
pub fn init(logging: &LoggingSettings) -> Result<(), CacheError> {
    describe_metrics();

    // Parsed as a level, not a directive: a bare directive would accept any
    // word as a target name and never fail.
    let level: LevelFilter = logging.level.parse().map_err(|err| {
        CacheError::configuration(format!("invalid log level {:?}: {err}", logging.level))
    })?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
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
            CacheError::configuration(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register metric descriptions once per process.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "scorta_cache_disk_hit_total",
            Unit::Count,
            "Fresh entries served from the disk tier."
        );
        describe_counter!(
            "scorta_cache_disk_miss_total",
            Unit::Count,
            "Lookups that found no fresh disk entry."
        );
        describe_counter!(
            "scorta_cache_memory_hit_total",
            Unit::Count,
            "Fresh entries served from the memory tier."
        );
        describe_counter!(
            "scorta_cache_write_total",
            Unit::Count,
            "Entries persisted to disk."
        );
        describe_counter!(
            "scorta_cache_not_found_dedup_total",
            Unit::Count,
            "404 entries de-duplicated against the canonical blob."
        );
        describe_counter!(
            "scorta_cache_invalidated_total",
            Unit::Count,
            "Entries removed by bulk invalidation."
        );
    });
}
