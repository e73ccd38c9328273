//! Process-wide logging and metric descriptions.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing::debug;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

#[derive(Clone, Copy)]
enum Kind {
    Counter,
    Gauge,
    Histogram,
}

struct MetricDoc {
    name: &'static str,
    kind: Kind,
    unit: Unit,
    help: &'static str,
}

const fn doc(name: &'static str, kind: Kind, unit: Unit, help: &'static str) -> MetricDoc {
    MetricDoc {
        name,
        kind,
        unit,
        help,
    }
}

/// Every metric the pipeline emits, grouped by the stage that emits it.
const STAGES: &[(&str, &[MetricDoc])] = &[
    (
        "write",
        &[doc(
            "murmur_post_fanout_failed_total",
            Kind::Counter,
            Unit::Count,
            "Stored posts whose feed update could not be published.",
        )],
    ),
    (
        "consume",
        &[
            doc(
                "murmur_feed_updates_total",
                Kind::Counter,
                Unit::Count,
                "Feed-update deliveries settled, labelled by outcome.",
            ),
            doc(
                "murmur_feed_refresh_seconds",
                Kind::Histogram,
                Unit::Seconds,
                "Time to recompute every feed touched by one update.",
            ),
            doc(
                "murmur_feed_subscription_errors_total",
                Kind::Counter,
                Unit::Count,
                "Errors read from a worker's subscription before it backed off.",
            ),
        ],
    ),
    (
        "cache",
        &[
            doc(
                "murmur_feed_cache_hit_total",
                Kind::Counter,
                Unit::Count,
                "Feed reads answered from the cache.",
            ),
            doc(
                "murmur_feed_cache_miss_total",
                Kind::Counter,
                Unit::Count,
                "Feed reads that fell through to the store.",
            ),
            doc(
                "murmur_feed_cache_evict_total",
                Kind::Counter,
                Unit::Count,
                "Feeds pushed out of the cache by capacity.",
            ),
            doc(
                "murmur_feed_cache_entries",
                Kind::Gauge,
                Unit::Count,
                "Feeds currently cached.",
            ),
            doc(
                "murmur_feed_warm_skipped_total",
                Kind::Counter,
                Unit::Count,
                "Loaded feeds the warmer did not store, labelled by reason.",
            ),
        ],
    ),
    (
        "push",
        &[
            doc(
                "murmur_realtime_connections",
                Kind::Gauge,
                Unit::Count,
                "Live connections registered in the pool.",
            ),
            doc(
                "murmur_realtime_dropped_total",
                Kind::Counter,
                Unit::Count,
                "Envelopes dropped on a full outbound queue.",
            ),
        ],
    ),
];

static DESCRIBED: Once = Once::new();

/// Install the global subscriber and describe the pipeline's metrics.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    let filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(ErrorLayer::default())
        .with(output_layer(logging.format))
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("failed to install tracing subscriber: {err}")))?;

    DESCRIBED.call_once(describe_metrics);
    Ok(())
}

fn output_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    }
}

fn describe_metrics() {
    for (stage, metrics) in STAGES {
        for metric in *metrics {
            match metric.kind {
                Kind::Counter => describe_counter!(metric.name, metric.unit, metric.help),
                Kind::Gauge => describe_gauge!(metric.name, metric.unit, metric.help),
                Kind::Histogram => describe_histogram!(metric.name, metric.unit, metric.help),
            }
        }
        debug!(stage, metrics = metrics.len(), "Metrics described");
    }
}
