//! Prometheus metrics for the pipeline, labeled by partition, served as
//! OpenMetrics text on `GET /metrics`.

use std::iter;
use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::Router;
use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tracing::{debug, error, info};

use crate::error::Error;

const PARTITION_LABEL: &str = "partition";
const GROUP_LABEL: &str = "group";

// The top-level metric registry is created with this prefix.
const REGISTRY_PREFIX: &str = "weir";

// counters (the prometheus client library appends the _total suffix)
const READ: &str = "read";
const DEAD_LETTER: &str = "dead_letter";
const LATE_DROPPED: &str = "late_dropped";
const WINDOWS_EMITTED: &str = "windows_emitted";
const COMMIT: &str = "commit";
const FENCED: &str = "fenced";

// histograms
const RAW_WRITE_TIME: &str = "raw_write_time";
const SINK_WRITE_TIME: &str = "sink_write_time";

// gauges
const FETCH_BATCH_SIZE: &str = "fetch_batch_size";

/// All pipeline metric families. Labels are `(group, partition)`.
pub(crate) struct PipelineMetrics {
    pub(crate) read_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) dead_letter_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) late_dropped_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) windows_emitted_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) commit_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) fenced_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) raw_write_time: Family<Vec<(String, String)>, Histogram>,
    pub(crate) sink_write_time: Family<Vec<(String, String)>, Histogram>,
    pub(crate) fetch_batch_size: Family<Vec<(String, String)>, Gauge>,
}

/// Exponential bucket distribution with range, in seconds.
fn exponential_buckets_range(min: f64, max: f64, length: u16) -> impl Iterator<Item = f64> {
    let growth_factor = (max / min).powf(1.0 / (f64::from(length) - 1.0));
    iter::repeat(())
        .enumerate()
        .map(move |(i, _)| min * growth_factor.powf(i as f64))
        .take(length.into())
}

fn write_time_histogram() -> Histogram {
    Histogram::new(exponential_buckets_range(0.001, 60.0, 12))
}

impl PipelineMetrics {
    fn new() -> Self {
        let metrics = Self {
            read_total: Family::<Vec<(String, String)>, Counter>::default(),
            dead_letter_total: Family::<Vec<(String, String)>, Counter>::default(),
            late_dropped_total: Family::<Vec<(String, String)>, Counter>::default(),
            windows_emitted_total: Family::<Vec<(String, String)>, Counter>::default(),
            commit_total: Family::<Vec<(String, String)>, Counter>::default(),
            fenced_total: Family::<Vec<(String, String)>, Counter>::default(),
            raw_write_time: Family::<Vec<(String, String)>, Histogram>::new_with_constructor(
                write_time_histogram,
            ),
            sink_write_time: Family::<Vec<(String, String)>, Histogram>::new_with_constructor(
                write_time_histogram,
            ),
            fetch_batch_size: Family::<Vec<(String, String)>, Gauge>::default(),
        };

        let mut registry = global_registry().lock();
        let registry = registry.sub_registry_with_prefix(REGISTRY_PREFIX);
        registry.register(
            READ,
            "Total events fetched from the partition log",
            metrics.read_total.clone(),
        );
        registry.register(
            DEAD_LETTER,
            "Total malformed events routed to the dead-letter channel",
            metrics.dead_letter_total.clone(),
        );
        registry.register(
            LATE_DROPPED,
            "Total events dropped because their window had passed its grace period",
            metrics.late_dropped_total.clone(),
        );
        registry.register(
            WINDOWS_EMITTED,
            "Total aggregate records emitted by the window engine",
            metrics.windows_emitted_total.clone(),
        );
        registry.register(
            COMMIT,
            "Total successful offset commits",
            metrics.commit_total.clone(),
        );
        registry.register(
            FENCED,
            "Total commits rejected due to a stale generation",
            metrics.fenced_total.clone(),
        );
        registry.register(
            RAW_WRITE_TIME,
            "Raw batch object write latency in seconds",
            metrics.raw_write_time.clone(),
        );
        registry.register(
            SINK_WRITE_TIME,
            "Dual sink write latency in seconds",
            metrics.sink_write_time.clone(),
        );
        registry.register(
            FETCH_BATCH_SIZE,
            "Current backpressure-controlled fetch batch size",
            metrics.fetch_batch_size.clone(),
        );
        metrics
    }
}

fn global_registry() -> &'static parking_lot::Mutex<Registry> {
    static GLOBAL_REGISTRY: OnceLock<parking_lot::Mutex<Registry>> = OnceLock::new();
    GLOBAL_REGISTRY.get_or_init(|| parking_lot::Mutex::new(Registry::default()))
}

pub(crate) fn pipeline_metrics() -> &'static PipelineMetrics {
    static PIPELINE_METRICS: OnceLock<PipelineMetrics> = OnceLock::new();
    PIPELINE_METRICS.get_or_init(PipelineMetrics::new)
}

pub(crate) fn partition_labels(group: &str, partition: u16) -> Vec<(String, String)> {
    vec![
        (GROUP_LABEL.to_string(), group.to_string()),
        (PARTITION_LABEL.to_string(), partition.to_string()),
    ]
}

// metrics_handler generates and returns a snapshot of the current state of the
// metrics in the global registry
async fn metrics_handler() -> impl IntoResponse {
    let registry = global_registry().lock();
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &registry) {
        error!(?e, "Failed to encode metrics");
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .expect("empty response is valid");
    }
    debug!("Exposing metrics: {:?}", buffer);
    Response::builder()
        .status(StatusCode::OK)
        .header(
            axum::http::header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )
        .body(Body::from(buffer))
        .expect("metrics response is valid")
}

/// Serves `GET /metrics` on the given port until the process exits.
pub(crate) async fn start_metrics_http_server(port: u16) -> crate::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .map_err(|e| Error::Metrics(format!("Invalid metrics address: {e}")))?;
    let app = Router::new().route("/metrics", get(metrics_handler));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics listener on {addr}: {e}")))?;
    info!(%addr, "Serving metrics");
    axum::serve(listener, app)
        .await
        .map_err(|e| Error::Metrics(format!("Starting web server for metrics: {e}")))
}
