//! Prometheus metrics for the delivery service.
//!
//! Delivery gauges and counters are labelled by downstream name and updated
//! by the [`MetricsSampler`] task once per sampling interval, never from the
//! send path itself.
//!
//! ```no_run
//! use kitsvc_delivery::metrics;
//!
//! metrics::init_metrics().unwrap();
//! println!("{}", metrics::gather_metrics());
//! ```

mod middleware;
mod sampler;

pub use middleware::track_metrics;
pub use sampler::{MetricsSampler, SharedRates};

use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};

const NAMESPACE: &str = "kitsvc";

lazy_static! {
    /// Global Prometheus registry for all metrics
    pub static ref PROMETHEUS_REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    /// Items waiting in the local queue
    ///
    /// Labels: downstream
    pub static ref DELIVERY_UNSENT: GaugeVec = GaugeVec::new(
        Opts::new("delivery_unsent", "Items waiting in the local queue")
            .namespace(NAMESPACE),
        &["downstream"]
    ).expect("Failed to create DELIVERY_UNSENT metric");

    /// 1 while the downstream is reachable
    ///
    /// Labels: downstream
    pub static ref DELIVERY_ONLINE: GaugeVec = GaugeVec::new(
        Opts::new("delivery_online", "Whether the downstream is reachable")
            .namespace(NAMESPACE),
        &["downstream"]
    ).expect("Failed to create DELIVERY_ONLINE metric");

    /// Labels: downstream
    pub static ref DELIVERY_SENT_PER_SECOND: GaugeVec = GaugeVec::new(
        Opts::new("delivery_sent_per_second", "Items sent per second over the last sample")
            .namespace(NAMESPACE),
        &["downstream"]
    ).expect("Failed to create DELIVERY_SENT_PER_SECOND metric");

    /// Labels: downstream
    pub static ref DELIVERY_RECEIVED_PER_SECOND: GaugeVec = GaugeVec::new(
        Opts::new("delivery_received_per_second", "Items received per second over the last sample")
            .namespace(NAMESPACE),
        &["downstream"]
    ).expect("Failed to create DELIVERY_RECEIVED_PER_SECOND metric");

    /// Items sent or queued for sending
    ///
    /// Labels: downstream
    pub static ref DELIVERY_SENT_TOTAL: CounterVec = CounterVec::new(
        Opts::new("delivery_sent_total", "Items sent or queued for sending")
            .namespace(NAMESPACE),
        &["downstream"]
    ).expect("Failed to create DELIVERY_SENT_TOTAL metric");

    /// Events received from the downstream and handed to a handler
    ///
    /// Labels: downstream
    pub static ref DELIVERY_RECEIVED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("delivery_received_total", "Items received and handed to a handler")
            .namespace(NAMESPACE),
        &["downstream"]
    ).expect("Failed to create DELIVERY_RECEIVED_TOTAL metric");

    /// Items given up on
    ///
    /// Labels: downstream
    pub static ref DELIVERY_DROPPED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("delivery_dropped_total", "Items dropped after a permanent failure")
            .namespace(NAMESPACE),
        &["downstream"]
    ).expect("Failed to create DELIVERY_DROPPED_TOTAL metric");

    /// 1 once every captured stream was replayed
    pub static ref REPLAY_COMPLETE: Gauge = Gauge::with_opts(
        Opts::new("replay_complete", "Whether the initial event replay finished")
            .namespace(NAMESPACE)
    ).expect("Failed to create REPLAY_COMPLETE metric");

    // ============================================================================
    // HTTP Metrics
    // ============================================================================

    /// Labels: method, path, status_code
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("http_requests_total", "Total number of HTTP requests")
            .namespace(NAMESPACE),
        &["method", "path", "status_code"]
    ).expect("Failed to create HTTP_REQUESTS_TOTAL metric");

    /// Labels: method, path
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request duration in seconds"
        )
        .namespace(NAMESPACE)
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["method", "path"]
    ).expect("Failed to create HTTP_REQUEST_DURATION_SECONDS metric");

    // ============================================================================
    // System Metrics
    // ============================================================================

    /// Labels: version
    pub static ref BUILD_INFO: GaugeVec = GaugeVec::new(
        Opts::new("build_info", "Application build information")
            .namespace(NAMESPACE),
        &["version"]
    ).expect("Failed to create BUILD_INFO metric");

    pub static ref UPTIME_SECONDS: Gauge = Gauge::with_opts(
        Opts::new("uptime_seconds", "Application uptime in seconds")
            .namespace(NAMESPACE)
    ).expect("Failed to create UPTIME_SECONDS metric");
}

fn register<C: Collector + 'static>(collector: C) -> Result<(), prometheus::Error> {
    match PROMETHEUS_REGISTRY.register(Box::new(collector)) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Register all metrics with [`PROMETHEUS_REGISTRY`].
///
/// Calling it again is a no-op.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    register(DELIVERY_UNSENT.clone())?;
    register(DELIVERY_ONLINE.clone())?;
    register(DELIVERY_SENT_PER_SECOND.clone())?;
    register(DELIVERY_RECEIVED_PER_SECOND.clone())?;
    register(DELIVERY_SENT_TOTAL.clone())?;
    register(DELIVERY_RECEIVED_TOTAL.clone())?;
    register(DELIVERY_DROPPED_TOTAL.clone())?;
    register(REPLAY_COMPLETE.clone())?;

    register(HTTP_REQUESTS_TOTAL.clone())?;
    register(HTTP_REQUEST_DURATION_SECONDS.clone())?;

    register(BUILD_INFO.clone())?;
    register(UPTIME_SECONDS.clone())?;

    BUILD_INFO
        .with_label_values(&[env!("CARGO_PKG_VERSION")])
        .set(1.0);

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Prometheus text exposition of every registered metric
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = PROMETHEUS_REGISTRY.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Failed to convert metrics to string: {}", e);
        String::from("# Error converting metrics\n")
    })
}
