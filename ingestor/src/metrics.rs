use crate::errors::Result;
use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref REQUESTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_requests_total",
        "Total ingestion requests received over HTTP"
    ))
    .unwrap();
    pub static ref INVALID_REQUESTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_invalid_requests_total",
        "Total ingestion requests rejected by validation"
    ))
    .unwrap();
    pub static ref IMPLAUSIBLE_VALUES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_implausible_values_total",
        "Total accepted values outside their physical range"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_failures_total",
        "Total database insert failures"
    ))
    .unwrap();
    pub static ref PERSIST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_persist_latency_seconds",
            "Time taken to persist one telemetry record"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref PUBLISHED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_published_total",
        "Total records published to device groups"
    ))
    .unwrap();
    pub static ref BROKER_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_broker_failures_total",
        "Total persisted records that could not be published"
    ))
    .unwrap();
    pub static ref SUBSCRIBER_DROPS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_subscriber_drops_total",
        "Total messages dropped because a subscriber queue was full"
    ))
    .unwrap();
    pub static ref ACTIVE_SUBSCRIBERS: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_active_subscribers",
        "Number of open WebSocket subscriptions"
    ))
    .unwrap();
}

pub fn init_metrics() -> Result<()> {
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVALID_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(IMPLAUSIBLE_VALUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PERSIST_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(PUBLISHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BROKER_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SUBSCRIBER_DROPS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_SUBSCRIBERS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
