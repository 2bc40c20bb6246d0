use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::{Arc, OnceLock};
use tracing::info;

// Declare the static OnceLock to hold the Metrics.
static METRICS_INSTANCE: OnceLock<Arc<Metrics>> = OnceLock::new();

/// Initializes on first use and returns the process-wide `Metrics`.
pub fn get_metrics() -> &'static Arc<Metrics> {
    METRICS_INSTANCE.get_or_init(|| {
        info!("Initializing Metrics ...");
        Metrics::new()
    })
}

#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Auth metrics
    pub discovery_requests: IntCounterVec,
    pub token_requests: IntCounterVec,
    pub auth_retries: IntCounter,

    // FHIR metrics
    pub fhir_requests: IntCounterVec,
    pub fhir_request_duration: HistogramVec,
    pub reference_fetches: IntCounterVec,
    pub pages_fetched: IntCounter,

    // Config/runtime
    pub parse_failures: IntCounter,
    pub config_validation_errors: IntCounter,
}

impl Metrics {
    fn new() -> Arc<Self> {
        let registry = Registry::new_custom(Some("smartfhir".into()), None).expect("metrics registry");

        let metrics: Arc<Metrics> = Arc::new(Self {
            // Auth
            discovery_requests: IntCounterVec::new(Opts::new("discovery_requests_total", "Well-known configuration fetches by outcome"), &["outcome"]).expect("metric"),
            token_requests: IntCounterVec::new(Opts::new("token_requests_total", "Token endpoint calls by grant and outcome"), &["grant", "outcome"]).expect("metric"),
            auth_retries: IntCounter::new("auth_retries_total", "Requests retried after a 401").expect("metric"),

            // FHIR
            fhir_requests: IntCounterVec::new(Opts::new("fhir_requests_total", "FHIR calls by method and status"), &["method", "status"]).expect("metric"),
            fhir_request_duration: HistogramVec::new(HistogramOpts::new("fhir_request_duration_seconds", "FHIR call duration seconds").buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]), &["method"]).expect("metric"),
            reference_fetches: IntCounterVec::new(Opts::new("reference_fetches_total", "Reference fetches by outcome"), &["outcome"]).expect("metric"),
            pages_fetched: IntCounter::new("bundle_pages_fetched_total", "Bundle pages fetched by the paginator").expect("metric"),

            // Config/runtime
            parse_failures: IntCounter::new("config_parse_failures_total", "Config parse failures").expect("metric"),
            config_validation_errors: IntCounter::new("config_validation_errors_total", "Validation errors during startup").expect("metric"),

            registry,
        });

        // Register all metrics in the registry
        let reg = &metrics.registry;
        let _ = reg.register(Box::new(metrics.discovery_requests.clone()));
        let _ = reg.register(Box::new(metrics.token_requests.clone()));
        let _ = reg.register(Box::new(metrics.auth_retries.clone()));
        let _ = reg.register(Box::new(metrics.fhir_requests.clone()));
        let _ = reg.register(Box::new(metrics.fhir_request_duration.clone()));
        let _ = reg.register(Box::new(metrics.reference_fetches.clone()));
        let _ = reg.register(Box::new(metrics.pages_fetched.clone()));
        let _ = reg.register(Box::new(metrics.parse_failures.clone()));
        let _ = reg.register(Box::new(metrics.config_validation_errors.clone()));

        metrics
    }

    /// Prometheus text exposition of every registered metric
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
