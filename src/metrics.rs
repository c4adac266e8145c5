//! Metrics collection and optional Prometheus exporter.
//!
//! Every error kind from the taxonomy maps to a monotonic counter here;
//! cycle timing lands in a histogram. The Prometheus HTTP endpoint is
//! compiled in behind the `prometheus_exporter` feature.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};
#[cfg(feature = "prometheus_exporter")]
use tracing::info;

#[cfg(feature = "prometheus_exporter")]
use prometheus::{Counter, Encoder, Gauge, Registry, TextEncoder};

#[cfg(feature = "prometheus_exporter")]
use hyper::service::{make_service_fn, service_fn};
#[cfg(feature = "prometheus_exporter")]
use hyper::{Body, Method, Request, Response, Result as HyperResult, Server, StatusCode};

/// Counters registered up front so scrapes see zeros rather than gaps.
#[cfg(feature = "prometheus_exporter")]
const STANDARD_COUNTERS: &[(&str, &str)] = &[
    ("items_collected_total", "Items returned by collectors"),
    ("items_deduplicated_total", "Items dropped as duplicates"),
    ("items_scored_total", "Items scored by the ensemble"),
    ("items_dropped_unscored_total", "Items dropped unscored at the cycle deadline"),
    ("scorer_degraded_total", "Items scored with the primary model unavailable"),
    ("samples_aggregated_total", "Per-asset samples emitted by the aggregator"),
    ("aggregate_empty_total", "Assets that produced no sample"),
    ("manipulation_veto_total", "Samples suppressed by the manipulation gate"),
    ("submit_skipped_min_interval_total", "Samples skipped by the local update-interval check"),
    ("submit_skipped_circuit_breaker_total", "Samples skipped by the local circuit-breaker check"),
    ("tx_submitted_total", "Transactions broadcast"),
    ("tx_confirmed_total", "Transactions confirmed at depth N"),
    ("tx_reverted_total", "Transactions reverted on-chain"),
    ("tx_replaced_total", "Dropped transactions replaced at the same nonce"),
    ("nonce_gap_total", "Nonce desynchronizations detected"),
    ("nonce_resync_total", "Nonce resynchronizations from the chain"),
    ("rpc_unavailable_total", "Chain RPC transport failures"),
    ("signer_unavailable_total", "Signer failures (cycle fatal)"),
    ("source_error_transient_total", "Transient collector failures"),
    ("source_error_terminal_total", "Terminal collector failures"),
    ("config_invalid_total", "Configuration validation failures"),
    ("cycle_timeout_total", "Cycles that missed their submission deadline"),
    ("cycles_total", "Cycles started"),
];

/// Pipeline metrics collector.
pub struct MetricsCollector {
    metrics: Arc<RwLock<InternalMetrics>>,

    #[cfg(feature = "prometheus_exporter")]
    prometheus_registry: Registry,
    #[cfg(feature = "prometheus_exporter")]
    prometheus_counters: HashMap<String, Counter>,
    #[cfg(feature = "prometheus_exporter")]
    prometheus_gauges: HashMap<String, Gauge>,
}

#[derive(Debug, Default)]
struct InternalMetrics {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, Vec<f64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        #[cfg(feature = "prometheus_exporter")]
        {
            let registry = Registry::new();
            let mut counters = HashMap::new();
            for (name, help) in STANDARD_COUNTERS {
                let counter = Counter::with_opts(prometheus::opts!(*name, *help))
                    .expect("static counter opts");
                registry.register(Box::new(counter.clone())).expect("static counter registration");
                counters.insert((*name).to_string(), counter);
            }
            Self {
                metrics: Arc::new(RwLock::new(InternalMetrics::default())),
                prometheus_registry: registry,
                prometheus_counters: counters,
                prometheus_gauges: HashMap::new(),
            }
        }

        #[cfg(not(feature = "prometheus_exporter"))]
        {
            Self { metrics: Arc::new(RwLock::new(InternalMetrics::default())) }
        }
    }

    pub async fn increment(&self, name: &str) {
        self.add(name, 1).await;
    }

    pub async fn add(&self, name: &str, by: u64) {
        let mut metrics = self.metrics.write().await;
        *metrics.counters.entry(name.to_string()).or_insert(0) += by;

        #[cfg(feature = "prometheus_exporter")]
        if let Some(counter) = self.prometheus_counters.get(name) {
            counter.inc_by(by as f64);
        }

        debug!(metric = name, by, "counter incremented");
    }

    pub async fn set_gauge(&self, name: &str, value: f64) {
        let mut metrics = self.metrics.write().await;
        metrics.gauges.insert(name.to_string(), value);

        #[cfg(feature = "prometheus_exporter")]
        if let Some(gauge) = self.prometheus_gauges.get(name) {
            gauge.set(value);
        }
    }

    pub async fn record_histogram(&self, name: &str, value: f64) {
        let mut metrics = self.metrics.write().await;
        metrics.histograms.entry(name.to_string()).or_default().push(value);
    }

    pub async fn record_cycle_duration(&self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        self.record_histogram("cycle_duration_seconds", seconds).await;
        self.set_gauge("last_cycle_duration_seconds", seconds).await;
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let metrics = self.metrics.read().await;
        MetricsSnapshot {
            counters: metrics.counters.clone(),
            gauges: metrics.gauges.clone(),
            histograms: metrics.histograms.clone(),
            taken_at: Instant::now(),
        }
    }

    pub async fn counter(&self, name: &str) -> u64 {
        self.metrics.read().await.counters.get(name).copied().unwrap_or(0)
    }

    #[cfg(feature = "prometheus_exporter")]
    pub fn render_prometheus(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.prometheus_registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Start the Prometheus HTTP endpoint. No-op without the feature.
    #[cfg(feature = "prometheus_exporter")]
    pub async fn serve(&self, addr: &str) -> anyhow::Result<()> {
        use std::convert::Infallible;
        use std::net::SocketAddr;

        let registry = self.prometheus_registry.clone();
        let make_svc = make_service_fn(move |_conn| {
            let registry = registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let registry = registry.clone();
                    async move { serve_metrics(req, registry).await }
                }))
            }
        });

        let addr: SocketAddr = addr.parse()?;
        info!("starting metrics endpoint on {}", addr);
        let server = Server::bind(&addr).serve(make_svc);
        if let Err(e) = server.await {
            warn!("metrics endpoint error: {}", e);
        }
        Ok(())
    }

    #[cfg(not(feature = "prometheus_exporter"))]
    pub async fn serve(&self, _addr: &str) -> anyhow::Result<()> {
        warn!("prometheus_exporter feature not enabled; metrics endpoint unavailable");
        Ok(())
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, Vec<f64>>,
    pub taken_at: Instant,
}

#[cfg(feature = "prometheus_exporter")]
async fn serve_metrics(req: Request<Body>, registry: Registry) -> HyperResult<Response<Body>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = Vec::new();
            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                warn!("failed to encode metrics: {}", e);
                return Ok(Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from("encode failure"))?);
            }
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain; version=0.0.4")
                .body(Body::from(buffer))?)
        }
        (&Method::GET, "/health") => {
            Ok(Response::builder().status(StatusCode::OK).body(Body::from("OK"))?)
        }
        _ => Ok(Response::builder().status(StatusCode::NOT_FOUND).body(Body::from("Not Found"))?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_accumulate() {
        let metrics = MetricsCollector::new();
        metrics.increment("tx_submitted_total").await;
        metrics.add("tx_submitted_total", 2).await;
        assert_eq!(metrics.counter("tx_submitted_total").await, 3);
        assert_eq!(metrics.counter("tx_reverted_total").await, 0);
    }

    #[tokio::test]
    async fn gauges_overwrite() {
        let metrics = MetricsCollector::new();
        metrics.set_gauge("last_cycle_duration_seconds", 1.0).await;
        metrics.set_gauge("last_cycle_duration_seconds", 2.5).await;
        let snap = metrics.snapshot().await;
        assert_eq!(snap.gauges.get("last_cycle_duration_seconds"), Some(&2.5));
    }

    #[tokio::test]
    async fn cycle_duration_records_both() {
        let metrics = MetricsCollector::new();
        metrics.record_cycle_duration(Duration::from_millis(750)).await;
        let snap = metrics.snapshot().await;
        assert_eq!(snap.histograms.get("cycle_duration_seconds").map(Vec::len), Some(1));
        assert!((snap.gauges["last_cycle_duration_seconds"] - 0.75).abs() < 1e-9);
    }
}
