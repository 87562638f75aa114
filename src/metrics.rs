use std::sync::Arc;
use tracing::{error, info};

use anyhow::{Context, Result};
use axum::{Router, http::StatusCode, routing::get};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, MeterProvider};
use opentelemetry_sdk::metrics::{MetricError, SdkMeterProvider};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;

pub struct Metrics {
    registry: Arc<prometheus::Registry>,
    _provider: SdkMeterProvider,
    pub chain_name: String,

    // Window processing metrics
    pub windows_processed: Counter<u64>,
    pub latest_processed_block: Gauge<u64>,
    pub window_processing_time: Gauge<f64>,

    // Chain metrics
    pub chain_tip_block: Gauge<u64>,
    pub chain_tip_lag: Gauge<u64>,

    // Pipeline metrics
    pub logs_fetched: Counter<u64>,
    pub rows_emitted: Counter<u64>,
    pub range_splits: Counter<u64>,
    pub reorgs: Counter<u64>,
    pub dead_letters: Counter<u64>,

    // RPC metrics
    pub rpc_requests: Counter<u64>,
    pub rpc_errors: Counter<u64>,
    pub rpc_latency: Histogram<f64>,
}

impl Metrics {
    pub fn new(chain_name: String) -> Result<Self, MetricError> {
        // Create a new prometheus registry
        let registry = prometheus::Registry::new();

        // Configure OpenTelemetry to use this registry
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        let meter = provider.meter("log_indexer_metrics");

        let windows_processed = meter
            .u64_counter("indexer_windows_processed")
            .with_description("Total number of block windows completed")
            .build();

        let latest_processed_block = meter
            .u64_gauge("indexer_latest_processed_block_number")
            .with_description("Last block covered by a completed window")
            .build();

        let window_processing_time = meter
            .f64_gauge("indexer_window_processing")
            .with_description("Time spent processing the latest window")
            .with_unit("s")
            .build();

        let chain_tip_block = meter
            .u64_gauge("indexer_chain_tip_block_number")
            .with_description("Latest block number on chain")
            .build();

        let chain_tip_lag = meter
            .u64_gauge("indexer_chain_tip_lag")
            .with_description("Number of blocks behind chain tip")
            .build();

        let logs_fetched = meter
            .u64_counter("indexer_logs_fetched")
            .with_description("Raw logs returned by eth_getLogs")
            .build();

        let rows_emitted = meter
            .u64_counter("indexer_rows_emitted")
            .with_description("Decoded rows handed to the sink")
            .build();

        let range_splits = meter
            .u64_counter("indexer_range_splits")
            .with_description("Ranges or header batches bisected after an oversized response")
            .build();

        let reorgs = meter
            .u64_counter("indexer_reorgs")
            .with_description("Chain reorganizations detected")
            .build();

        let dead_letters = meter
            .u64_counter("indexer_dead_letters")
            .with_description("Units of work written to the dead-letter file")
            .build();

        let rpc_requests = meter
            .u64_counter("indexer_rpc_requests")
            .with_description("Number of RPC requests made")
            .build();

        let rpc_errors = meter
            .u64_counter("indexer_rpc_errors")
            .with_description("Number of RPC errors encountered")
            .build();

        let rpc_latency = meter
            .f64_histogram("indexer_rpc_latency")
            .with_description("RPC request latency")
            .with_boundaries(vec![
                0.025, 0.05, 0.075, 0.1, 0.15, 0.2, 0.3, 0.5, 1.0, 5.0, 10.0,
            ])
            .with_unit("s")
            .build();

        Ok(Self {
            registry: Arc::new(registry),
            _provider: provider,
            chain_name,
            windows_processed,
            latest_processed_block,
            window_processing_time,
            chain_tip_block,
            chain_tip_lag,
            logs_fetched,
            rows_emitted,
            range_splits,
            reorgs,
            dead_letters,
            rpc_requests,
            rpc_errors,
            rpc_latency,
        })
    }

    pub fn chain_label(&self) -> KeyValue {
        KeyValue::new("chain", self.chain_name.clone())
    }

    /// Labels for RPC instruments
    pub fn rpc_labels(&self, method: &'static str) -> [KeyValue; 2] {
        [self.chain_label(), KeyValue::new("method", method)]
    }

    pub fn record_rpc(&self, method: &'static str, elapsed_secs: f64, failed: bool) {
        let labels = self.rpc_labels(method);
        self.rpc_requests.add(1, &labels);
        self.rpc_latency.record(elapsed_secs, &labels);
        if failed {
            self.rpc_errors.add(1, &labels);
        }
    }

    pub async fn start_metrics_server(&self, addr: &str, port: u16) -> Result<()> {
        let addr = format!("{addr}:{port}")
            .parse::<SocketAddr>()
            .context("invalid metrics bind address")?;
        let registry = self.registry.clone();

        let app = Router::new().route("/metrics", get(move || metrics_handler(registry.clone())));

        // Determine the access URL based on the binding address. Only used for logging.
        let access_url = if addr.ip().is_unspecified() {
            format!("http://localhost:{port}/metrics")
        } else {
            format!("http://{}:{port}/metrics", addr.ip())
        };

        info!(
            "Starting metrics server - binding to {} (accessible at {})",
            addr, access_url
        );

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind metrics listener")?;

        // Spawn the server in a separate task
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Metrics server stopped: {}", e);
            }
        });

        Ok(())
    }

}

fn encode_registry(registry: &prometheus::Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

async fn metrics_handler(registry: Arc<prometheus::Registry>) -> Result<String, StatusCode> {
    encode_registry(&registry).map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
