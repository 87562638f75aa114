use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio::{signal, sync::broadcast};
use tracing::{error, info};
use tracing_subscriber::{self, EnvFilter};
use url::Url;

use evm_log_indexer::indexer::Pipeline;
use evm_log_indexer::indexer::rpc::AlloyChainClient;
use evm_log_indexer::metrics::Metrics;
use evm_log_indexer::models::abi::EventRegistry;
use evm_log_indexer::models::common::SinkKind;
use evm_log_indexer::storage::bigquery::BigQuerySink;
use evm_log_indexer::storage::{LogSink, RowSink};
use evm_log_indexer::utils::retry::RetryConfig;
use evm_log_indexer::utils::{config_path, load_config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    println!();
    info!("=========================== INITIALIZING ===========================");

    // Load config
    let config = match load_config(config_path()) {
        Ok(config) => {
            info!("Config loaded successfully");
            config
        }
        Err(e) => {
            error!("Failed to load config: {:#}", e);
            return Err(anyhow!(e));
        }
    };

    // Initialize optional metrics
    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new(config.chain_name.clone())?);
        metrics
            .start_metrics_server(&config.metrics.address, config.metrics.port)
            .await?;
        Some(metrics)
    } else {
        info!("Metrics are disabled");
        None
    };

    // Interface catalog
    let registry = Arc::new(EventRegistry::from_dir(&config.abi_dir)?);
    if registry.is_empty() {
        return Err(anyhow!("No events found in interface catalog {}", config.abi_dir));
    }

    // Create RPC client
    let rpc_url: Url = config.rpc_url.parse()?;
    info!("RPC URL: {}", rpc_url);
    let client = Arc::new(AlloyChainClient::new(
        rpc_url,
        config.rate_limit_per_second,
        Duration::from_secs(config.call_timeout_secs),
        metrics.clone(),
    ));

    let sink: Arc<dyn RowSink> = match config.sink.kind {
        SinkKind::Log => Arc::new(LogSink),
        SinkKind::BigQuery => {
            let dataset = config
                .sink
                .dataset
                .clone()
                .unwrap_or_else(|| config.chain_name.clone());
            Arc::new(BigQuerySink::connect(dataset, RetryConfig::from(&config.retry)).await?)
        }
    };

    // Ctrl+C stops the pipeline between windows
    let (stop_tx, stop_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if let Ok(()) = signal::ctrl_c().await {
            info!("Received Ctrl+C signal, finishing current window...");
            let _ = stop_tx.send(());
        }
    });

    let mut pipeline = Pipeline::new(config, client, registry, sink, metrics)?;

    println!();
    info!("========================= STARTING INDEXER =========================");

    match pipeline.run(stop_rx).await {
        Ok(summary) => {
            info!(
                "Run complete: {} windows, {} logs, {} rows, {} dead letters, {} reorgs, cursor {:?}",
                summary.windows_completed,
                summary.logs_fetched,
                summary.rows_emitted,
                summary.dead_letters,
                summary.reorgs_handled,
                summary.final_cursor
            );
            Ok(())
        }
        Err(e) => {
            error!("Indexer stopped: {:#}", e);
            Err(e)
        }
    }
}
