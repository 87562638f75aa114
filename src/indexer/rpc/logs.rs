use alloy_primitives::{Address, B256};
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::indexer::rpc::{ChainClient, FetchOutcome, fetch_with_retry};
use crate::metrics::Metrics;
use crate::models::common::Window;
use crate::models::datasets::logs::RawLog;
use crate::models::errors::FetchError;
use crate::utils::retry::RetryConfig;

/// Adaptive `eth_getLogs` over arbitrary block ranges.
///
/// The range is cut into sub-windows of `batch_size` blocks. A sub-window the
/// upstream rejects as too large is bisected until every piece fits; a single
/// block that still does not fit fails the whole call.
pub struct RangeFetcher<C: ChainClient + ?Sized> {
    client: Arc<C>,
    retry: RetryConfig,
    batch_size: u64,
    metrics: Option<Arc<Metrics>>,
}

impl<C: ChainClient + ?Sized> RangeFetcher<C> {
    pub fn new(
        client: Arc<C>,
        retry: RetryConfig,
        batch_size: u64,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            client,
            retry,
            batch_size: batch_size.max(1),
            metrics,
        }
    }

    pub async fn fetch_logs(
        &self,
        address: Address,
        topic0: B256,
        window: Window,
    ) -> Result<Vec<RawLog>> {
        let mut logs = Vec::new();
        for sub_window in window.chunks(self.batch_size) {
            logs.extend(self.fetch_window(address, topic0, sub_window).await?);
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .logs_fetched
                .add(logs.len() as u64, &[metrics.chain_label()]);
        }
        Ok(logs)
    }

    // Depth-first over an explicit stack; the left half is always fetched first so
    // logs come back in block order.
    async fn fetch_window(
        &self,
        address: Address,
        topic0: B256,
        window: Window,
    ) -> Result<Vec<RawLog>> {
        let mut pending = vec![window];
        let mut logs = Vec::new();

        while let Some(current) = pending.pop() {
            let context = format!("eth_getLogs {} [{}]", address, current);
            let outcome = fetch_with_retry(
                || self.client.get_logs(address, topic0, current),
                &self.retry,
                &context,
            )
            .await;

            match outcome {
                FetchOutcome::Ok(batch) => {
                    debug!("Fetched {} logs for blocks {}", batch.len(), current);
                    logs.extend(batch);
                }
                FetchOutcome::TooLarge => match current.bisect() {
                    Some((left, right)) => {
                        warn!(
                            "Range {} too large for {}, splitting into {} and {}",
                            current, address, left, right
                        );
                        if let Some(metrics) = &self.metrics {
                            metrics.range_splits.add(1, &[metrics.chain_label()]);
                        }
                        pending.push(right);
                        pending.push(left);
                    }
                    None => {
                        return Err(FetchError::SingleBlockTooLarge {
                            block: current.from_block,
                        }
                        .into());
                    }
                },
                FetchOutcome::Fatal(e) => return Err(e),
            }
        }

        Ok(logs)
    }
}
