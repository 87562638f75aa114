use anyhow::{Result, anyhow};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::indexer::rpc::{ChainClient, FetchOutcome, fetch_with_retry};
use crate::metrics::Metrics;
use crate::models::datasets::blocks::BlockHeader;
use crate::utils::retry::RetryConfig;

/// Headers already resolved for the current window, keyed by block number.
pub type HeaderCache = BTreeMap<u64, BlockHeader>;

/// Resolves block headers for arbitrary sets of block numbers, batching
/// requests and halving a batch the upstream rejects as too large.
pub struct BlockEnricher<C: ChainClient + ?Sized> {
    client: Arc<C>,
    retry: RetryConfig,
    batch_size: usize,
    metrics: Option<Arc<Metrics>>,
}

impl<C: ChainClient + ?Sized> BlockEnricher<C> {
    pub fn new(
        client: Arc<C>,
        retry: RetryConfig,
        batch_size: usize,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            client,
            retry,
            batch_size: batch_size.max(1),
            metrics,
        }
    }

    /// Unknown blocks are left out of the returned map rather than failing.
    pub async fn resolve_headers<I>(&self, numbers: I) -> Result<HeaderCache>
    where
        I: IntoIterator<Item = u64>,
    {
        let unique: Vec<u64> = numbers.into_iter().collect::<BTreeSet<_>>().into_iter().collect();

        let mut resolved = HeaderCache::new();
        for chunk in unique.chunks(self.batch_size) {
            for header in self.fetch_batch(chunk).await? {
                resolved.insert(header.number, header);
            }
        }

        if resolved.len() < unique.len() {
            debug!(
                "{} of {} requested blocks were not found",
                unique.len() - resolved.len(),
                unique.len()
            );
        }
        Ok(resolved)
    }

    /// Like `resolve_headers`, but only asks the upstream for numbers not in `cache`.
    pub async fn resolve_with_cache<I>(&self, numbers: I, cache: &HeaderCache) -> Result<HeaderCache>
    where
        I: IntoIterator<Item = u64>,
    {
        let mut result = HeaderCache::new();
        let mut missing = Vec::new();
        for number in numbers {
            match cache.get(&number) {
                Some(header) => {
                    result.insert(number, header.clone());
                }
                None => missing.push(number),
            }
        }

        if !missing.is_empty() {
            result.extend(self.resolve_headers(missing).await?);
        }
        Ok(result)
    }

    async fn fetch_batch(&self, batch: &[u64]) -> Result<Vec<BlockHeader>> {
        let mut pending: Vec<&[u64]> = vec![batch];
        let mut headers = Vec::with_capacity(batch.len());

        while let Some(current) = pending.pop() {
            let context = format!(
                "eth_getBlockByNumber x{} [{}..]",
                current.len(),
                current.first().copied().unwrap_or_default()
            );
            let outcome = fetch_with_retry(
                || self.client.get_block_headers(current),
                &self.retry,
                &context,
            )
            .await;

            match outcome {
                FetchOutcome::Ok(found) => {
                    // Only keep what was asked for
                    headers.extend(found.into_iter().filter(|h| current.contains(&h.number)));
                }
                FetchOutcome::TooLarge if current.len() > 1 => {
                    let (left, right) = current.split_at(current.len() / 2);
                    warn!(
                        "Header batch of {} too large, splitting into {} and {}",
                        current.len(),
                        left.len(),
                        right.len()
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.range_splits.add(1, &[metrics.chain_label()]);
                    }
                    pending.push(right);
                    pending.push(left);
                }
                FetchOutcome::TooLarge => {
                    return Err(anyhow!("Header for block {:?} is too large to fetch", current));
                }
                FetchOutcome::Fatal(e) => return Err(e),
            }
        }

        Ok(headers)
    }
}
