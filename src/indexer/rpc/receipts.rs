use alloy_primitives::{Address, B256};
use anyhow::{Result, anyhow};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::indexer::rpc::{ChainClient, FetchOutcome, fetch_with_retry};
use crate::models::datasets::logs::DecodedRow;
use crate::utils::retry::RetryConfig;

/// Looks up the sender of transactions through `eth_getTransactionReceipt`.
pub struct SenderResolver<C: ChainClient + ?Sized> {
    client: Arc<C>,
    retry: RetryConfig,
}

impl<C: ChainClient + ?Sized> SenderResolver<C> {
    pub fn new(client: Arc<C>, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    /// Transactions without a receipt are left out.
    pub async fn resolve_senders<I>(&self, tx_hashes: I) -> Result<HashMap<B256, Address>>
    where
        I: IntoIterator<Item = B256>,
    {
        let unique: BTreeSet<B256> = tx_hashes.into_iter().collect();
        let mut senders = HashMap::with_capacity(unique.len());

        for tx_hash in unique {
            let context = format!("eth_getTransactionReceipt {}", tx_hash);
            match fetch_with_retry(
                || self.client.get_transaction_receipt(tx_hash),
                &self.retry,
                &context,
            )
            .await
            {
                FetchOutcome::Ok(Some(receipt)) => {
                    senders.insert(tx_hash, receipt.from);
                }
                FetchOutcome::Ok(None) => debug!("No receipt for {}", tx_hash),
                FetchOutcome::TooLarge => {
                    return Err(anyhow!("Receipt for {} rejected as too large", tx_hash));
                }
                FetchOutcome::Fatal(e) => return Err(e),
            }
        }

        Ok(senders)
    }

    /// Fill `column` with the transaction's lowercased sender on every row whose
    /// table declares it. Rows without the column cost no lookups.
    pub async fn annotate(&self, rows: &mut [DecodedRow], column: &str) -> Result<()> {
        let wanted: Vec<B256> = rows
            .iter()
            .filter(|row| row.columns.contains_key(column))
            .map(|row| row.tx_hash)
            .collect();
        if wanted.is_empty() {
            return Ok(());
        }

        let senders = self.resolve_senders(wanted).await?;
        for row in rows.iter_mut() {
            let sender = senders.get(&row.tx_hash).map(|from| format!("{from:#x}"));
            row.fill(column, sender);
        }
        Ok(())
    }
}
