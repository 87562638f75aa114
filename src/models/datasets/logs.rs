use alloy_primitives::{Address, B256, Bytes};
use alloy_rpc_types_eth::Log;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

////////////////////////////////////// RPC Data ////////////////////////////////////////
/// A log as returned by `eth_getLogs`, identity = (tx_hash, log_index).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub removed: bool,
}

impl RawLog {
    pub fn topic0(&self) -> Option<&B256> {
        self.topics.first()
    }
}

impl TryFrom<Log> for RawLog {
    type Error = anyhow::Error;

    // Pending logs have no position in the chain and cannot be keyed.
    fn try_from(log: Log) -> Result<Self, Self::Error> {
        let block_number = log
            .block_number
            .ok_or_else(|| anyhow::anyhow!("Missing block_number on log"))?;
        let tx_hash = log
            .transaction_hash
            .ok_or_else(|| anyhow::anyhow!("Missing tx_hash on log at block {}", block_number))?;
        let log_index = log
            .log_index
            .ok_or_else(|| anyhow::anyhow!("Missing log_index on log in tx {}", tx_hash))?;

        Ok(RawLog {
            address: log.inner.address,
            topics: log.inner.data.topics().to_vec(),
            data: log.inner.data.data.clone(),
            block_number,
            tx_hash,
            log_index,
            removed: log.removed,
        })
    }
}

// Subset of an `eth_getTransactionReceipt` response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceiptData {
    pub transaction_hash: B256,
    pub from: Address,
}

/////////////////////////////////// Transformed Data ///////////////////////////////////
/// A decoded log mapped onto the fixed column schema of its destination table.
/// `None` is the absence marker; every declared column is always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedRow {
    #[serde(skip)]
    pub table: String,
    #[serde(skip)]
    pub event_name: String,
    #[serde(skip)]
    pub block_number: u64,
    #[serde(skip)]
    pub tx_hash: B256,
    #[serde(skip)]
    pub log_index: u64,
    #[serde(flatten)]
    pub columns: IndexMap<String, Option<String>>,
}

impl DecodedRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns.get(column).and_then(|v| v.as_deref())
    }

    /// Set a column only if the table declares it.
    pub fn fill(&mut self, column: &str, value: Option<String>) {
        if let Some(slot) = self.columns.get_mut(column) {
            *slot = value;
        }
    }

    /// Joined values of the key columns. Absent columns contribute an empty segment.
    pub fn dedup_key(&self, key_columns: &[String]) -> String {
        key_columns
            .iter()
            .map(|c| self.get(c).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(":")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> DecodedRow {
        let mut columns = IndexMap::new();
        columns.insert("block_number".to_string(), Some("7".to_string()));
        columns.insert("tx_hash".to_string(), Some("0xab".to_string()));
        columns.insert("log_index".to_string(), Some("3".to_string()));
        columns.insert("value".to_string(), None);
        DecodedRow {
            table: "erc20_events".to_string(),
            event_name: "Transfer".to_string(),
            block_number: 7,
            tx_hash: B256::ZERO,
            log_index: 3,
            columns,
        }
    }

    #[test]
    fn serializes_absent_columns_as_null() {
        let json = serde_json::to_value(row()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "block_number": "7",
                "tx_hash": "0xab",
                "log_index": "3",
                "value": null
            })
        );
    }

    #[test]
    fn fill_ignores_undeclared_columns() {
        let mut row = row();
        row.fill("value", Some("1".to_string()));
        row.fill("token_symbol", Some("USDC".to_string()));
        assert_eq!(row.get("value"), Some("1"));
        assert!(!row.columns.contains_key("token_symbol"));
    }

    #[test]
    fn dedup_key_joins_key_columns() {
        let keys = vec![
            "block_number".to_string(),
            "tx_hash".to_string(),
            "log_index".to_string(),
        ];
        assert_eq!(row().dedup_key(&keys), "7:0xab:3");
    }
}
