pub mod bigquery;
pub mod cursor;
pub mod dead_letter;

use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::models::common::Window;
use crate::models::datasets::blocks::BlockHeader;
use crate::models::datasets::logs::DecodedRow;

/// Columns that identify a decoded row across reruns.
pub const DEDUP_KEY: [&str; 3] = ["block_number", "tx_hash", "log_index"];

/// Rows for one destination table produced by one (contract, topic) unit of a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBatch {
    pub table: String,
    pub dedup_key: Vec<String>,
    pub window: Window,
    pub rows: Vec<DecodedRow>,
}

impl TableBatch {
    /// Builds a batch with duplicate keys removed; the first occurrence wins.
    pub fn new(table: impl Into<String>, window: Window, rows: Vec<DecodedRow>) -> Self {
        let dedup_key: Vec<String> = DEDUP_KEY.iter().map(|c| c.to_string()).collect();
        let mut seen = HashSet::with_capacity(rows.len());
        let rows = rows
            .into_iter()
            .filter(|row| seen.insert(row.dedup_key(&dedup_key)))
            .collect();

        Self {
            table: table.into(),
            dedup_key,
            window,
            rows,
        }
    }

    /// Group rows by destination table, tables in order of first appearance.
    pub fn group(rows: Vec<DecodedRow>, window: Window) -> Vec<TableBatch> {
        let mut by_table: IndexMap<String, Vec<DecodedRow>> = IndexMap::new();
        for row in rows {
            by_table.entry(row.table.clone()).or_default().push(row);
        }
        by_table
            .into_iter()
            .map(|(table, rows)| TableBatch::new(table, window, rows))
            .collect()
    }

    pub fn insert_id(&self, row: &DecodedRow) -> String {
        format!("{}-{}", self.table, row.dedup_key(&self.dedup_key))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Emitted rows derived from `dropped` are no longer canonical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgNotice {
    pub depth: usize,
    pub dropped: Vec<BlockHeader>,
    pub new_head: BlockHeader,
    /// First block that will be processed again
    pub resume_from: u64,
}

impl ReorgNotice {
    pub fn first_invalid_block(&self) -> Option<u64> {
        self.dropped.iter().map(|h| h.number).min()
    }
}

/// Downstream collaborator receiving decoded rows.
#[async_trait]
pub trait RowSink: Send + Sync {
    async fn write(&self, batch: TableBatch) -> Result<()>;

    /// Called before the pipeline rewinds past already-written blocks.
    async fn rollback(&self, notice: &ReorgNotice) -> Result<()> {
        warn!(
            "Sink has no rollback support; rows from {} dropped blocks remain (resume from {})",
            notice.depth, notice.resume_from
        );
        Ok(())
    }
}

/// Dry-run sink: logs what would be written.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl RowSink for LogSink {
    async fn write(&self, batch: TableBatch) -> Result<()> {
        if batch.is_empty() {
            debug!("No rows for {} in blocks {}", batch.table, batch.window);
            return Ok(());
        }
        info!(
            "Would write {} rows to {} for blocks {}",
            batch.len(),
            batch.table,
            batch.window
        );
        Ok(())
    }

    async fn rollback(&self, notice: &ReorgNotice) -> Result<()> {
        info!(
            "Would invalidate rows for {} blocks from {:?} (new head {} {})",
            notice.depth,
            notice.first_invalid_block(),
            notice.new_head.number,
            notice.new_head.hash
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;

    fn row(table: &str, block: u64, log_index: u64) -> DecodedRow {
        let mut columns = IndexMap::new();
        columns.insert("block_number".to_string(), Some(block.to_string()));
        columns.insert("tx_hash".to_string(), Some("0x01".to_string()));
        columns.insert("log_index".to_string(), Some(log_index.to_string()));
        DecodedRow {
            table: table.to_string(),
            event_name: "Transfer".to_string(),
            block_number: block,
            tx_hash: B256::repeat_byte(1),
            log_index,
            columns,
        }
    }

    #[test]
    fn batch_drops_duplicate_keys() {
        let window = Window::new(1, 10);
        let batch = TableBatch::new(
            "erc20_events",
            window,
            vec![row("erc20_events", 1, 0), row("erc20_events", 1, 0), row("erc20_events", 1, 1)],
        );
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.dedup_key, vec!["block_number", "tx_hash", "log_index"]);
        assert_eq!(batch.insert_id(&batch.rows[1]), "erc20_events-1:0x01:1");
    }

    #[test]
    fn groups_by_table_in_first_seen_order() {
        let batches = TableBatch::group(
            vec![row("dex_events", 2, 0), row("erc20_events", 1, 0), row("dex_events", 3, 0)],
            Window::new(1, 5),
        );
        let tables: Vec<(&str, usize)> = batches.iter().map(|b| (b.table.as_str(), b.len())).collect();
        assert_eq!(tables, vec![("dex_events", 2), ("erc20_events", 1)]);
    }
}
