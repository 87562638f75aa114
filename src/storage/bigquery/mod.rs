use anyhow::{Result, anyhow};
use async_trait::async_trait;
use google_cloud_bigquery::client::{Client, ClientConfig};
use google_cloud_bigquery::http::tabledata::insert_all::{InsertAllRequest, Row as TableRow};
use tracing::{info, warn};

use crate::models::datasets::logs::DecodedRow;
use crate::storage::{ReorgNotice, RowSink, TableBatch};
use crate::utils::retry::{RetryConfig, retry};

// BigQuery hard limit & safety margins
const BQ_MAX_BYTES: usize = 10_000_000; // 10 MiB
const SAFETY_MARGIN: usize = 512_000; // 0.5 MiB head room
const MAX_BATCH_BYTES: usize = BQ_MAX_BYTES - SAFETY_MARGIN;
const ROW_OVERHEAD: usize = 200; // rough JSON envelope per row

/// Streaming-insert sink. Every row carries its dedup key as `insertId`, so a
/// window replayed after a crash does not produce duplicate rows.
pub struct BigQuerySink {
    client: Client,
    project_id: String,
    dataset: String,
    retry: RetryConfig,
}

impl BigQuerySink {
    pub async fn connect(dataset: impl Into<String>, retry: RetryConfig) -> Result<Self> {
        let (config, project_id) = ClientConfig::new_with_auth().await?;
        let client = Client::new(config).await?;
        let project_id = project_id.ok_or_else(|| anyhow!("Project ID not found"))?;
        let dataset = dataset.into();

        info!("Initialized BigQuery client for {}.{}", project_id, dataset);
        Ok(Self {
            client,
            project_id,
            dataset,
            retry,
        })
    }

    async fn insert_chunk(&self, table: &str, rows: Vec<TableRow<&DecodedRow>>) -> Result<()> {
        let request = InsertAllRequest {
            skip_invalid_rows: Some(true),
            ignore_unknown_values: Some(true),
            template_suffix: None,
            rows,
            trace_id: None,
        };

        retry(
            || async {
                let response = self
                    .client
                    .tabledata()
                    .insert(&self.project_id, &self.dataset, table, &request)
                    .await?;
                match response.insert_errors {
                    Some(errors) if !errors.is_empty() => {
                        Err(anyhow!("Insert errors: {:?}", errors))
                    }
                    _ => Ok::<(), anyhow::Error>(()),
                }
            },
            &self.retry,
            "insert_data",
        )
        .await
    }
}

/// Group rows into request-sized chunks. A row above the limit on its own is
/// sent alone.
fn chunk_by_size<'a>(
    batch: &'a TableBatch,
    max_bytes: usize,
) -> Result<Vec<Vec<TableRow<&'a DecodedRow>>>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_size = 0usize;

    for row in &batch.rows {
        let estimated_size = serde_json::to_string(row)?.len() + ROW_OVERHEAD;
        if current_size + estimated_size > max_bytes && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current.push(TableRow {
            insert_id: Some(batch.insert_id(row)),
            json: row,
        });
        current_size += estimated_size;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    Ok(chunks)
}

#[async_trait]
impl RowSink for BigQuerySink {
    async fn write(&self, batch: TableBatch) -> Result<()> {
        if batch.is_empty() {
            info!(
                "No data to insert into {}.{}.{} for blocks {}",
                self.project_id, self.dataset, batch.table, batch.window
            );
            return Ok(());
        }

        let started = std::time::Instant::now();
        let chunks = chunk_by_size(&batch, MAX_BATCH_BYTES)?;
        let sent = chunks.len();

        for chunk in chunks {
            self.insert_chunk(&batch.table, chunk).await?;
        }

        info!(
            "Successfully inserted {} rows into {}.{}.{} for blocks {} in {} batches (took {:.2?})",
            batch.len(),
            self.project_id,
            self.dataset,
            batch.table,
            batch.window,
            sent,
            started.elapsed()
        );
        Ok(())
    }

    async fn rollback(&self, notice: &ReorgNotice) -> Result<()> {
        // Streamed rows cannot be deleted while in the streaming buffer
        warn!(
            "Reorg of depth {} in {}.{}: rows from blocks >= {:?} may be stale and need reconciling",
            notice.depth,
            self.project_id,
            self.dataset,
            notice.first_invalid_block()
        );
        Ok(())
    }
}
