pub mod reorg;
pub mod rpc;
pub mod transformations;

use alloy_primitives::{Address, B256, keccak256};
use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use crate::indexer::reorg::{GuardTransition, ReorgGuard};
use crate::indexer::rpc::blocks::{BlockEnricher, HeaderCache};
use crate::indexer::rpc::logs::RangeFetcher;
use crate::indexer::rpc::receipts::SenderResolver;
use crate::indexer::rpc::{ChainClient, FetchOutcome, fetch_with_retry};
use crate::indexer::transformations::decoded_logs::EventDecoder;
use crate::indexer::transformations::router::{TX_FROM_COLUMN, TableRouter, TokenCatalog};
use crate::metrics::Metrics;
use crate::models::abi::EventRegistry;
use crate::models::common::{Config, LogFilterPair, Window};
use crate::models::datasets::blocks::BlockHeader;
use crate::models::errors::SinkError;
use crate::storage::cursor::CursorStore;
use crate::storage::dead_letter::{DeadLetterQueue, DeadLetterRecord};
use crate::storage::{ReorgNotice, RowSink, TableBatch};
use crate::utils::retry::RetryConfig;

/// Totals for one call to [`Pipeline::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub windows_completed: u64,
    pub logs_fetched: u64,
    pub rows_emitted: u64,
    pub dead_letters: u64,
    pub reorgs_handled: u64,
    pub final_cursor: Option<u64>,
}

#[derive(Debug, Default)]
struct PairStats {
    logs: u64,
    rows: u64,
}

/// Build the (contract, topic) units of work, contracts and topics in name order.
///
/// A topic is either a `0x` topic0 hash or an event signature such as
/// `Transfer(address,address,uint256)`, which is hashed here.
pub fn build_pairs(config: &Config, registry: &EventRegistry) -> Result<Vec<LogFilterPair>> {
    if config.topics.is_empty() {
        bail!("no topics configured for stream {}", config.stream_name);
    }

    let mut topics = Vec::with_capacity(config.topics.len());
    for (name, value) in &config.topics {
        let value = value.trim();
        let topic_hash = if value.starts_with("0x") {
            value
                .parse::<B256>()
                .with_context(|| format!("invalid topic hash for {name}: {value}"))?
        } else if value.contains('(') {
            let signature: String = value.chars().filter(|c| !c.is_whitespace()).collect();
            keccak256(signature.as_bytes())
        } else {
            bail!("topic {name} must be a 0x hash or an event signature, got {value}");
        };

        if registry.get(&topic_hash).is_none() {
            warn!(
                "Topic {} ({}) has no event in the interface catalog; its logs will be skipped",
                name, topic_hash
            );
        }
        topics.push((name.clone(), topic_hash));
    }

    let mut pairs = Vec::with_capacity(config.contracts.len() * topics.len());
    for (contract, address) in &config.contracts {
        let address: Address = address
            .trim()
            .parse()
            .with_context(|| format!("invalid address for contract {contract}: {address}"))?;
        for (topic, topic_hash) in &topics {
            pairs.push(LogFilterPair {
                contract: contract.clone(),
                address,
                topic: topic.clone(),
                topic_hash: *topic_hash,
            });
        }
    }
    Ok(pairs)
}

/// Drives windows from the cursor to the safe head and owns the cursor.
pub struct Pipeline<C: ChainClient + ?Sized> {
    client: Arc<C>,
    config: Config,
    pairs: Vec<LogFilterPair>,
    retry: RetryConfig,
    fetcher: RangeFetcher<C>,
    enricher: BlockEnricher<C>,
    senders: SenderResolver<C>,
    decoder: EventDecoder,
    guard: ReorgGuard,
    cursor: CursorStore,
    dead_letters: DeadLetterQueue,
    sink: Arc<dyn RowSink>,
    metrics: Option<Arc<Metrics>>,
}

impl<C: ChainClient + ?Sized> Pipeline<C> {
    pub fn new(
        config: Config,
        client: Arc<C>,
        registry: Arc<EventRegistry>,
        sink: Arc<dyn RowSink>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self> {
        let pairs = build_pairs(&config, &registry)?;
        let retry = RetryConfig::from(&config.retry);

        let router = Arc::new(TableRouter::new(
            config.event_tables.clone(),
            &config.tables,
        ));
        let tokens = Arc::new(TokenCatalog::from_config(&config.tokens));
        let decoder = EventDecoder::new(registry, router, tokens, config.chain_name.clone());

        info!(
            "Pipeline for stream {}: {} contract/topic pairs, window {} blocks, {} confirmations",
            config.stream_name,
            pairs.len(),
            config.window_size,
            config.confirmations
        );

        Ok(Self {
            fetcher: RangeFetcher::new(
                client.clone(),
                retry.clone(),
                config.log_batch_size(),
                metrics.clone(),
            ),
            enricher: BlockEnricher::new(
                client.clone(),
                retry.clone(),
                config.header_batch_size,
                metrics.clone(),
            ),
            senders: SenderResolver::new(client.clone(), retry.clone()),
            guard: ReorgGuard::new(config.reorg_buffer_size()),
            cursor: CursorStore::new(&config.state_file, config.stream_name.clone()),
            dead_letters: DeadLetterQueue::new(&config.dead_letter_file),
            client,
            pairs,
            retry,
            decoder,
            sink,
            metrics,
            config,
        })
    }

    pub fn pairs(&self) -> &[LogFilterPair] {
        &self.pairs
    }

    pub fn guard(&self) -> &ReorgGuard {
        &self.guard
    }

    /// `head - confirmations`, capped by `end_block`.
    pub async fn safe_head(&self) -> Result<u64> {
        let head = match fetch_with_retry(
            || self.client.latest_block_number(),
            &self.retry,
            "eth_blockNumber",
        )
        .await
        {
            FetchOutcome::Ok(head) => head,
            FetchOutcome::TooLarge => bail!("eth_blockNumber rejected as too large"),
            FetchOutcome::Fatal(e) => return Err(e.context("failed to get chain head")),
        };

        if let Some(metrics) = &self.metrics {
            metrics.chain_tip_block.record(head, &[metrics.chain_label()]);
        }

        let safe = head.saturating_sub(self.config.confirmations);
        let safe = self.config.end_block.map_or(safe, |end| end.min(safe));
        debug!("Chain head {}, safe head {}", head, safe);
        Ok(safe)
    }

    /// Process windows until the safe head is reached or `stop` fires.
    ///
    /// Per-pair failures become dead letters. Errors returned from here are the
    /// non-isolated ones: head lookup, window headers, cursor persistence and an
    /// exhausted reorg restart budget.
    pub async fn run(&mut self, mut stop: broadcast::Receiver<()>) -> Result<RunSummary> {
        let target = self.safe_head().await?;
        let persisted = self.cursor.load()?;

        let mut next = match (self.config.start_block, persisted) {
            (Some(start), _) => start,
            (None, Some(last)) => last + 1,
            (None, None) => 0,
        };
        self.align_guard(next);
        // Highest block whose rows reached the sink
        let mut emitted_through = persisted;
        let mut high_water = next;
        let mut restarts = 0u32;

        let mut summary = RunSummary {
            final_cursor: persisted,
            ..Default::default()
        };

        if next > target {
            info!("Nothing to process: next block {} is past safe head {}", next, target);
            return Ok(summary);
        }
        info!("Processing blocks {} to {}", next, target);

        while next <= target {
            if matches!(stop.try_recv(), Ok(()) | Err(TryRecvError::Lagged(_))) {
                info!("Stop requested, halting before block {}", next);
                break;
            }

            let window = Window::new(
                next,
                next.saturating_add(self.config.window_size.max(1) - 1)
                    .min(target),
            );
            let started = Instant::now();

            let cache = if self.config.reorg.enabled {
                let headers = self.window_headers(window).await?;
                if let Some(notice) = self.track(&headers, window, emitted_through) {
                    restarts += 1;
                    if restarts > self.config.reorg.max_restarts {
                        bail!(
                            "Giving up after {} consecutive reorg restarts without progress",
                            restarts - 1
                        );
                    }
                    next = self.rewind(&notice, &mut emitted_through).await?;
                    summary.reorgs_handled += 1;
                    summary.final_cursor = emitted_through;
                    continue;
                }
                headers
            } else {
                HeaderCache::new()
            };

            let this = &*self;
            let outcomes = join_all(
                this.pairs
                    .iter()
                    .map(|pair| this.process_pair(pair, window, &cache)),
            )
            .await;

            for (pair, outcome) in self.pairs.iter().zip(outcomes) {
                match outcome {
                    Ok(stats) => {
                        summary.logs_fetched += stats.logs;
                        summary.rows_emitted += stats.rows;
                    }
                    Err(e) => {
                        let record = DeadLetterRecord::for_pair(
                            &self.config.stream_name,
                            pair,
                            window,
                            &e,
                            Utc::now(),
                        );
                        self.dead_letters
                            .record(&record)
                            .context("failed to write dead letter")?;
                        summary.dead_letters += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics.dead_letters.add(1, &[metrics.chain_label()]);
                        }
                    }
                }
            }

            self.cursor
                .save(window.to_block)
                .context("failed to persist cursor")?;
            emitted_through = Some(window.to_block);
            summary.windows_completed += 1;
            summary.final_cursor = emitted_through;

            if window.to_block >= high_water {
                high_water = window.to_block;
                restarts = 0;
            }

            if let Some(metrics) = &self.metrics {
                let labels = [metrics.chain_label()];
                metrics.windows_processed.add(1, &labels);
                metrics.latest_processed_block.record(window.to_block, &labels);
                metrics
                    .window_processing_time
                    .record(started.elapsed().as_secs_f64(), &labels);
                metrics
                    .chain_tip_lag
                    .record(target.saturating_sub(window.to_block), &labels);
            }

            info!(
                "Completed blocks {} ({} logs, {} rows, {} dead letters so far) in {:.2?}",
                window,
                summary.logs_fetched,
                summary.rows_emitted,
                summary.dead_letters,
                started.elapsed()
            );
            next = window.to_block + 1;
        }

        Ok(summary)
    }

    /// Blocks the guard needs for `window`: the first one, whose parent links the
    /// window to what was already processed, and the last `capacity` ones, which
    /// the next window's fork depth is measured against. Other headers are only
    /// fetched when a log needs a timestamp.
    fn tracked_blocks(&self, window: Window) -> Vec<u64> {
        let capacity = self.guard.capacity() as u64;
        let tail_from = window
            .to_block
            .saturating_sub(capacity.saturating_sub(1))
            .max(window.from_block);
        std::iter::once(window.from_block)
            .chain(tail_from..=window.to_block)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    async fn window_headers(&self, window: Window) -> Result<HeaderCache> {
        let tracked = self.tracked_blocks(window);
        let headers = self
            .enricher
            .resolve_headers(tracked.iter().copied())
            .await
            .with_context(|| format!("failed to resolve headers for blocks {window}"))?;

        if let Some(missing) = tracked.iter().find(|n| !headers.contains_key(n)) {
            return Err(anyhow!(
                "Header for block {} not available while processing blocks {}",
                missing,
                window
            ));
        }
        Ok(headers)
    }

    /// Leave only headers that `next` can attach to: the guard's tail must be
    /// block `next - 1`, otherwise the first header would be checked against an
    /// unrelated block.
    fn align_guard(&mut self, next: u64) {
        match next.checked_sub(1) {
            Some(parent) => {
                self.guard.rewind_to(parent);
                if self.guard.tail().is_some_and(|h| h.number != parent) {
                    debug!("Reorg guard does not reach block {}, starting it afresh", parent);
                    self.guard.clear();
                }
            }
            None => self.guard.clear(),
        }
    }

    /// Feed the window's headers to the guard in ascending order. Returns a notice
    /// when a fork requires reprocessing, at the latest from the window start.
    fn track(
        &mut self,
        headers: &HeaderCache,
        window: Window,
        emitted_through: Option<u64>,
    ) -> Option<ReorgNotice> {
        for header in headers.values() {
            if self
                .guard
                .tail()
                .is_some_and(|tail| header.number > tail.number + 1)
            {
                // Untracked stretch inside the window, continuity restarts here
                self.guard.clear();
            }
            match self.guard.observe(header.clone()) {
                GuardTransition::Appended | GuardTransition::Duplicate => {}
                GuardTransition::ForkDetected { depth, dropped } => {
                    let resume_from = dropped
                        .iter()
                        .map(|h| h.number)
                        .min()
                        .map_or(window.from_block, |n| n.min(window.from_block));
                    let emitted = emitted_through.is_some_and(|last| resume_from <= last);

                    warn!(
                        "Fork at block {} (depth {}), resuming from block {}{}",
                        header.number,
                        depth,
                        resume_from,
                        if emitted { "; emitted rows are affected" } else { "" }
                    );
                    return Some(ReorgNotice {
                        depth,
                        dropped,
                        new_head: header.clone(),
                        resume_from,
                    });
                }
            }
        }
        None
    }

    /// Roll back sink, guard and cursor to just before `notice.resume_from`.
    async fn rewind(
        &mut self,
        notice: &ReorgNotice,
        emitted_through: &mut Option<u64>,
    ) -> Result<u64> {
        if let Some(metrics) = &self.metrics {
            metrics.reorgs.add(1, &[metrics.chain_label()]);
        }

        let resume_from = notice.resume_from;
        self.align_guard(resume_from);

        if emitted_through.is_some_and(|last| resume_from <= last) {
            self.sink
                .rollback(notice)
                .await
                .context("sink failed to roll back reorged rows")?;

            let persisted = match resume_from.checked_sub(1) {
                Some(keep) => self.cursor.save(keep),
                None => self.cursor.clear(),
            };
            persisted.context("failed to persist rewound cursor")?;
            *emitted_through = resume_from.checked_sub(1);

            info!(
                "Rewound cursor of stream {} to {:?}",
                self.config.stream_name, emitted_through
            );
        }
        Ok(resume_from)
    }

    async fn process_pair(
        &self,
        pair: &LogFilterPair,
        window: Window,
        cache: &HeaderCache,
    ) -> Result<PairStats> {
        let logs = self
            .fetcher
            .fetch_logs(pair.address, pair.topic_hash, window)
            .await
            .with_context(|| format!("fetching logs for {pair} in blocks {window}"))?;
        if logs.is_empty() {
            return Ok(PairStats::default());
        }

        let headers = self
            .enricher
            .resolve_with_cache(logs.iter().map(|log| log.block_number), cache)
            .await
            .with_context(|| format!("resolving block times for {pair} in blocks {window}"))?;

        let mut rows = Vec::with_capacity(logs.len());
        for log in &logs {
            let block_time = headers.get(&log.block_number).map(BlockHeader::block_time);
            if let Some(row) = self.decoder.decode(log, block_time)? {
                rows.push(row);
            }
        }

        self.senders
            .annotate(&mut rows, TX_FROM_COLUMN)
            .await
            .with_context(|| format!("resolving senders for {pair} in blocks {window}"))?;

        let mut emitted = 0u64;
        for batch in TableBatch::group(rows, window) {
            let (table, count) = (batch.table.clone(), batch.len());
            self.sink.write(batch).await.map_err(|e| SinkError {
                table,
                rows: count,
                reason: format!("{e:#}"),
            })?;
            emitted += count as u64;
        }

        if let Some(metrics) = &self.metrics {
            metrics.rows_emitted.add(emitted, &[metrics.chain_label()]);
        }
        if emitted > 0 {
            debug!("{}: {} logs, {} rows in blocks {}", pair, logs.len(), emitted, window);
        }

        Ok(PairStats {
            logs: logs.len() as u64,
            rows: emitted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::abi::signature_hash;
    use crate::models::common::{MetricsConfig, ReorgSettings, RetrySettings, SinkConfig};
    use indexmap::IndexMap;
    use std::collections::BTreeMap;

    fn config() -> Config {
        let mut contracts = BTreeMap::new();
        contracts.insert(
            "weth".to_string(),
            "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2".to_string(),
        );
        contracts.insert(
            "usdc".to_string(),
            "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".to_string(),
        );
        let mut topics = BTreeMap::new();
        topics.insert(
            "transfer".to_string(),
            "Transfer(address, address, uint256)".to_string(),
        );
        topics.insert(
            "approval".to_string(),
            "0x8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925".to_string(),
        );

        Config {
            chain_name: "ethereum".to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            stream_name: "logs".to_string(),
            start_block: None,
            end_block: None,
            confirmations: 12,
            window_size: 100,
            log_batch_size: None,
            header_batch_size: 1,
            rate_limit_per_second: 5.0,
            call_timeout_secs: 30,
            retry: RetrySettings::default(),
            reorg: ReorgSettings::default(),
            state_file: "state.json".to_string(),
            dead_letter_file: "dlq.jsonl".to_string(),
            abi_dir: "abi".to_string(),
            contracts,
            topics,
            event_tables: BTreeMap::new(),
            tables: IndexMap::new(),
            tokens: BTreeMap::new(),
            sink: SinkConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    #[test]
    fn pairs_follow_name_order_and_hash_signatures() {
        let pairs = build_pairs(&config(), &EventRegistry::default()).unwrap();

        let names: Vec<String> = pairs.iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            vec!["usdc:approval", "usdc:transfer", "weth:approval", "weth:transfer"]
        );
        assert_eq!(
            pairs[1].topic_hash,
            signature_hash("Transfer", &["address", "address", "uint256"])
        );
        assert_eq!(
            pairs[0].topic_hash,
            signature_hash("Approval", &["address", "address", "uint256"])
        );
    }

    #[test]
    fn rejects_bad_topics_and_addresses() {
        let mut bad_topic = config();
        bad_topic.topics.insert("oops".to_string(), "Transfer".to_string());
        assert!(build_pairs(&bad_topic, &EventRegistry::default()).is_err());

        let mut bad_address = config();
        bad_address
            .contracts
            .insert("broken".to_string(), "0x1234".to_string());
        assert!(build_pairs(&bad_address, &EventRegistry::default()).is_err());

        let mut no_topics = config();
        no_topics.topics.clear();
        assert!(build_pairs(&no_topics, &EventRegistry::default()).is_err());
    }
}
