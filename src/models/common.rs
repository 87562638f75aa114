use alloy_primitives::{Address, B256};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    #[serde(default = "default_metrics_address")]
    pub address: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
            port: default_metrics_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorgSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Capacity of the header window. Falls back to `confirmations` when unset.
    #[serde(default)]
    pub buffer_size: Option<usize>,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

impl Default for ReorgSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_size: None,
            max_restarts: default_max_restarts(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Dry run: decode everything, log row counts, write nothing.
    Log,
    BigQuery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub kind: SinkKind,
    /// BigQuery dataset; defaults to the chain name.
    #[serde(default)]
    pub dataset: Option<String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Log,
            dataset: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub chain_name: String,
    pub rpc_url: String,
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    pub start_block: Option<u64>,
    pub end_block: Option<u64>,
    pub confirmations: u64,
    #[serde(default = "default_window_size")]
    pub window_size: u64,
    /// Sub-window size for a single `eth_getLogs` call. Defaults to `window_size`.
    #[serde(default)]
    pub log_batch_size: Option<u64>,
    #[serde(default = "default_header_batch_size")]
    pub header_batch_size: usize,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_second: f64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub reorg: ReorgSettings,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_dead_letter_file")]
    pub dead_letter_file: String,
    #[serde(default = "default_abi_dir")]
    pub abi_dir: String,
    pub contracts: BTreeMap<String, String>,
    pub topics: BTreeMap<String, String>,
    #[serde(default)]
    pub event_tables: BTreeMap<String, String>,
    #[serde(default)]
    pub tables: IndexMap<String, Vec<String>>,
    #[serde(default)]
    pub tokens: BTreeMap<String, TokenConfig>,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn log_batch_size(&self) -> u64 {
        self.log_batch_size.unwrap_or(self.window_size).max(1)
    }

    pub fn reorg_buffer_size(&self) -> usize {
        self.reorg
            .buffer_size
            .unwrap_or(self.confirmations as usize)
            .max(1)
    }
}

/// One (contract, topic) unit of work inside a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilterPair {
    pub contract: String,
    pub address: Address,
    pub topic: String,
    pub topic_hash: B256,
}

impl fmt::Display for LogFilterPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.contract, self.topic)
    }
}

/// Inclusive block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub from_block: u64,
    pub to_block: u64,
}

impl Window {
    pub fn new(from_block: u64, to_block: u64) -> Self {
        Self {
            from_block,
            to_block,
        }
    }

    pub fn len(&self) -> u64 {
        self.to_block.saturating_sub(self.from_block) + 1
    }

    pub fn is_single_block(&self) -> bool {
        self.from_block >= self.to_block
    }

    /// Split at the midpoint. Returns `None` for a single-block window.
    pub fn bisect(&self) -> Option<(Window, Window)> {
        if self.is_single_block() {
            return None;
        }
        let mid = self.from_block + (self.to_block - self.from_block) / 2;
        Some((
            Window::new(self.from_block, mid),
            Window::new(mid + 1, self.to_block),
        ))
    }

    /// Consecutive sub-windows of at most `size` blocks.
    pub fn chunks(&self, size: u64) -> Vec<Window> {
        let size = size.max(1);
        let mut out = Vec::new();
        let mut start = self.from_block;
        while start <= self.to_block {
            let end = start.saturating_add(size - 1).min(self.to_block);
            out.push(Window::new(start, end));
            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }
        out
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from_block, self.to_block)
    }
}

fn default_metrics_address() -> String {
    "0.0.0.0".to_string()
}

fn default_metrics_port() -> u16 {
    9100
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    20_000
}

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    3
}

fn default_stream_name() -> String {
    "logs".to_string()
}

fn default_window_size() -> u64 {
    1_000
}

fn default_header_batch_size() -> usize {
    1
}

fn default_rate_limit() -> f64 {
    5.0
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_state_file() -> String {
    "state.json".to_string()
}

fn default_dead_letter_file() -> String {
    "dlq/dead_letters.jsonl".to_string()
}

fn default_abi_dir() -> String {
    "abi".to_string()
}
