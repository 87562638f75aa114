use alloy_primitives::{Address, B256, Bytes};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::indexer::rpc::ChainClient;
use crate::models::common::Window;
use crate::models::datasets::blocks::BlockHeader;
use crate::models::datasets::logs::{RawLog, RpcReceiptData};
use crate::models::errors::RpcError;

/// In-memory upstream for unit tests.
#[derive(Default)]
pub struct MockClient {
    pub head: u64,
    pub logs: Vec<RawLog>,
    pub headers: BTreeMap<u64, BlockHeader>,
    pub senders: HashMap<B256, Address>,
    /// Log queries spanning more blocks than this are rejected as too large
    pub max_log_range: Option<u64>,
    /// Header requests with more numbers than this are rejected as too large
    pub max_header_batch: Option<usize>,
    /// Fail this many calls with a transient error before answering
    pub transient_failures: AtomicU32,
    pub log_calls: Mutex<Vec<Window>>,
    pub header_calls: Mutex<Vec<Vec<u64>>>,
}

impl MockClient {
    pub fn log_calls(&self) -> Vec<Window> {
        self.log_calls.lock().unwrap().clone()
    }

    pub fn header_calls(&self) -> Vec<Vec<u64>> {
        self.header_calls.lock().unwrap().clone()
    }

    fn maybe_fail(&self) -> Result<(), RpcError> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RpcError::Transient("connection reset".to_string()));
        }
        Ok(())
    }
}

pub fn log_at(block_number: u64, log_index: u64, topic0: B256) -> RawLog {
    RawLog {
        address: Address::repeat_byte(0x42),
        topics: vec![topic0],
        data: Bytes::new(),
        block_number,
        tx_hash: B256::left_padding_from(&block_number.to_be_bytes()),
        log_index,
        removed: false,
    }
}

pub fn header_chain(from: u64, to: u64, salt: u8) -> BTreeMap<u64, BlockHeader> {
    (from..=to)
        .map(|n| {
            let header = BlockHeader {
                number: n,
                hash: block_hash(n, salt),
                parent_hash: block_hash(n.saturating_sub(1), salt),
                timestamp: 1_700_000_000 + n * 12,
            };
            (n, header)
        })
        .collect()
}

pub fn block_hash(number: u64, salt: u8) -> B256 {
    let mut bytes = [salt; 32];
    bytes[24..].copy_from_slice(&number.to_be_bytes());
    B256::from(bytes)
}

#[async_trait]
impl ChainClient for MockClient {
    async fn latest_block_number(&self) -> Result<u64, RpcError> {
        self.maybe_fail()?;
        Ok(self.head)
    }

    async fn get_logs(
        &self,
        address: Address,
        topic0: B256,
        window: Window,
    ) -> Result<Vec<RawLog>, RpcError> {
        self.log_calls.lock().unwrap().push(window);
        self.maybe_fail()?;
        if self.max_log_range.is_some_and(|max| window.len() > max) {
            return Err(RpcError::TooLarge);
        }
        Ok(self
            .logs
            .iter()
            .filter(|l| l.address == address && l.topic0() == Some(&topic0))
            .filter(|l| l.block_number >= window.from_block && l.block_number <= window.to_block)
            .cloned()
            .collect())
    }

    async fn get_block_headers(&self, numbers: &[u64]) -> Result<Vec<BlockHeader>, RpcError> {
        self.header_calls.lock().unwrap().push(numbers.to_vec());
        self.maybe_fail()?;
        if self.max_header_batch.is_some_and(|max| numbers.len() > max) {
            return Err(RpcError::TooLarge);
        }
        Ok(numbers
            .iter()
            .filter_map(|n| self.headers.get(n).cloned())
            .collect())
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> Result<Option<RpcReceiptData>, RpcError> {
        self.maybe_fail()?;
        Ok(self.senders.get(&tx_hash).map(|from| RpcReceiptData {
            transaction_hash: tx_hash,
            from: *from,
        }))
    }
}
