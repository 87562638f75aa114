use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::models::common::{LogFilterPair, Window};
use crate::models::errors::{DecodeError, FetchError, RpcError, SinkError, StateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TooLarge,
    Transient,
    Rpc,
    Decode,
    Sink,
    Other,
}

impl ErrorKind {
    /// Classify by the first typed error found in the chain.
    pub fn classify(error: &anyhow::Error) -> Self {
        for cause in error.chain() {
            if let Some(fetch) = cause.downcast_ref::<FetchError>() {
                return match fetch {
                    FetchError::SingleBlockTooLarge { .. } => ErrorKind::TooLarge,
                    FetchError::RetriesExhausted { .. } => ErrorKind::Transient,
                    FetchError::Rpc { .. } => ErrorKind::Rpc,
                };
            }
            if let Some(rpc) = cause.downcast_ref::<RpcError>() {
                return match rpc {
                    RpcError::TooLarge => ErrorKind::TooLarge,
                    RpcError::Transient(_) => ErrorKind::Transient,
                    RpcError::Fatal(_) => ErrorKind::Rpc,
                };
            }
            if cause.is::<DecodeError>() {
                return ErrorKind::Decode;
            }
            if cause.is::<SinkError>() {
                return ErrorKind::Sink;
            }
        }
        ErrorKind::Other
    }
}

/// Enough to replay the failed unit by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterContext {
    pub from_block: u64,
    pub to_block: u64,
    pub contract: String,
    pub contract_address: String,
    pub topic: String,
    pub topic_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub recorded_at: String,
    pub stream: String,
    pub unit: String,
    pub error_kind: ErrorKind,
    pub error: String,
    pub context: DeadLetterContext,
}

impl DeadLetterRecord {
    pub fn for_pair(
        stream: &str,
        pair: &LogFilterPair,
        window: Window,
        error: &anyhow::Error,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            recorded_at: recorded_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            stream: stream.to_string(),
            unit: "logs".to_string(),
            error_kind: ErrorKind::classify(error),
            error: format!("{error:#}"),
            context: DeadLetterContext {
                from_block: window.from_block,
                to_block: window.to_block,
                contract: pair.contract.clone(),
                contract_address: format!("{:#x}", pair.address),
                topic: pair.topic.clone(),
                topic_hash: format!("{:#x}", pair.topic_hash),
            },
        }
    }
}

/// Append-only JSON-lines file of failed units. The pipeline never reads it back.
#[derive(Debug)]
pub struct DeadLetterQueue {
    path: PathBuf,
    // Serializes appends from concurrently processed pairs
    lock: Mutex<()>,
}

impl DeadLetterQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, record: &DeadLetterRecord) -> Result<(), StateError> {
        let mut line = serde_json::to_string(record).map_err(|source| StateError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })?;
        line.push('\n');

        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| self.io_error(e))?;

        warn!(
            "Dead letter for {}:{} blocks {}-{} ({:?}): {}",
            record.context.contract,
            record.context.topic,
            record.context.from_block,
            record.context.to_block,
            record.error_kind,
            record.error
        );
        Ok(())
    }

    /// All records written so far, oldest first. Intended for operators and tests.
    pub fn read_all(&self) -> Result<Vec<DeadLetterRecord>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e).into()),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }

    fn io_error(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256};
    use anyhow::Context;

    fn pair() -> LogFilterPair {
        LogFilterPair {
            contract: "usdc".to_string(),
            address: Address::repeat_byte(0xAA),
            topic: "transfer".to_string(),
            topic_hash: B256::repeat_byte(0x11),
        }
    }

    #[test]
    fn classifies_through_context() {
        let err = anyhow::Error::from(FetchError::SingleBlockTooLarge { block: 9 })
            .context("fetching usdc:transfer");
        assert_eq!(ErrorKind::classify(&err), ErrorKind::TooLarge);

        let err = anyhow::Error::from(DecodeError::InvalidData {
            event: "Transfer".to_string(),
            reason: "short".to_string(),
        });
        assert_eq!(ErrorKind::classify(&err), ErrorKind::Decode);

        let err: Result<(), _> = Err(RpcError::Transient("timeout".to_string()));
        let err = err.context("head").unwrap_err();
        assert_eq!(ErrorKind::classify(&err), ErrorKind::Transient);

        assert_eq!(ErrorKind::classify(&anyhow::anyhow!("boom")), ErrorKind::Other);
    }

    #[test]
    fn appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DeadLetterQueue::new(dir.path().join("dlq").join("dead.jsonl"));
        let err = anyhow::Error::from(FetchError::RetriesExhausted {
            context: "eth_getLogs".to_string(),
            attempts: 5,
            reason: "timeout".to_string(),
        });
        let at = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        queue
            .record(&DeadLetterRecord::for_pair("logs", &pair(), Window::new(10, 19), &err, at))
            .unwrap();
        queue
            .record(&DeadLetterRecord::for_pair("logs", &pair(), Window::new(20, 29), &err, at))
            .unwrap();

        let records = queue.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].error_kind, ErrorKind::Transient);
        assert_eq!(records[0].recorded_at, "2024-01-01T00:00:00Z");
        assert_eq!(records[1].context.from_block, 20);
        assert_eq!(records[1].context.contract_address, format!("0x{}", "aa".repeat(20)));

        let raw = fs::read_to_string(queue.path()).unwrap();
        assert!(raw.lines().next().unwrap().contains(r#""error_kind":"transient""#));
    }
}
