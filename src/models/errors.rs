use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Upstream rejected the request as too large")]
    TooLarge,
    #[error("Transient RPC failure: {0}")]
    Transient(String),
    #[error("RPC failure: {0}")]
    Fatal(String),
}

impl RpcError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read interface catalog at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid ABI in {path}: {reason}")]
    InvalidAbi { path: String, reason: String },
    #[error("Unsupported parameter type '{ty}' in event {event}: {reason}")]
    UnsupportedType {
        event: String,
        ty: String,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid indexed topic for '{param}' in {event}: {reason}")]
    InvalidTopic {
        event: String,
        param: String,
        reason: String,
    },
    #[error("Failed to decode data payload of {event}: {reason}")]
    InvalidData { event: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to access state file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Corrupt state file {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Block {block} is still too large to fetch on its own")]
    SingleBlockTooLarge { block: u64 },
    #[error("{context} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        context: String,
        attempts: u32,
        reason: String,
    },
    #[error("{context} failed: {reason}")]
    Rpc { context: String, reason: String },
}

#[derive(Error, Debug)]
#[error("Sink failed to write {rows} rows to {table}: {reason}")]
pub struct SinkError {
    pub table: String,
    pub rows: usize,
    pub reason: String,
}
