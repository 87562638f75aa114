use alloy_primitives::B256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::hex_to_u64;

////////////////////////////////////// RPC Data ////////////////////////////////////////
// Subset of an `eth_getBlockByNumber(n, false)` response. Numeric fields stay hex strings
// on the wire and are parsed explicitly.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlockHeader {
    pub number: String,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: String,
}

impl TryFrom<RpcBlockHeader> for BlockHeader {
    type Error = anyhow::Error;

    fn try_from(raw: RpcBlockHeader) -> Result<Self, Self::Error> {
        let number = hex_to_u64(&raw.number)
            .ok_or_else(|| anyhow::anyhow!("Invalid block number '{}'", raw.number))?;
        let timestamp = hex_to_u64(&raw.timestamp).ok_or_else(|| {
            anyhow::anyhow!("Invalid timestamp '{}' for block {}", raw.timestamp, number)
        })?;

        Ok(BlockHeader {
            number,
            hash: raw.hash,
            parent_hash: raw.parent_hash,
            timestamp,
        })
    }
}

/////////////////////////////////// Domain Data ////////////////////////////////////////
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
}

impl BlockHeader {
    pub fn block_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.timestamp as i64, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_encoded_header_fields() {
        let raw: RpcBlockHeader = serde_json::from_value(serde_json::json!({
            "number": "0x10",
            "hash": format!("0x{}", "11".repeat(32)),
            "parentHash": format!("0x{}", "22".repeat(32)),
            "timestamp": "0x65f0b2a0",
            "miner": "0x0000000000000000000000000000000000000000"
        }))
        .unwrap();

        let header = BlockHeader::try_from(raw).unwrap();
        assert_eq!(header.number, 16);
        assert_eq!(header.timestamp, 0x65f0b2a0);
        assert_eq!(header.hash, B256::repeat_byte(0x11));
        assert_eq!(header.parent_hash, B256::repeat_byte(0x22));
        assert_eq!(header.block_time().timestamp(), 0x65f0b2a0);
    }

    #[test]
    fn rejects_non_hex_number() {
        let raw = RpcBlockHeader {
            number: "sixteen".to_string(),
            hash: B256::ZERO,
            parent_hash: B256::ZERO,
            timestamp: "0x0".to_string(),
        };
        assert!(BlockHeader::try_from(raw).is_err());
    }
}
