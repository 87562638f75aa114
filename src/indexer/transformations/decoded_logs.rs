use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::hex;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::indexer::transformations::normalize::canonical_text;
use crate::indexer::transformations::router::{TableRouter, TokenCatalog};
use crate::models::abi::{EventDescriptor, EventRegistry};
use crate::models::datasets::logs::{DecodedRow, RawLog};
use crate::models::errors::DecodeError;

/// Decodes raw logs against the interface catalog and shapes them into rows of
/// their destination table.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    registry: Arc<EventRegistry>,
    router: Arc<TableRouter>,
    tokens: Arc<TokenCatalog>,
    chain: String,
}

impl EventDecoder {
    pub fn new(
        registry: Arc<EventRegistry>,
        router: Arc<TableRouter>,
        tokens: Arc<TokenCatalog>,
        chain: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            router,
            tokens,
            chain: chain.into(),
        }
    }

    pub fn router(&self) -> &TableRouter {
        &self.router
    }

    /// `Ok(None)` means skip: removed log, unknown signature or unrouted event.
    /// A missing block time is rendered as the epoch.
    pub fn decode(
        &self,
        log: &RawLog,
        block_time: Option<DateTime<Utc>>,
    ) -> Result<Option<DecodedRow>, DecodeError> {
        if log.removed {
            return Ok(None);
        }
        let Some(topic0) = log.topic0() else {
            return Ok(None);
        };
        let Some(descriptor) = self.registry.get(topic0) else {
            debug!("No descriptor for topic0 {} in tx {}", topic0, log.tx_hash);
            return Ok(None);
        };
        let Some(table) = self.router.route(&descriptor.name) else {
            debug!("Event {} has no destination table", descriptor.name);
            return Ok(None);
        };
        let Some(columns) = self.router.empty_columns(table) else {
            debug!("Table {} has no declared columns", table);
            return Ok(None);
        };

        let mut row = DecodedRow {
            table: table.to_string(),
            event_name: descriptor.name.clone(),
            block_number: log.block_number,
            tx_hash: log.tx_hash,
            log_index: log.log_index,
            columns,
        };

        let block_time = block_time.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        row.fill("block_number", Some(log.block_number.to_string()));
        row.fill(
            "block_timestamp",
            Some(block_time.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        row.fill("tx_hash", Some(hex::encode_prefixed(log.tx_hash)));
        row.fill("log_index", Some(log.log_index.to_string()));
        row.fill("address", Some(hex::encode_prefixed(log.address)));
        row.fill("event_name", Some(descriptor.name.clone()));
        row.fill("chain", Some(self.chain.clone()));

        for (column, value) in decode_params(descriptor, log)? {
            row.fill(&column, value);
        }

        self.tokens.annotate(&mut row, &log.address);

        Ok(Some(row))
    }
}

/// Decode every parameter of `descriptor` from `log`, in declaration order.
pub fn decode_params(
    descriptor: &EventDescriptor,
    log: &RawLog,
) -> Result<Vec<(String, Option<String>)>, DecodeError> {
    let mut out = Vec::with_capacity(descriptor.params.len());

    // Indexed parameters come from topics[1..]; a short topic list leaves the rest absent
    let mut topics = log.topics.iter().skip(1);
    for param in descriptor.indexed() {
        let value = match topics.next() {
            None => None,
            Some(topic) if !param.kind.is_hashed_when_indexed() => {
                let decoded =
                    param
                        .ty
                        .abi_decode(topic.as_slice())
                        .map_err(|e| DecodeError::InvalidTopic {
                            event: descriptor.name.clone(),
                            param: param.name.clone(),
                            reason: e.to_string(),
                        })?;
                Some(canonical_text(&decoded))
            }
            // Hashed reference type, the topic is opaque
            Some(topic) => Some(hex::encode_prefixed(topic)),
        };
        out.push((param.column.clone(), value));
    }

    let data_params: Vec<_> = descriptor.non_indexed().collect();
    if !data_params.is_empty() {
        let tuple = DynSolType::Tuple(data_params.iter().map(|p| p.ty.clone()).collect());
        let decoded =
            tuple
                .abi_decode_params(&log.data)
                .map_err(|e| DecodeError::InvalidData {
                    event: descriptor.name.clone(),
                    reason: e.to_string(),
                })?;
        let values = match decoded {
            DynSolValue::Tuple(values) => values,
            other => vec![other],
        };
        for (param, value) in data_params.iter().zip(values.iter()) {
            out.push((param.column.clone(), Some(canonical_text(value))));
        }
    }

    Ok(out)
}
