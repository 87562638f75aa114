use alloy_primitives::Address;
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::indexer::transformations::normalize::format_units;
use crate::models::abi::BASE_COLUMNS;
use crate::models::common::TokenConfig;
use crate::models::datasets::logs::DecodedRow;

pub const TOKEN_SYMBOL_COLUMN: &str = "token_symbol";
pub const AMOUNT_DECIMAL_COLUMN: &str = "amount_decimal";
pub const TX_FROM_COLUMN: &str = "tx_from";

/// Static event name -> destination table routing, plus the fixed column
/// schema of every destination table.
#[derive(Debug, Clone, Default)]
pub struct TableRouter {
    event_tables: BTreeMap<String, String>,
    schemas: IndexMap<String, Vec<String>>,
}

impl TableRouter {
    /// `tables` lists the event-specific columns; the base columns are prepended.
    pub fn new(
        event_tables: BTreeMap<String, String>,
        tables: &IndexMap<String, Vec<String>>,
    ) -> Self {
        let schemas = tables
            .iter()
            .map(|(table, columns)| {
                let mut schema: Vec<String> = BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
                for column in columns {
                    if !schema.contains(column) {
                        schema.push(column.clone());
                    }
                }
                (table.clone(), schema)
            })
            .collect();

        TableRouter {
            event_tables,
            schemas,
        }
    }

    pub fn route(&self, event_name: &str) -> Option<&str> {
        // Config loaders may hand keys over lowercased
        self.event_tables
            .get(event_name)
            .or_else(|| self.event_tables.get(&event_name.to_lowercase()))
            .map(String::as_str)
    }

    pub fn schema(&self, table: &str) -> Option<&[String]> {
        self.schemas.get(table).map(Vec::as_slice)
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Every declared column mapped to the absence marker
    pub fn empty_columns(&self, table: &str) -> Option<IndexMap<String, Option<String>>> {
        self.schema(table)
            .map(|columns| columns.iter().map(|c| (c.clone(), None)).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub symbol: String,
    pub decimals: u8,
}

/// Immutable token metadata keyed by contract address, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct TokenCatalog {
    tokens: HashMap<Address, TokenInfo>,
}

impl TokenCatalog {
    pub fn from_config(tokens: &BTreeMap<String, TokenConfig>) -> Self {
        let tokens = tokens
            .iter()
            .filter_map(|(address, token)| match address.parse::<Address>() {
                Ok(parsed) => Some((
                    parsed,
                    TokenInfo {
                        symbol: token.symbol.clone(),
                        decimals: token.decimals,
                    },
                )),
                Err(e) => {
                    warn!("Ignoring token entry {}: {}", address, e);
                    None
                }
            })
            .collect();
        TokenCatalog { tokens }
    }

    pub fn get(&self, address: &Address) -> Option<&TokenInfo> {
        self.tokens.get(address)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Fill `token_symbol` and `amount_decimal` where the table declares them.
    pub fn annotate(&self, row: &mut DecodedRow, emitter: &Address) {
        let Some(token) = self.get(emitter) else {
            return;
        };

        row.fill(TOKEN_SYMBOL_COLUMN, Some(token.symbol.clone()));

        let raw_amount = row
            .get("value")
            .or_else(|| row.get("amount"))
            .map(str::to_string);
        if let Some(raw) = raw_amount {
            row.fill(AMOUNT_DECIMAL_COLUMN, format_units(&raw, token.decimals));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;

    fn router() -> TableRouter {
        let mut event_tables = BTreeMap::new();
        event_tables.insert("Transfer".to_string(), "erc20_events".to_string());
        let mut tables = IndexMap::new();
        tables.insert(
            "erc20_events".to_string(),
            vec![
                "from".to_string(),
                "to".to_string(),
                "value".to_string(),
                "block_number".to_string(),
                TOKEN_SYMBOL_COLUMN.to_string(),
                AMOUNT_DECIMAL_COLUMN.to_string(),
            ],
        );
        TableRouter::new(event_tables, &tables)
    }

    #[test]
    fn schema_starts_with_base_columns_without_duplicates() {
        let router = router();
        let schema = router.schema("erc20_events").unwrap();
        assert_eq!(&schema[..BASE_COLUMNS.len()], BASE_COLUMNS.as_slice());
        assert_eq!(schema.len(), BASE_COLUMNS.len() + 5);
        assert_eq!(router.route("Transfer"), Some("erc20_events"));
        assert_eq!(router.route("Swap"), None);
        assert!(schema.iter().any(|c| c == "value"));
    }

    #[test]
    fn annotates_known_tokens_only() {
        let router = router();
        let usdc: Address = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".parse().unwrap();
        let mut config = BTreeMap::new();
        config.insert(
            "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".to_string(),
            TokenConfig {
                symbol: "USDC".to_string(),
                decimals: 6,
            },
        );
        config.insert(
            "not-an-address".to_string(),
            TokenConfig {
                symbol: "BAD".to_string(),
                decimals: 0,
            },
        );
        let catalog = TokenCatalog::from_config(&config);
        assert_eq!(catalog.len(), 1);

        let mut row = DecodedRow {
            table: "erc20_events".to_string(),
            event_name: "Transfer".to_string(),
            block_number: 1,
            tx_hash: B256::ZERO,
            log_index: 0,
            columns: router.empty_columns("erc20_events").unwrap(),
        };
        row.fill("value", Some("2500000".to_string()));

        let mut unknown = row.clone();
        catalog.annotate(&mut unknown, &Address::ZERO);
        assert_eq!(unknown.get(TOKEN_SYMBOL_COLUMN), None);

        catalog.annotate(&mut row, &usdc);
        assert_eq!(row.get(TOKEN_SYMBOL_COLUMN), Some("USDC"));
        assert_eq!(row.get(AMOUNT_DECIMAL_COLUMN), Some("2.5"));
    }
}
