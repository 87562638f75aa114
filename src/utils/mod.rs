pub mod rate_limiter;
pub mod retry;

use anyhow::{Context, Result};
use config::{Config as ConfigLoader, Environment, File, FileFormat};
use std::path::Path;
use tracing::info;

use crate::models::common::Config;

pub const CONFIG_PATH_ENV: &str = "INDEXER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

pub fn hex_to_u64(hex: &str) -> Option<u64> {
    u64::from_str_radix(hex.trim().trim_start_matches("0x"), 16).ok()
}

pub fn u64_to_hex(value: u64) -> String {
    format!("{value:#x}")
}

/// Resolve the config path from `INDEXER_CONFIG`, falling back to `config.yml`.
pub fn config_path() -> String {
    std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
}

pub fn load_config<P: AsRef<Path>>(file_name: P) -> Result<Config> {
    let config_path = file_name.as_ref();
    info!("Config path: {}", config_path.to_string_lossy());

    // YAML file first, then INDEXER__* environment overrides
    let settings = ConfigLoader::builder()
        .add_source(File::from(config_path).format(FileFormat::Yaml))
        .add_source(
            Environment::with_prefix("INDEXER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to read config file")?;

    let mut config: Config = settings
        .try_deserialize()
        .context("failed to parse config YAML")?;

    // Convert hyphens to underscores so the chain name is usable as a dataset id
    config.chain_name = config.chain_name.replace('-', "_");

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.topics.is_empty() {
        anyhow::bail!("No topics configured; at least one topic is required");
    }
    if config.contracts.is_empty() {
        anyhow::bail!("No contracts configured; at least one contract is required");
    }
    if config.window_size == 0 {
        anyhow::bail!("window_size must be greater than zero");
    }
    if config.header_batch_size == 0 {
        anyhow::bail!("header_batch_size must be greater than zero");
    }
    if let (Some(start), Some(end)) = (config.start_block, config.end_block) {
        if start > end {
            anyhow::bail!("start_block {} is after end_block {}", start, end);
        }
    }
    for (event, table) in &config.event_tables {
        if !config.tables.contains_key(table) {
            anyhow::bail!(
                "Event {} routes to table {} which has no column list",
                event,
                table
            );
        }
    }
    Ok(())
}

/// `sqrtPriceX96` -> `sqrt_price_x96`, `tokenID` -> `token_id`, `_from` -> `from`.
pub fn to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.trim_start_matches('_').chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_ascii_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_ascii_uppercase() => next.is_some_and(|n| n.is_ascii_lowercase()),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }

    out
}

pub fn strip_html(error: &str) -> String {
    // If the error contains HTML tags, extract just the text content
    if error.contains("<!doctype html>") || error.contains("<html>") {
        error
            .lines()
            .map(|line| line.trim())
            .find(|line| {
                !line.starts_with('<')
                    && !line.ends_with('>')
                    && !line.is_empty()
                    && *line != "html"
                    && *line != "body"
            })
            .unwrap_or(error)
            .to_string()
    } else {
        error.to_string()
    }
}
