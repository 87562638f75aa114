pub mod blocks;
pub mod logs;
pub mod receipts;

#[cfg(test)]
pub(crate) mod mock;

use alloy_network::AnyNetwork;
use alloy_primitives::{Address, B256};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_client::RpcClient;
use alloy_rpc_types_eth::Filter;
use alloy_transport::{TransportError, TransportErrorKind};
use async_trait::async_trait;
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;
use url::Url;

use crate::metrics::Metrics;
use crate::models::common::Window;
use crate::models::datasets::blocks::{BlockHeader, RpcBlockHeader};
use crate::models::datasets::logs::{RawLog, RpcReceiptData};
use crate::models::errors::{FetchError, RpcError};
use crate::utils::rate_limiter::RateLimiter;
use crate::utils::retry::{RetryConfig, retry};
use crate::utils::{strip_html, u64_to_hex};

/// Result of one remote unit of work once transient failures are retried away.
/// `TooLarge` is a signal for the caller to split, not an error.
#[derive(Debug)]
pub enum FetchOutcome<T> {
    Ok(T),
    TooLarge,
    Fatal(anyhow::Error),
}

/// The upstream node surface the pipeline depends on.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn latest_block_number(&self) -> Result<u64, RpcError>;

    async fn get_logs(
        &self,
        address: Address,
        topic0: B256,
        window: Window,
    ) -> Result<Vec<RawLog>, RpcError>;

    /// Headers for `numbers`. Blocks the node does not know are left out.
    async fn get_block_headers(&self, numbers: &[u64]) -> Result<Vec<BlockHeader>, RpcError>;

    async fn get_transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> Result<Option<RpcReceiptData>, RpcError>;
}

/// Run a remote call with the retry budget and fold the result into a `FetchOutcome`.
pub async fn fetch_with_retry<F, Fut, T>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> FetchOutcome<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    match retry(operation, config, context).await {
        Ok(value) => FetchOutcome::Ok(value),
        Err(RpcError::TooLarge) => FetchOutcome::TooLarge,
        Err(RpcError::Transient(reason)) => FetchOutcome::Fatal(
            FetchError::RetriesExhausted {
                context: context.to_string(),
                attempts: config.max_attempts,
                reason,
            }
            .into(),
        ),
        Err(RpcError::Fatal(reason)) => FetchOutcome::Fatal(
            FetchError::Rpc {
                context: context.to_string(),
                reason,
            }
            .into(),
        ),
    }
}

const OVERSIZE_PATTERNS: [&str; 7] = [
    "too large",
    "response size",
    "too many results",
    "query returned more than",
    "limited to",
    "payload too",
    "response is too big",
];

/// Whether an upstream error message describes an oversized query or response.
pub fn is_oversize_message(message: &str) -> bool {
    let message = message.to_lowercase();
    if OVERSIZE_PATTERNS.iter().any(|p| message.contains(p)) {
        return true;
    }
    message.contains("exceed")
        && ["limit", "size", "range"]
            .iter()
            .any(|p| message.contains(p))
}

/// Map an alloy transport error onto the three outcomes the pipeline cares about.
pub fn classify(error: &TransportError) -> RpcError {
    match error {
        TransportError::Transport(TransportErrorKind::HttpError(http)) => {
            let body = strip_html(&http.body);
            match http.status {
                413 => RpcError::TooLarge,
                408 | 429 => RpcError::Transient(format!("HTTP {}: {}", http.status, body)),
                status if status >= 500 => {
                    if is_oversize_message(&body) {
                        RpcError::TooLarge
                    } else {
                        RpcError::Transient(format!("HTTP {}: {}", status, body))
                    }
                }
                status => RpcError::Fatal(format!("HTTP {}: {}", status, body)),
            }
        }
        TransportError::Transport(kind) => RpcError::Transient(kind.to_string()),
        TransportError::ErrorResp(payload) => {
            if is_oversize_message(&payload.message) {
                RpcError::TooLarge
            } else if payload.code == 429
                || payload.code == -32005
                || payload.message.to_lowercase().contains("rate limit")
            {
                RpcError::Transient(format!("{} ({})", payload.message, payload.code))
            } else {
                RpcError::Fatal(format!("{} ({})", payload.message, payload.code))
            }
        }
        TransportError::NullResp => RpcError::Transient("null response".to_string()),
        other => RpcError::Fatal(strip_html(&other.to_string())),
    }
}

/// `ChainClient` over JSON-RPC/HTTP. Every call waits on the shared pacer and is
/// bounded by the per-call timeout.
pub struct AlloyChainClient {
    client: RpcClient,
    provider: RootProvider<AnyNetwork>,
    limiter: RateLimiter,
    call_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl AlloyChainClient {
    pub fn new(
        rpc_url: Url,
        rate_limit_per_second: f64,
        call_timeout: Duration,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let client = RpcClient::new_http(rpc_url);
        let provider = RootProvider::<AnyNetwork>::new(client.clone());

        Self {
            client,
            provider,
            limiter: RateLimiter::new(rate_limit_per_second),
            call_timeout,
            metrics,
        }
    }

    async fn call<T, Fut>(&self, method: &'static str, request: Fut) -> Result<T, RpcError>
    where
        Fut: IntoFuture<Output = Result<T, TransportError>>,
    {
        self.limiter.acquire().await;
        let start = Instant::now();

        let result = match tokio::time::timeout(self.call_timeout, request.into_future()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(&e)),
            Err(_) => Err(RpcError::Transient(format!(
                "{} timed out after {:?}",
                method, self.call_timeout
            ))),
        };

        // Record metrics if enabled
        if let Some(metrics) = &self.metrics {
            metrics.record_rpc(
                method,
                start.elapsed().as_secs_f64(),
                result.is_err(),
            );
        }

        if let Err(e) = &result {
            warn!("{} failed: {}", method, e);
        }
        result
    }

    async fn get_block_header(&self, number: u64) -> Result<Option<BlockHeader>, RpcError> {
        let raw = self
            .call(
                "eth_getBlockByNumber",
                self.client
                    .request::<_, Option<RpcBlockHeader>>(
                        "eth_getBlockByNumber",
                        (u64_to_hex(number), false),
                    ),
            )
            .await?;

        raw.map(BlockHeader::try_from)
            .transpose()
            .map_err(|e| RpcError::Fatal(e.to_string()))
    }

    async fn get_block_header_batch(&self, numbers: &[u64]) -> Result<Vec<BlockHeader>, RpcError> {
        let mut batch = self.client.new_batch();
        let mut waiters = Vec::with_capacity(numbers.len());
        for number in numbers {
            let waiter = batch
                .add_call::<_, Option<RpcBlockHeader>>(
                    "eth_getBlockByNumber",
                    &(u64_to_hex(*number), false),
                )
                .map_err(|e| RpcError::Fatal(e.to_string()))?;
            waiters.push(waiter);
        }

        self.call("eth_getBlockByNumber_batch", batch.send()).await?;

        let mut headers = Vec::with_capacity(numbers.len());
        for waiter in waiters {
            match waiter.await {
                Ok(Some(raw)) => {
                    headers.push(BlockHeader::try_from(raw).map_err(|e| RpcError::Fatal(e.to_string()))?)
                }
                Ok(None) => {}
                Err(e) => return Err(classify(&e)),
            }
        }
        Ok(headers)
    }
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    async fn latest_block_number(&self) -> Result<u64, RpcError> {
        self.call("eth_blockNumber", self.provider.get_block_number())
            .await
    }

    async fn get_logs(
        &self,
        address: Address,
        topic0: B256,
        window: Window,
    ) -> Result<Vec<RawLog>, RpcError> {
        let filter = Filter::new()
            .address(address)
            .event_signature(topic0)
            .from_block(window.from_block)
            .to_block(window.to_block);

        let logs = self
            .call("eth_getLogs", self.provider.get_logs(&filter))
            .await?;

        logs.into_iter()
            .map(|log| RawLog::try_from(log).map_err(|e| RpcError::Fatal(e.to_string())))
            .collect()
    }

    async fn get_block_headers(&self, numbers: &[u64]) -> Result<Vec<BlockHeader>, RpcError> {
        match numbers {
            [] => Ok(Vec::new()),
            // Some upstreams reject JSON-RPC batches outright
            [number] => Ok(self.get_block_header(*number).await?.into_iter().collect()),
            _ => self.get_block_header_batch(numbers).await,
        }
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> Result<Option<RpcReceiptData>, RpcError> {
        self.call(
            "eth_getTransactionReceipt",
            self.client
                .request::<_, Option<RpcReceiptData>>("eth_getTransactionReceipt", (tx_hash,)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_json_rpc::ErrorPayload;
    use alloy_transport::HttpError;
    use std::borrow::Cow;

    fn http_error(status: u16, body: &str) -> TransportError {
        TransportError::Transport(TransportErrorKind::HttpError(HttpError {
            status,
            body: body.to_string(),
        }))
    }

    fn rpc_error(code: i64, message: &'static str) -> TransportError {
        TransportError::ErrorResp(ErrorPayload {
            code,
            message: Cow::Borrowed(message),
            data: None,
        })
    }

    #[test]
    fn classifies_http_statuses() {
        assert_eq!(classify(&http_error(413, "")), RpcError::TooLarge);
        assert!(classify(&http_error(429, "slow down")).is_transient());
        assert!(classify(&http_error(503, "<html>\n<body>\nBad Gateway\n</body>\n</html>")).is_transient());
        assert!(matches!(classify(&http_error(401, "nope")), RpcError::Fatal(_)));
    }

    #[test]
    fn classifies_json_rpc_errors() {
        assert_eq!(
            classify(&rpc_error(-32005, "query returned more than 10000 results")),
            RpcError::TooLarge
        );
        assert_eq!(
            classify(&rpc_error(
                -32602,
                "Log response size exceeded. You can make eth_getLogs requests with up to a 2K block range"
            )),
            RpcError::TooLarge
        );
        assert!(classify(&rpc_error(-32005, "request rate exceeded")).is_transient());
        assert!(classify(&rpc_error(429, "Too Many Requests")).is_transient());
        assert!(matches!(
            classify(&rpc_error(-32601, "method not found")),
            RpcError::Fatal(_)
        ));
    }

    #[test]
    fn oversize_patterns() {
        assert!(is_oversize_message("Request Entity Too Large"));
        assert!(is_oversize_message("eth_getLogs is limited to a 10,000 range"));
        assert!(is_oversize_message("exceeds max results limit"));
        assert!(!is_oversize_message("execution reverted"));
    }

    #[tokio::test]
    async fn call_timeout_is_transient() {
        let client = AlloyChainClient::new(
            "http://127.0.0.1:8545".parse().unwrap(),
            1_000.0,
            Duration::from_millis(20),
            None,
        );

        let result = client
            .call(
                "eth_blockNumber",
                std::future::pending::<Result<u64, TransportError>>(),
            )
            .await;

        match result {
            Err(RpcError::Transient(message)) => {
                assert!(message.contains("eth_blockNumber timed out"), "{message}")
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_with_retry_folds_outcomes() {
        let config = RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 1,
            exponential: 2.0,
        };

        let ok = fetch_with_retry(|| async { Ok::<_, RpcError>(5) }, &config, "ok").await;
        assert!(matches!(ok, FetchOutcome::Ok(5)));

        let large =
            fetch_with_retry(|| async { Err::<u8, _>(RpcError::TooLarge) }, &config, "large").await;
        assert!(matches!(large, FetchOutcome::TooLarge));

        let exhausted = fetch_with_retry(
            || async { Err::<u8, _>(RpcError::Transient("reset".to_string())) },
            &config,
            "flaky",
        )
        .await;
        match exhausted {
            FetchOutcome::Fatal(e) => assert!(e.to_string().contains("after 2 attempts")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
