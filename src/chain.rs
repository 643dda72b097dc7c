//! Chain access
//!
//! [`ChainClient`] is the seam every worker reads the chain through.
//! [`RpcChainClient`] implements it over JSON-RPC with a round-robin pool
//! of load-balanced endpoints plus one trusted endpoint used for
//! verification.

use crate::records::{BlockRecord, LogRecord, TransactionRecord};
use crate::retry::RetryPolicy;
use crate::rpc::RpcClient;
use alloy_primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Stream of logs produced by a subscription.
///
/// The stream ends after yielding an error; callers re-subscribe.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogRecord>> + Send>>;

/// Log subscription filter. The default matches every log from the
/// current head onwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    /// Emitting contracts, empty for all
    pub addresses: Vec<Address>,
    /// Accepted topic0 values, empty for all
    pub topics: Vec<B256>,
    /// First height to deliver, None for the current head
    pub from_height: Option<u64>,
}

/// Read and subscribe access to the chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current head height.
    async fn latest_height(&self) -> Result<u64>;

    /// Block with transactions and receipts, via the load-balanced path.
    async fn block_by_height(&self, height: u64) -> Result<Option<BlockRecord>>;

    /// Block with transactions and receipts, via the trusted node.
    async fn block_by_height_canonical(&self, height: u64) -> Result<Option<BlockRecord>>;

    /// Latest balance of an address, in hydro.
    async fn balance(&self, address: Address) -> Result<U256>;

    /// Latest code at an address, empty for accounts.
    async fn code(&self, address: Address) -> Result<Vec<u8>>;

    /// Look up a transaction by hash.
    async fn transaction(&self, hash: B256) -> Result<Option<TransactionRecord>>;

    /// Open a live log subscription.
    async fn subscribe_logs(&self, filter: LogFilter) -> Result<LogStream>;
}

/// JSON-RPC implementation of [`ChainClient`].
pub struct RpcChainClient {
    endpoints: Vec<RpcClient>,
    canonical: RpcClient,
    next: AtomicUsize,
    retry: RetryPolicy,
    log_poll_interval: Duration,
    log_range: u64,
}

impl RpcChainClient {
    /// Create a client over the given load-balanced endpoints and trusted endpoint.
    pub fn new(endpoints: Vec<String>, canonical: String, retry: RetryPolicy) -> Result<Self> {
        if endpoints.is_empty() {
            anyhow::bail!("At least one RPC endpoint is required");
        }
        Ok(Self {
            endpoints: endpoints.into_iter().map(RpcClient::new).collect(),
            canonical: RpcClient::new(canonical),
            next: AtomicUsize::new(0),
            retry,
            log_poll_interval: Duration::from_secs(2),
            log_range: 100,
        })
    }

    /// Set how often the log subscription polls for new blocks.
    pub fn with_log_poll_interval(mut self, interval: Duration) -> Self {
        self.log_poll_interval = interval;
        self
    }

    /// Next endpoint in round-robin order.
    fn pick(&self) -> &RpcClient {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        &self.endpoints[index]
    }

    /// Fetch a block and the receipts of all its transactions from one endpoint.
    async fn fetch_block(client: &RpcClient, height: u64) -> Result<Option<BlockRecord>> {
        let Some(block) = client.get_block_by_number(height).await? else {
            return Ok(None);
        };

        let receipts = futures::future::try_join_all(
            block
                .transactions
                .iter()
                .map(|tx| client.get_transaction_receipt(tx.hash)),
        )
        .await
        .with_context(|| format!("Failed to fetch receipts of block {}", height))?;

        let receipts = receipts.into_iter().flatten().collect();
        Ok(Some(block.into_record(receipts)))
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn latest_height(&self) -> Result<u64> {
        let client = self.pick();
        self.retry
            .retry("eth_blockNumber", || client.get_block_number())
            .await
    }

    async fn block_by_height(&self, height: u64) -> Result<Option<BlockRecord>> {
        let client = self.pick();
        self.retry
            .retry("eth_getBlockByNumber", || Self::fetch_block(client, height))
            .await
    }

    async fn block_by_height_canonical(&self, height: u64) -> Result<Option<BlockRecord>> {
        let client = &self.canonical;
        self.retry
            .retry("eth_getBlockByNumber(canonical)", || Self::fetch_block(client, height))
            .await
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        let client = self.pick();
        self.retry
            .retry("eth_getBalance", || client.get_balance(address))
            .await
    }

    async fn code(&self, address: Address) -> Result<Vec<u8>> {
        let client = self.pick();
        self.retry.retry("eth_getCode", || client.get_code(address)).await
    }

    async fn transaction(&self, hash: B256) -> Result<Option<TransactionRecord>> {
        let client = self.pick();
        let tx = self
            .retry
            .retry("eth_getTransactionByHash", || client.get_transaction_by_hash(hash))
            .await?;
        Ok(tx.map(|tx| {
            let height = tx.block_number.unwrap_or(0);
            let position = tx.transaction_index.unwrap_or(0);
            tx.into_record(height, B256::ZERO, position, 0)
        }))
    }

    async fn subscribe_logs(&self, filter: LogFilter) -> Result<LogStream> {
        let client = self.pick().clone();
        let from = match filter.from_height {
            Some(height) => height,
            None => client.get_block_number().await?,
        };
        debug!(endpoint = client.url(), from, "Opening log subscription");

        let state = LogPoller {
            client,
            filter,
            next: from,
            buffer: VecDeque::new(),
            interval: self.log_poll_interval,
            range: self.log_range,
            failed: false,
        };
        Ok(Box::pin(stream::unfold(state, LogPoller::next_log)))
    }
}

/// Log subscription over HTTP: polls `eth_getLogs` over consecutive
/// block ranges.
struct LogPoller {
    client: RpcClient,
    filter: LogFilter,
    next: u64,
    buffer: VecDeque<LogRecord>,
    interval: Duration,
    range: u64,
    failed: bool,
}

impl LogPoller {
    async fn next_log(mut self) -> Option<(Result<LogRecord>, Self)> {
        loop {
            if let Some(log) = self.buffer.pop_front() {
                return Some((Ok(log), self));
            }
            if self.failed {
                return None;
            }
            match self.poll().await {
                Ok(true) => continue,
                Ok(false) => tokio::time::sleep(self.interval).await,
                Err(e) => {
                    self.failed = true;
                    return Some((Err(e), self));
                }
            }
        }
    }

    /// Fetch the next range of logs. Returns false when the head has not
    /// moved past the last polled height.
    async fn poll(&mut self) -> Result<bool> {
        let latest = self.client.get_block_number().await?;
        if latest < self.next {
            return Ok(false);
        }
        let to = latest.min(self.next + self.range - 1);
        let logs = self
            .client
            .get_logs(self.next, to, &self.filter.addresses, &self.filter.topics)
            .await?;
        self.buffer
            .extend(logs.into_iter().map(|log| log.into_record(0)));
        self.next = to + 1;
        Ok(true)
    }
}
