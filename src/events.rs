//! Event processor
//!
//! Consumes the live log subscription. Each log is stamped with the time of
//! its block, decoded against the emitting contract's ABI when one can be
//! resolved, persisted, and handed to the topic handlers.
//!
//! Every subscription starts at an explicit height. A subscription without
//! one is pinned to the head at the time it opens, and a re-subscription
//! resumes right after the last height a log was processed from.

use crate::abi::{decode_log, AbiResolver};
use crate::cache::Cache;
use crate::chain::{ChainClient, LogFilter, LogStream};
use crate::error::AbiError;
use crate::metrics::Metrics;
use crate::records::LogRecord;
use crate::retry::RetryPolicy;
use crate::store::Store;
use crate::tracker::HandlerRegistry;
use anyhow::{Context, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// How a subscription ended.
#[derive(Debug)]
enum StreamEnd {
    Cancelled,
    Closed { processed: usize },
    Failed { processed: usize, error: anyhow::Error },
}

/// Decodes and persists subscribed logs.
pub struct EventProcessor {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
    resolver: AbiResolver,
    registry: HandlerRegistry,
    metrics: Arc<Metrics>,
    filter: LogFilter,
    backoff: RetryPolicy,
}

impl EventProcessor {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        registry: HandlerRegistry,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            resolver: AbiResolver::new(store.clone(), cache.clone()),
            chain,
            store,
            cache,
            registry,
            metrics,
            filter: LogFilter::default(),
            backoff: RetryPolicy {
                max_attempts: u32::MAX,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
            },
        }
    }

    pub fn with_filter(mut self, filter: LogFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Delay schedule between re-subscriptions.
    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Timestamp of the block holding the log's transaction, 0 when the
    /// transaction or its block cannot be found.
    async fn log_timestamp(&self, log: &LogRecord) -> Result<u64> {
        if log.timestamp != 0 {
            return Ok(log.timestamp);
        }
        let Some(tx) = self
            .chain
            .transaction(log.tx_hash)
            .await
            .with_context(|| format!("Failed to fetch transaction {}", log.tx_hash))?
        else {
            debug!(tx = %log.tx_hash, "Transaction of log not found");
            return Ok(0);
        };

        if let Some(block) = self.store.get_block(tx.block_height)? {
            return Ok(block.timestamp);
        }
        match self.cache.mirrored_block(tx.block_height) {
            Ok(Some(block)) => return Ok(block.timestamp),
            Ok(None) => {}
            Err(e) => warn!(height = tx.block_height, "Failed to read mirrored block: {:#}", e),
        }
        Ok(tx.timestamp)
    }

    /// Enrich, decode, persist and dispatch one log. Returns the stored
    /// record.
    ///
    /// A log whose ABI cannot be resolved or decoded is stored undecoded.
    pub async fn process_log(&self, mut log: LogRecord) -> Result<LogRecord> {
        let started = Instant::now();
        log.timestamp = match self.log_timestamp(&log).await {
            Ok(timestamp) => timestamp,
            Err(e) => {
                warn!(tx = %log.tx_hash, "Failed to enrich log timestamp: {:#}", e);
                0
            }
        };

        log.decoded = match self
            .resolver
            .resolve(log.address)
            .and_then(|abi| decode_log(&abi, &log))
        {
            Ok(event) => Some(event),
            Err(AbiError::NotFound(address)) => {
                debug!(%address, "No ABI for log emitter");
                None
            }
            Err(e) => {
                warn!(
                    address = %log.address,
                    tx = %log.tx_hash,
                    log_index = log.log_index,
                    "Failed to decode log: {}",
                    e
                );
                None
            }
        };

        self.store
            .insert_logs(std::slice::from_ref(&log))
            .with_context(|| format!("Failed to store log {}:{}", log.tx_hash, log.log_index))?;

        if let Some(event) = &log.decoded {
            let handled = self.registry.dispatch(&log, event);
            debug!(event = %event.name, handled, "Dispatched log");
        }
        self.metrics.record_indexing(started.elapsed());
        Ok(log)
    }

    /// Open a subscription at `from_height`, or at the current head when
    /// none is given. Returns the height the subscription starts at.
    async fn open_stream(&self, from_height: Option<u64>) -> Result<(u64, LogStream)> {
        let from = match from_height {
            Some(height) => height,
            None => self
                .chain
                .latest_height()
                .await
                .context("Failed to read head for log subscription")?,
        };
        let filter = LogFilter {
            from_height: Some(from),
            ..self.filter.clone()
        };
        let stream = self.chain.subscribe_logs(filter).await?;
        Ok((from, stream))
    }

    /// Process logs until the stream ends, advancing `resume_from` past
    /// the height of every processed log.
    async fn consume(
        &self,
        mut stream: LogStream,
        cancel: &CancellationToken,
        resume_from: &mut Option<u64>,
    ) -> StreamEnd {
        let mut processed = 0;
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return StreamEnd::Cancelled,

                item = stream.next() => match item {
                    Some(Ok(log)) => {
                        let next = log.block_height + 1;
                        if let Err(e) = self.process_log(log).await {
                            warn!("Failed to process log: {:#}", e);
                        }
                        processed += 1;
                        *resume_from = Some(resume_from.map_or(next, |from| from.max(next)));
                    }
                    Some(Err(error)) => return StreamEnd::Failed { processed, error },
                    None => return StreamEnd::Closed { processed },
                },
            }
        }
    }

    /// Run until cancelled, re-subscribing whenever the stream ends.
    #[instrument(skip(self, cancel), name = "events")]
    pub async fn run(self, cancel: CancellationToken) {
        info!(handlers = self.registry.len(), "Event processor started");
        let mut failures = 0;
        let mut resume_from = self.filter.from_height;

        loop {
            let outcome = tokio::select! {
                biased;

                _ = cancel.cancelled() => StreamEnd::Cancelled,

                opened = self.open_stream(resume_from) => match opened {
                    Ok((from, stream)) => {
                        debug!(from, "Log subscription opened");
                        resume_from = Some(from);
                        self.consume(stream, &cancel, &mut resume_from).await
                    }
                    Err(error) => StreamEnd::Failed { processed: 0, error },
                },
            };

            match outcome {
                StreamEnd::Cancelled => break,
                StreamEnd::Closed { processed } => {
                    debug!(processed, "Log subscription closed");
                    failures = if processed > 0 { 1 } else { failures + 1 };
                }
                StreamEnd::Failed { processed, error } => {
                    warn!(processed, "Log subscription failed: {:#}", error);
                    failures = if processed > 0 { 1 } else { failures + 1 };
                }
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = tokio::time::sleep(self.backoff.delay_for(failures)) => {}
            }
        }
        info!("Event processor stopped");
    }
}
