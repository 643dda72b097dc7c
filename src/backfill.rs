//! Error-queue backfill worker
//!
//! Drains heights that failed to import, retries them, and escalates
//! heights that keep failing to the skip list. Successful backfills are
//! handed to the verifier through the unverified queue.

use crate::cache::Cache;
use crate::chain::ChainClient;
use crate::importer::Importer;
use crate::metrics::Metrics;
use crate::retry::RetryPolicy;
use crate::store::Store;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Backfill worker cadence and thresholds.
#[derive(Debug, Clone, Copy)]
pub struct BackfillSettings {
    pub interval: Duration,
    pub batch_size: usize,
    /// Consecutive failures of one height before it is skipped
    pub skip_threshold: u32,
    pub max_backoff: Duration,
}

/// Drains the error queue.
pub struct BackfillWorker {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
    importer: Arc<Importer>,
    metrics: Arc<Metrics>,
    settings: BackfillSettings,
    /// Consecutive failures per height, cleared on success or skip
    failures: HashMap<u64, u32>,
}

impl BackfillWorker {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        importer: Arc<Importer>,
        metrics: Arc<Metrics>,
        settings: BackfillSettings,
    ) -> Self {
        Self {
            chain,
            store,
            cache,
            importer,
            metrics,
            settings,
            failures: HashMap::new(),
        }
    }

    /// Drain up to `batch_size` heights. Returns the number imported.
    ///
    /// The tick ends at the first failing height, which is put back at the
    /// front of the queue together with its missing neighbours. The failure
    /// that reaches `skip_threshold` moves the height to the skip list
    /// instead.
    pub async fn tick(&mut self) -> Result<usize> {
        let mut imported = 0;
        for _ in 0..self.settings.batch_size {
            let Some(height) = self.cache.pop_error_height()? else {
                break;
            };

            if self.cache.is_skipped(height)? {
                debug!(height, "Dropping skipped height");
                continue;
            }

            match self.backfill_height(height).await {
                Ok(()) => {
                    self.failures.remove(&height);
                    imported += 1;
                    if let Err(e) = self.cache.push_unverified_height(height) {
                        warn!(height, "Failed to queue block for verification: {:#}", e);
                    }
                }
                Err(e) => {
                    self.record_failure(height);
                    return Err(e);
                }
            }
        }

        if imported > 0 {
            info!(imported, "Backfilled blocks");
        }
        if let Ok(len) = self.cache.error_queue_len() {
            self.metrics.set_todo_length(len);
        }
        Ok(imported)
    }

    async fn backfill_height(&self, height: u64) -> Result<()> {
        let block = self
            .chain
            .block_by_height(height)
            .await
            .with_context(|| format!("Failed to fetch block {}", height))?
            .with_context(|| format!("Block {} not available", height))?;
        self.importer
            .upsert_block(&block)
            .await
            .with_context(|| format!("Failed to import block {}", height))
    }

    /// Count a failure of `height`, then skip it or put it back at the
    /// front of the queue.
    fn record_failure(&mut self, height: u64) {
        self.queue_neighbours(height);

        let failures = self.failures.entry(height).or_insert(0);
        *failures += 1;
        if *failures < self.settings.skip_threshold {
            if let Err(e) = self.cache.push_error_height(height) {
                warn!(height, "Failed to requeue block: {:#}", e);
            }
            return;
        }

        warn!(height, failures = *failures, "Moving block to skip list");
        self.failures.remove(&height);
        if let Err(e) = self.cache.push_skip_height(height) {
            warn!(height, "Failed to skip block, requeueing: {:#}", e);
            if let Err(e) = self.cache.push_error_height(height) {
                warn!(height, "Failed to requeue block: {:#}", e);
            }
        }
    }

    /// Highest height worth probing: the listener's head, or the highest
    /// stored block before the listener has seen one.
    fn probe_ceiling(&self) -> u64 {
        match self.metrics.latest_height() {
            0 => match self.store.latest_block_height() {
                Ok(height) => height.unwrap_or(0),
                Err(e) => {
                    warn!("Failed to read latest stored height: {:#}", e);
                    0
                }
            },
            head => head,
        }
    }

    /// Queue the missing, unskipped neighbours of a failed height.
    fn queue_neighbours(&self, height: u64) {
        let head = self.probe_ceiling();
        for neighbour in [height.checked_add(1), height.checked_sub(1)].into_iter().flatten() {
            if neighbour == 0 || neighbour > head {
                continue;
            }
            match self.should_probe(neighbour) {
                Ok(true) => {
                    if let Err(e) = self.cache.push_error_height(neighbour) {
                        warn!(height = neighbour, "Failed to queue neighbour: {:#}", e);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(height = neighbour, "Failed to probe neighbour: {:#}", e),
            }
        }
    }

    fn should_probe(&self, height: u64) -> Result<bool> {
        Ok(!self.store.block_exists(height)? && !self.cache.is_skipped(height)?)
    }

    /// Run until cancelled. Consecutive failing ticks back off up to
    /// `max_backoff`.
    #[instrument(skip(self, cancel), name = "backfill")]
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            interval = ?self.settings.interval,
            batch = self.settings.batch_size,
            threshold = self.settings.skip_threshold,
            "Backfill worker started"
        );
        let backoff = RetryPolicy {
            max_attempts: u32::MAX,
            base_delay: self.settings.interval,
            max_delay: self.settings.max_backoff.max(self.settings.interval),
        };
        let mut failing_ticks = 0;

        loop {
            match self.tick().await {
                Ok(_) => failing_ticks = 0,
                Err(e) => {
                    failing_ticks += 1;
                    warn!(failing_ticks, "Backfill tick failed: {:#}", e);
                }
            }

            let delay = if failing_ticks == 0 {
                self.settings.interval
            } else {
                backoff.delay_for(failing_ticks)
            };

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Backfill worker received cancellation signal");
                    break;
                }

                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("Backfill worker stopped");
    }
}
