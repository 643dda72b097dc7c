//! Chain head listener
//!
//! Follows the chain head on a fixed cadence, imports each new head block
//! and schedules repairs: missing ancestors go to the error queue, and a
//! parent-hash mismatch sends the parent to the unverified queue.

use crate::cache::Cache;
use crate::chain::ChainClient;
use crate::error::ImportError;
use crate::importer::Importer;
use crate::metrics::Metrics;
use crate::records::BlockRecord;
use crate::store::Store;
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Follows the chain head.
pub struct Listener {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
    importer: Arc<Importer>,
    metrics: Arc<Metrics>,
    interval: Duration,
    ancestor_window: u64,
    mirror_blocks: bool,
    last_head: Option<u64>,
}

impl Listener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        importer: Arc<Importer>,
        metrics: Arc<Metrics>,
        interval: Duration,
        ancestor_window: u64,
        mirror_blocks: bool,
    ) -> Self {
        Self {
            chain,
            store,
            cache,
            importer,
            metrics,
            interval,
            ancestor_window,
            mirror_blocks,
            last_head: None,
        }
    }

    /// Run one listener step.
    ///
    /// A failed fetch leaves the head unprocessed so the next tick retries
    /// it; nothing is queued for it.
    pub async fn tick(&mut self) -> Result<()> {
        let started = Instant::now();
        let latest = self.chain.latest_height().await?;
        self.metrics.set_latest_height(latest);
        if self.last_head == Some(latest) {
            return Ok(());
        }

        let Some(block) = self.chain.block_by_height(latest).await? else {
            warn!(height = latest, "Head block not available yet");
            return Ok(());
        };

        match self.importer.import_block(&block, self.mirror_blocks).await {
            Ok(()) => {}
            Err(ImportError::AlreadyExists(height)) => debug!(height, "Head already imported"),
            Err(e) => return Err(e.into()),
        }

        self.check_parent(&block)?;
        let queued = self.queue_missing_ancestors(latest)?;
        if queued > 0 {
            info!(height = latest, queued, "Queued missing ancestors for backfill");
        }
        self.last_head = Some(latest);

        match self.cache.error_queue_len() {
            Ok(len) => self.metrics.set_todo_length(len),
            Err(e) => warn!("Failed to read error queue length: {:#}", e),
        }
        self.metrics.record_scraping(started.elapsed());
        Ok(())
    }

    /// Flag the parent for verification when its stored hash is not the
    /// new block's parent hash.
    fn check_parent(&self, block: &BlockRecord) -> Result<()> {
        let Some(parent_height) = block.height.checked_sub(1) else {
            return Ok(());
        };
        let Some(parent) = self.store.get_block(parent_height)? else {
            return Ok(());
        };
        if parent.hash == block.parent_hash {
            return Ok(());
        }

        warn!(
            height = parent_height,
            stored = %parent.hash,
            expected = %block.parent_hash,
            "Reorg detected"
        );
        self.metrics.incr_reorg_count();
        if let Err(e) = self.cache.push_unverified_height(parent_height) {
            warn!(height = parent_height, "Failed to queue reorged block: {:#}", e);
        }
        Ok(())
    }

    /// Push every ancestor in the window that is neither stored nor
    /// skipped onto the error queue. Returns how many were newly queued.
    fn queue_missing_ancestors(&self, height: u64) -> Result<usize> {
        let floor = height.saturating_sub(self.ancestor_window).max(1);
        let mut queued = 0;
        for ancestor in (floor..height).rev() {
            if self.store.block_exists(ancestor)? {
                continue;
            }
            match self.cache.is_skipped(ancestor) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(height = ancestor, "Failed to read skip list: {:#}", e);
                    continue;
                }
            }
            match self.cache.push_error_height(ancestor) {
                Ok(true) => queued += 1,
                Ok(false) => {}
                Err(e) => warn!(height = ancestor, "Failed to queue missing block: {:#}", e),
            }
        }
        Ok(queued)
    }

    /// Run until cancelled. The tick in progress always completes.
    #[instrument(skip(self, cancel), name = "listener")]
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(interval = ?self.interval, window = self.ancestor_window, "Listener started");
        loop {
            if let Err(e) = self.tick().await {
                warn!("Listener tick failed: {:#}", e);
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Listener received cancellation signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Listener stopped");
    }
}
