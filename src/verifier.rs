//! Block verifier
//!
//! Cross-checks stored blocks against the trusted node and repairs the
//! ones that differ.

use crate::cache::Cache;
use crate::chain::ChainClient;
use crate::error::VerifyError;
use crate::importer::{merge_receipts, Importer};
use crate::metrics::Metrics;
use crate::records::BlockRecord;
use crate::store::Store;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Field in which a stored block differed from the canonical one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mismatch {
    /// Nothing was stored at the height
    Missing,
    Hash,
    Proposer,
    TxCount,
    /// Receipt-derived transaction statuses
    Statuses,
}

/// Result of verifying one height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum VerifyOutcome {
    Matched,
    Repaired { mismatches: Vec<Mismatch> },
}

/// Compare a stored block with the canonical block at the same height.
pub fn compare_blocks(stored: &BlockRecord, canonical: &BlockRecord) -> Vec<Mismatch> {
    let mut mismatches = Vec::new();
    if stored.hash != canonical.hash {
        mismatches.push(Mismatch::Hash);
    }
    if stored.proposer != canonical.proposer {
        mismatches.push(Mismatch::Proposer);
    }
    if stored.num_txs != canonical.num_txs
        || stored.transactions.len() != canonical.transactions.len()
    {
        mismatches.push(Mismatch::TxCount);
    }

    let stored_statuses = stored.transactions.iter().map(|tx| tx.status);
    let canonical_statuses = merge_receipts(canonical).into_iter().map(|tx| tx.status);
    if !stored_statuses.eq(canonical_statuses) {
        mismatches.push(Mismatch::Statuses);
    }
    mismatches
}

/// Drains the unverified queue.
pub struct VerifierWorker {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
    importer: Arc<Importer>,
    metrics: Arc<Metrics>,
    interval: Duration,
    batch_size: usize,
}

impl VerifierWorker {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        importer: Arc<Importer>,
        metrics: Arc<Metrics>,
        interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            chain,
            store,
            cache,
            importer,
            metrics,
            interval,
            batch_size,
        }
    }

    /// Verify one height against the trusted node, repairing it on mismatch.
    ///
    /// If the trusted node cannot serve the block, the height goes back on
    /// the unverified queue.
    pub async fn verify_block(&self, height: u64) -> Result<VerifyOutcome, VerifyError> {
        let canonical = match self.chain.block_by_height_canonical(height).await {
            Ok(Some(block)) => block,
            Ok(None) => {
                self.requeue(height);
                return Err(VerifyError::CanonicalFetch {
                    height,
                    source: anyhow::anyhow!("block not found on trusted node"),
                });
            }
            Err(source) => {
                self.requeue(height);
                return Err(VerifyError::CanonicalFetch { height, source });
            }
        };

        let mismatches = match self.store.get_block(height).map_err(VerifyError::Store)? {
            Some(stored) => compare_blocks(&stored, &canonical),
            None => vec![Mismatch::Missing],
        };
        if mismatches.is_empty() {
            debug!(height, "Block matches trusted node");
            return Ok(VerifyOutcome::Matched);
        }

        warn!(height, ?mismatches, "Stored block differs from trusted node, repairing");
        self.importer
            .upsert_block(&canonical)
            .await
            .map_err(|source| VerifyError::Repair { height, source })?;
        self.metrics.incr_invalid_block_count();
        Ok(VerifyOutcome::Repaired { mismatches })
    }

    fn requeue(&self, height: u64) {
        if let Err(e) = self.cache.push_unverified_height(height) {
            warn!(height, "Failed to requeue unverified block: {:#}", e);
        }
    }

    /// Verify up to `batch_size` queued heights. Returns how many were
    /// repaired.
    ///
    /// The tick ends when the trusted node fails, since the height was just
    /// re-queued. A failed repair hands the height to the backfill worker.
    pub async fn tick(&self) -> Result<usize> {
        let mut repaired = 0;
        for _ in 0..self.batch_size {
            let Some(height) = self.cache.pop_unverified_height()? else {
                break;
            };
            match self.verify_block(height).await {
                Ok(VerifyOutcome::Matched) => {}
                Ok(VerifyOutcome::Repaired { .. }) => repaired += 1,
                Err(e @ VerifyError::CanonicalFetch { .. }) => return Err(e.into()),
                Err(e) => {
                    warn!(height, "Verification failed: {}", e);
                    if let Err(e) = self.cache.push_error_height(height) {
                        warn!(height, "Failed to queue block for backfill: {:#}", e);
                    }
                }
            }
        }
        Ok(repaired)
    }

    /// Run until cancelled.
    #[instrument(skip(self, cancel), name = "verifier")]
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval = ?self.interval, batch = self.batch_size, "Verifier started");
        loop {
            match self.tick().await {
                Ok(0) => {}
                Ok(repaired) => info!(repaired, "Repaired blocks"),
                Err(e) => warn!("Verifier tick failed: {:#}", e),
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Verifier received cancellation signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Verifier stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::{BackfillSettings, BackfillWorker};
    use crate::cache::MemoryCache;
    use crate::testutil::{
        create_store, hash_of, proposer, recipient, sample_block, FakeChain, PausingStore,
    };

    struct Harness {
        verifier: VerifierWorker,
        importer: Arc<Importer>,
        store: Arc<dyn Store>,
        cache: Arc<MemoryCache>,
        chain: Arc<FakeChain>,
        metrics: Arc<Metrics>,
        _temp: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let (store, temp) = create_store();
        let store: Arc<dyn Store> = store;
        let cache = Arc::new(MemoryCache::new());
        let chain = Arc::new(FakeChain::new());
        let metrics = Arc::new(Metrics::new());
        let importer = Arc::new(Importer::new(
            store.clone(),
            cache.clone(),
            chain.clone(),
            metrics.clone(),
        ));
        let verifier = VerifierWorker::new(
            chain.clone(),
            store.clone(),
            cache.clone(),
            importer.clone(),
            metrics.clone(),
            Duration::from_millis(10),
            5,
        );
        Harness {
            verifier,
            importer,
            store,
            cache,
            chain,
            metrics,
            _temp: temp,
        }
    }

    #[tokio::test]
    async fn test_proposer_mismatch_is_repaired() {
        let h = harness();
        h.importer.import_block(&sample_block(12, 1), false).await.unwrap();
        let mut canonical = sample_block(12, 1);
        canonical.proposer = recipient();
        h.chain.set_canonical(canonical);

        let outcome = h.verifier.verify_block(12).await.unwrap();
        assert_eq!(
            outcome,
            VerifyOutcome::Repaired {
                mismatches: vec![Mismatch::Proposer]
            }
        );
        assert_eq!(h.store.get_block(12).unwrap().unwrap().proposer, recipient());
        assert_eq!(h.metrics.snapshot().invalid_block_count, 1);
    }

    #[tokio::test]
    async fn test_matching_block_is_untouched() {
        let h = harness();
        let block = sample_block(13, 2);
        h.importer.import_block(&block, false).await.unwrap();
        h.chain.add_block(block);

        assert_eq!(h.verifier.verify_block(13).await.unwrap(), VerifyOutcome::Matched);
        assert_eq!(h.metrics.snapshot().invalid_block_count, 0);
        assert_eq!(h.cache.proposer_block_count(proposer()).unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_missing_block_is_imported() {
        let h = harness();
        h.chain.add_block(sample_block(14, 1));

        let outcome = h.verifier.verify_block(14).await.unwrap();
        assert_eq!(
            outcome,
            VerifyOutcome::Repaired {
                mismatches: vec![Mismatch::Missing]
            }
        );
        assert!(h.store.block_exists(14).unwrap());
    }

    #[tokio::test]
    async fn test_status_mismatch_is_detected() {
        let h = harness();
        h.importer.import_block(&sample_block(15, 2), false).await.unwrap();
        let mut canonical = sample_block(15, 2);
        canonical.receipts[1].status = 0;
        h.chain.set_canonical(canonical);

        let outcome = h.verifier.verify_block(15).await.unwrap();
        assert_eq!(
            outcome,
            VerifyOutcome::Repaired {
                mismatches: vec![Mismatch::Statuses]
            }
        );
        let stored = h.store.get_block(15).unwrap().unwrap();
        assert_eq!(stored.transactions[1].status, 0);
    }

    #[tokio::test]
    async fn test_canonical_failure_requeues() {
        let h = harness();
        h.chain.fail_height(16);
        h.cache.push_unverified_height(16).unwrap();

        assert!(h.verifier.tick().await.is_err());
        assert_eq!(h.cache.pop_unverified_height().unwrap(), Some(16));
        assert!(!h.store.block_exists(16).unwrap());
    }

    #[tokio::test]
    async fn test_tick_counts_repairs() {
        let h = harness();
        for height in [20, 21] {
            h.chain.add_block(sample_block(height, 0));
            h.cache.push_unverified_height(height).unwrap();
        }
        h.importer.import_block(&sample_block(20, 0), false).await.unwrap();

        assert_eq!(h.verifier.tick().await.unwrap(), 1);
        assert_eq!(h.cache.unverified_queue_len().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_repair_keeps_transaction_moved_to_next_height() {
        let h = harness();
        let stale = sample_block(9, 1);
        h.importer.import_block(&stale, false).await.unwrap();

        // A reorg moved the only transaction of 9 into 10
        let mut next = sample_block(10, 0);
        let mut moved = stale.transactions[0].clone();
        moved.block_height = 10;
        moved.block_hash = next.hash;
        next.transactions = vec![moved];
        next.receipts = stale.receipts.clone();
        next.num_txs = 1;
        h.importer.import_block(&next, false).await.unwrap();

        h.chain.set_canonical(sample_block(9, 0));
        let outcome = h.verifier.verify_block(9).await.unwrap();
        assert!(matches!(outcome, VerifyOutcome::Repaired { .. }));

        let stored = h.store.get_block(10).unwrap().unwrap();
        assert_eq!(stored.tx_hashes(), next.tx_hashes());
        let tx = h.store.get_transaction(stale.transactions[0].hash).unwrap().unwrap();
        assert_eq!(tx.block_height, 10);
        assert!(h.store.get_block(9).unwrap().unwrap().transactions.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_backfill_lands_between_repair_delete_and_reimport() {
        let (rocks, _temp) = create_store();
        let (pausing, release) = PausingStore::new(rocks, 40);
        let pausing = Arc::new(pausing);
        let store: Arc<dyn Store> = pausing.clone();
        let cache = Arc::new(MemoryCache::new());
        let chain = Arc::new(FakeChain::new());
        let metrics = Arc::new(Metrics::new());
        let importer = Arc::new(Importer::new(
            store.clone(),
            cache.clone(),
            chain.clone(),
            metrics.clone(),
        ));
        let verifier = VerifierWorker::new(
            chain.clone(),
            store.clone(),
            cache.clone(),
            importer.clone(),
            metrics.clone(),
            Duration::from_millis(10),
            5,
        );
        let mut backfill = BackfillWorker::new(
            chain.clone(),
            store.clone(),
            cache.clone(),
            importer.clone(),
            metrics.clone(),
            BackfillSettings {
                interval: Duration::from_millis(10),
                batch_size: 1,
                skip_threshold: 3,
                max_backoff: Duration::from_millis(10),
            },
        );

        let mut corrupted = sample_block(40, 3);
        corrupted.hash = hash_of(0xdd, 40);
        importer.import_block(&corrupted, false).await.unwrap();
        let canonical = sample_block(40, 3);
        chain.add_block(canonical.clone());
        cache.push_error_height(40).unwrap();

        let repair = tokio::spawn(async move {
            let outcome = verifier.verify_block(40).await;
            (verifier, outcome)
        });
        pausing.deleted.notified().await;
        assert!(!store.block_exists(40).unwrap());

        // The repair is parked after its delete; backfill imports the height
        assert_eq!(backfill.tick().await.unwrap(), 1);
        assert!(store.block_exists(40).unwrap());

        release.send(()).unwrap();
        let (verifier, outcome) = repair.await.unwrap();
        assert_eq!(
            outcome.unwrap(),
            VerifyOutcome::Repaired {
                mismatches: vec![Mismatch::Hash]
            }
        );

        let stored = store.get_block(40).unwrap().unwrap();
        assert_eq!(stored.hash, canonical.hash);
        assert_eq!(stored.transactions.len(), 3);
        assert_eq!(store.count_blocks_by_proposer(proposer()).unwrap(), 1);
        assert_eq!(cache.proposer_block_count(proposer()).unwrap(), Some(1));

        // Once settled, a second pass finds nothing to repair
        assert_eq!(verifier.verify_block(40).await.unwrap(), VerifyOutcome::Matched);
    }
}
