//! Block importer
//!
//! The only writer of block data. Merges receipts into transactions,
//! persists blocks, and refreshes the addresses and contracts touched by
//! each block. Cache writes are best-effort: a failing cache is logged
//! and never fails an import.

use crate::cache::Cache;
use crate::chain::ChainClient;
use crate::error::ImportError;
use crate::fee::{fee_string, hydro_to_float};
use crate::metrics::Metrics;
use crate::records::{AddressRecord, BlockRecord, ContractRecord, ReceiptRecord, TransactionRecord};
use crate::store::Store;
use alloy_primitives::{Address, B256};
use anyhow::Result;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Imports fetched blocks into the store.
pub struct Importer {
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
    chain: Arc<dyn ChainClient>,
    metrics: Arc<Metrics>,
    mirror_blocks: bool,
}

impl Importer {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        chain: Arc<dyn ChainClient>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            cache,
            chain,
            metrics,
            mirror_blocks: false,
        }
    }

    /// Mirror blocks into the cache on repair imports too.
    pub fn with_mirroring(mut self, mirror_blocks: bool) -> Self {
        self.mirror_blocks = mirror_blocks;
        self
    }

    /// Import a fetched block.
    ///
    /// Fails with [`ImportError::AlreadyExists`] if the height is stored,
    /// which callers treat as success.
    pub async fn import_block(
        &self,
        block: &BlockRecord,
        write_to_cache: bool,
    ) -> Result<(), ImportError> {
        let started = Instant::now();
        let height = block.height;

        if self.store.block_exists(height).map_err(ImportError::Store)? {
            return Err(ImportError::AlreadyExists(height));
        }

        if write_to_cache {
            if let Err(e) = self.cache.mirror_block(block) {
                warn!(height, "Failed to mirror block into cache: {:#}", e);
            }
        }

        self.bump_proposer_count(block.proposer);

        let txs = self.process_txs(block).map_err(ImportError::Store)?;
        self.store
            .insert_block(block)
            .map_err(ImportError::Store)?;

        if let Err(e) = self.process_active_address(&txs, height).await {
            warn!(height, "Failed to process address batch: {:#}", e);
        }

        let elapsed = started.elapsed();
        self.metrics.record_processing(elapsed);
        info!(height, txs = txs.len(), ?elapsed, "Imported block");
        Ok(())
    }

    /// Replace whatever is stored at the block's height.
    ///
    /// A concurrent writer importing the same height in between counts as
    /// success.
    pub async fn upsert_block(&self, block: &BlockRecord) -> Result<(), ImportError> {
        let previous = match self.store.get_block(block.height) {
            Ok(previous) => previous,
            Err(e) => {
                warn!(height = block.height, "Failed to read block being replaced: {:#}", e);
                None
            }
        };
        let deleted = self
            .store
            .delete_block_by_height(block.height)
            .map_err(ImportError::Store)?;
        if deleted {
            debug!(height = block.height, "Deleted stored block before re-import");
            if let Some(previous) = previous {
                self.recount_proposer(previous.proposer);
            }
        }

        match self.import_block(block, self.mirror_blocks).await {
            Err(ImportError::AlreadyExists(height)) => {
                debug!(height, "Block re-imported concurrently");
                Ok(())
            }
            other => other,
        }
    }

    /// Merge receipts into the block's transactions and persist them.
    ///
    /// Returns the merged transactions.
    pub fn process_txs(&self, block: &BlockRecord) -> Result<Vec<TransactionRecord>> {
        let txs = merge_receipts(block);
        self.store.insert_transactions(&txs)?;

        if let Err(e) = self.cache.incr_total_txs(txs.len() as u64) {
            warn!(height = block.height, "Failed to update total tx counter: {:#}", e);
        }
        let hashes: Vec<B256> = block.receipts.iter().map(|r| r.transaction_hash).collect();
        if let Err(e) = self.cache.push_receipt_hashes(&hashes) {
            warn!(height = block.height, "Failed to announce receipts: {:#}", e);
        }

        Ok(txs)
    }

    /// Refresh the address records and contracts touched by `txs`.
    ///
    /// A new contract is recorded even when its bytecode cannot be fetched.
    /// An address whose balance or code cannot be fetched is left as it was.
    pub async fn process_active_address(&self, txs: &[TransactionRecord], height: u64) -> Result<()> {
        let mut touched = BTreeSet::new();
        for tx in txs {
            touched.insert(tx.from);
            touched.extend(tx.to);
            touched.extend(tx.contract_address);
        }
        touched.remove(&Address::ZERO);
        if touched.is_empty() {
            return Ok(());
        }

        for tx in txs {
            let Some(address) = tx.contract_address.filter(|a| !a.is_zero()) else {
                continue;
            };
            if self.store.get_contract(address)?.is_some() {
                continue;
            }
            let mut contract = ContractRecord::detected(address, tx.from, tx.hash, tx.timestamp);
            match self.chain.code(address).await {
                Ok(code) => contract.bytecode = code,
                Err(e) => warn!(contract = %address, "Failed to fetch contract code: {:#}", e),
            }
            self.store.insert_contract(&contract)?;
            info!(contract = %address, owner = %tx.from, "Detected new contract");
        }

        let names: HashMap<Address, String> = self
            .store
            .get_validators()?
            .into_iter()
            .map(|v| (v.address, v.name))
            .collect();

        let mut records = Vec::with_capacity(touched.len());
        for address in touched {
            let balance = match self.chain.balance(address).await {
                Ok(balance) => balance,
                Err(e) => {
                    warn!(%address, "Failed to fetch balance: {:#}", e);
                    continue;
                }
            };
            let is_contract = match self.store.get_contract(address)? {
                Some(_) => true,
                None => match self.chain.code(address).await {
                    Ok(code) => !code.is_empty(),
                    Err(e) => {
                        warn!(%address, "Failed to fetch code: {:#}", e);
                        continue;
                    }
                },
            };
            let name = match names.get(&address) {
                Some(name) => name.clone(),
                None => self
                    .store
                    .get_address(address)?
                    .map(|record| record.name)
                    .unwrap_or_default(),
            };
            records.push(AddressRecord {
                address,
                is_contract,
                balance: balance.to_string(),
                balance_float: hydro_to_float(balance),
                name,
                updated_at: height,
            });
        }
        self.store.upsert_addresses(&records)?;

        let totals = self
            .store
            .count_addresses()
            .and_then(|addresses| Ok((addresses, self.store.count_contracts()?)));
        match totals {
            Ok((addresses, contracts)) => {
                if let Err(e) = self
                    .cache
                    .set_total_addresses(addresses)
                    .and_then(|_| self.cache.set_total_contracts(contracts))
                {
                    warn!(height, "Failed to update address counters: {:#}", e);
                }
            }
            Err(e) => warn!(height, "Failed to count addresses: {:#}", e),
        }

        debug!(height, addresses = records.len(), "Refreshed active addresses");
        Ok(())
    }

    /// Increment the cached block count of a proposer, recounting from the
    /// store when the cache has no usable value.
    fn bump_proposer_count(&self, proposer: Address) {
        let current = match self.cache.proposer_block_count(proposer) {
            Ok(Some(count)) if count > 0 => count,
            Ok(_) => match self.store.count_blocks_by_proposer(proposer) {
                Ok(count) => count,
                Err(e) => {
                    warn!(%proposer, "Failed to count proposer blocks: {:#}", e);
                    return;
                }
            },
            Err(e) => {
                warn!(%proposer, "Failed to read proposer block count: {:#}", e);
                return;
            }
        };
        if let Err(e) = self.cache.set_proposer_block_count(proposer, current + 1) {
            warn!(%proposer, "Failed to write proposer block count: {:#}", e);
        }
    }

    /// Reset the cached block count of a proposer to the stored count.
    fn recount_proposer(&self, proposer: Address) {
        let result = self
            .store
            .count_blocks_by_proposer(proposer)
            .and_then(|count| self.cache.set_proposer_block_count(proposer, count));
        if let Err(e) = result {
            warn!(%proposer, "Failed to recount proposer blocks: {:#}", e);
        }
    }
}

/// Merge receipts into the block's transactions, pairing them by hash.
///
/// A transaction without a receipt keeps status 0 and fee "0".
pub fn merge_receipts(block: &BlockRecord) -> Vec<TransactionRecord> {
    let receipts: HashMap<B256, &ReceiptRecord> = block
        .receipts
        .iter()
        .map(|receipt| (receipt.transaction_hash, receipt))
        .collect();

    block
        .transactions
        .iter()
        .map(|tx| {
            let mut merged = tx.clone();
            match receipts.get(&tx.hash) {
                Some(receipt) => {
                    merged.status = receipt.status;
                    merged.gas_used = receipt.gas_used;
                    merged.contract_address = receipt.contract_address;
                    merged.tx_fee = fee_string(tx.gas_price, receipt.gas_used);
                    merged.logs = receipt
                        .logs
                        .iter()
                        .cloned()
                        .map(|mut log| {
                            log.timestamp = block.timestamp;
                            log
                        })
                        .collect();
                }
                None => {
                    warn!(height = block.height, tx = %tx.hash, "Transaction has no receipt");
                    merged.status = 0;
                    merged.tx_fee = "0".to_string();
                }
            }
            merged
        })
        .collect()
}
