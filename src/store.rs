//! Store trait and RocksDB implementation
//!
//! Provides the durable store for blocks, transactions, logs, addresses,
//! contracts and validators. Uses RocksDB with column families for
//! efficient organization.

use crate::keys::{
    decode_height_key, encode_abi_type_key, encode_address_key, encode_block_key,
    encode_contract_key, encode_log_key, encode_log_prefix, encode_proposer_key,
    encode_proposer_prefix, encode_tx_key, encode_validator_key,
};
use crate::records::{
    AddressRecord, BlockRecord, BlockRow, ContractRecord, LogRecord, TransactionRecord,
    ValidatorRecord,
};
use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Trait defining the interface for durable chain-data storage.
///
/// All methods return Results; a failed write is the only failure that
/// aborts a unit of work in the pipeline.
pub trait Store: Send + Sync {
    /// Check whether a block row exists at the given height.
    fn block_exists(&self, height: u64) -> Result<bool>;

    /// Get a block with its stored transactions.
    fn get_block(&self, height: u64) -> Result<Option<BlockRecord>>;

    /// Store a block row and its proposer index entry.
    fn insert_block(&self, block: &BlockRecord) -> Result<()>;

    /// Delete the block at a height together with the transaction rows that
    /// still belong to it. A row that a later import moved to another height
    /// is left in place.
    ///
    /// Returns false if there was nothing to delete.
    fn delete_block_by_height(&self, height: u64) -> Result<bool>;

    /// Highest stored block height.
    fn latest_block_height(&self) -> Result<Option<u64>>;

    /// Store transactions, replacing any existing rows with the same hash.
    fn insert_transactions(&self, txs: &[TransactionRecord]) -> Result<()>;

    /// Get a transaction by hash.
    fn get_transaction(&self, hash: B256) -> Result<Option<TransactionRecord>>;

    /// Store log records.
    fn insert_logs(&self, logs: &[LogRecord]) -> Result<()>;

    /// Get all logs of a block ordered by (tx_index, log_index).
    fn get_logs_by_block(&self, height: u64) -> Result<Vec<LogRecord>>;

    /// Get a contract by address.
    fn get_contract(&self, addr: Address) -> Result<Option<ContractRecord>>;

    /// Store a contract record.
    fn insert_contract(&self, contract: &ContractRecord) -> Result<()>;

    /// Get the shared base64 ABI registered for a contract type tag.
    fn get_abi_by_type(&self, kind: &str) -> Result<Option<String>>;

    /// Register the shared base64 ABI for a contract type tag.
    fn put_abi_by_type(&self, kind: &str, abi: &str) -> Result<()>;

    /// Insert or replace address records.
    fn upsert_addresses(&self, addrs: &[AddressRecord]) -> Result<()>;

    /// Get an address record.
    fn get_address(&self, addr: Address) -> Result<Option<AddressRecord>>;

    /// Number of known addresses.
    fn count_addresses(&self) -> Result<u64>;

    /// Number of known contracts.
    fn count_contracts(&self) -> Result<u64>;

    /// Number of stored blocks proposed by an address.
    fn count_blocks_by_proposer(&self, proposer: Address) -> Result<u64>;

    /// Insert or replace a validator record.
    fn upsert_validator(&self, validator: &ValidatorRecord) -> Result<()>;

    /// All known validators.
    fn get_validators(&self) -> Result<Vec<ValidatorRecord>>;
}

/// RocksDB-backed implementation of Store.
///
/// Uses column families to organize different types of data:
/// - blocks: block rows keyed by height
/// - transactions: merged transactions keyed by hash
/// - logs: log records keyed by (height, tx_index, log_index)
/// - addresses: address records
/// - contracts: contract records
/// - abis: shared ABIs keyed by contract type tag
/// - proposers: (proposer, height) index for block counts
/// - validators: validator display names
pub struct RocksStore {
    db: DB,
}

const COLUMN_FAMILIES: [&str; 8] = [
    "blocks",
    "transactions",
    "logs",
    "addresses",
    "contracts",
    "abis",
    "proposers",
    "validators",
];

impl RocksStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all required column families if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let column_families = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, column_families)
            .context("Failed to open RocksDB store")?;

        Ok(Self { db })
    }

    /// Get a column family handle by name.
    fn get_cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .with_context(|| format!("Column family '{}' not found", name))
    }

    /// Read and deserialize a single postcard value.
    fn get_value<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.get_cf(cf_name)?;
        match self
            .db
            .get_cf(cf, key)
            .with_context(|| format!("Failed to read from {}", cf_name))?
        {
            Some(bytes) => {
                let value = postcard::from_bytes(&bytes)
                    .with_context(|| format!("Failed to deserialize {} record", cf_name))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Count all keys in a column family.
    fn count_keys(&self, cf_name: &str) -> Result<u64> {
        let cf = self.get_cf(cf_name)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item.context("Failed to read iterator")?;
            count += 1;
        }
        Ok(count)
    }

    fn get_block_row(&self, height: u64) -> Result<Option<BlockRow>> {
        self.get_value("blocks", &encode_block_key(height))
    }
}

impl Store for RocksStore {
    fn block_exists(&self, height: u64) -> Result<bool> {
        let cf = self.get_cf("blocks")?;
        let found = self
            .db
            .get_pinned_cf(cf, encode_block_key(height))
            .context("Failed to check block existence")?;
        Ok(found.is_some())
    }

    fn get_block(&self, height: u64) -> Result<Option<BlockRecord>> {
        let Some(row) = self.get_block_row(height)? else {
            return Ok(None);
        };

        let mut transactions = Vec::with_capacity(row.tx_hashes.len());
        for hash in &row.tx_hashes {
            let tx = self
                .get_transaction(*hash)?
                .with_context(|| format!("Block {} references missing tx {:?}", height, hash))?;
            transactions.push(tx);
        }

        Ok(Some(row.into_record(transactions)))
    }

    fn insert_block(&self, block: &BlockRecord) -> Result<()> {
        let blocks = self.get_cf("blocks")?;
        let proposers = self.get_cf("proposers")?;
        let row = BlockRow::from(block);
        let value = postcard::to_allocvec(&row).context("Failed to serialize block row")?;

        let mut batch = WriteBatch::default();
        batch.put_cf(blocks, encode_block_key(block.height), value);
        batch.put_cf(proposers, encode_proposer_key(block.proposer, block.height), b"");
        self.db.write(batch).context("Failed to put block")?;
        Ok(())
    }

    fn delete_block_by_height(&self, height: u64) -> Result<bool> {
        let Some(row) = self.get_block_row(height)? else {
            return Ok(false);
        };

        let blocks = self.get_cf("blocks")?;
        let proposers = self.get_cf("proposers")?;
        let transactions = self.get_cf("transactions")?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(blocks, encode_block_key(height));
        batch.delete_cf(proposers, encode_proposer_key(row.proposer, height));
        for hash in &row.tx_hashes {
            let owned = match self.get_transaction(*hash)? {
                Some(tx) => tx.block_height == height,
                None => false,
            };
            if owned {
                batch.delete_cf(transactions, encode_tx_key(*hash));
            }
        }
        self.db.write(batch).context("Failed to delete block")?;
        Ok(true)
    }

    fn latest_block_height(&self) -> Result<Option<u64>> {
        let cf = self.get_cf("blocks")?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item.context("Failed to read iterator")?;
                Ok(Some(decode_height_key(&key)?))
            }
            None => Ok(None),
        }
    }

    fn insert_transactions(&self, txs: &[TransactionRecord]) -> Result<()> {
        let cf = self.get_cf("transactions")?;
        let mut batch = WriteBatch::default();
        for tx in txs {
            let value = postcard::to_allocvec(tx).context("Failed to serialize transaction")?;
            batch.put_cf(cf, encode_tx_key(tx.hash), value);
        }
        self.db.write(batch).context("Failed to put transactions")?;
        Ok(())
    }

    fn get_transaction(&self, hash: B256) -> Result<Option<TransactionRecord>> {
        self.get_value("transactions", &encode_tx_key(hash))
    }

    fn insert_logs(&self, logs: &[LogRecord]) -> Result<()> {
        let cf = self.get_cf("logs")?;
        let mut batch = WriteBatch::default();
        for log in logs {
            let key = encode_log_key(log.block_height, log.tx_index, log.log_index);
            let value = postcard::to_allocvec(log).context("Failed to serialize log")?;
            batch.put_cf(cf, key, value);
        }
        self.db.write(batch).context("Failed to put logs")?;
        Ok(())
    }

    fn get_logs_by_block(&self, height: u64) -> Result<Vec<LogRecord>> {
        let cf = self.get_cf("logs")?;
        let prefix = encode_log_prefix(height);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut logs = Vec::new();
        for item in iter {
            let (key, value) = item.context("Failed to read iterator")?;
            if !key.starts_with(&prefix) {
                break;
            }
            let log: LogRecord =
                postcard::from_bytes(&value).context("Failed to deserialize log")?;
            logs.push(log);
        }
        Ok(logs)
    }

    fn get_contract(&self, addr: Address) -> Result<Option<ContractRecord>> {
        self.get_value("contracts", &encode_contract_key(addr))
    }

    fn insert_contract(&self, contract: &ContractRecord) -> Result<()> {
        let cf = self.get_cf("contracts")?;
        let value = postcard::to_allocvec(contract).context("Failed to serialize contract")?;
        self.db
            .put_cf(cf, encode_contract_key(contract.address), value)
            .context("Failed to put contract")?;
        Ok(())
    }

    fn get_abi_by_type(&self, kind: &str) -> Result<Option<String>> {
        let cf = self.get_cf("abis")?;
        match self
            .db
            .get_cf(cf, encode_abi_type_key(kind))
            .context("Failed to get type ABI")?
        {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes).context("Type ABI is not valid UTF-8")?,
            )),
            None => Ok(None),
        }
    }

    fn put_abi_by_type(&self, kind: &str, abi: &str) -> Result<()> {
        let cf = self.get_cf("abis")?;
        self.db
            .put_cf(cf, encode_abi_type_key(kind), abi.as_bytes())
            .context("Failed to put type ABI")?;
        Ok(())
    }

    fn upsert_addresses(&self, addrs: &[AddressRecord]) -> Result<()> {
        let cf = self.get_cf("addresses")?;
        let mut batch = WriteBatch::default();
        for record in addrs {
            let value = postcard::to_allocvec(record).context("Failed to serialize address")?;
            batch.put_cf(cf, encode_address_key(record.address), value);
        }
        self.db.write(batch).context("Failed to upsert addresses")?;
        Ok(())
    }

    fn get_address(&self, addr: Address) -> Result<Option<AddressRecord>> {
        self.get_value("addresses", &encode_address_key(addr))
    }

    fn count_addresses(&self) -> Result<u64> {
        self.count_keys("addresses")
    }

    fn count_contracts(&self) -> Result<u64> {
        self.count_keys("contracts")
    }

    fn count_blocks_by_proposer(&self, proposer: Address) -> Result<u64> {
        let cf = self.get_cf("proposers")?;
        let prefix = encode_proposer_prefix(proposer);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut count = 0;
        for item in iter {
            let (key, _) = item.context("Failed to read iterator")?;
            if !key.starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    fn upsert_validator(&self, validator: &ValidatorRecord) -> Result<()> {
        let cf = self.get_cf("validators")?;
        let value = postcard::to_allocvec(validator).context("Failed to serialize validator")?;
        self.db
            .put_cf(cf, encode_validator_key(validator.address), value)
            .context("Failed to put validator")?;
        Ok(())
    }

    fn get_validators(&self) -> Result<Vec<ValidatorRecord>> {
        let cf = self.get_cf("validators")?;
        let mut validators = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item.context("Failed to read iterator")?;
            let validator: ValidatorRecord =
                postcard::from_bytes(&value).context("Failed to deserialize validator")?;
            validators.push(validator);
        }
        Ok(validators)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{sample_block, sample_log};
    use alloy_primitives::address;
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RocksStore::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    fn insert_full_block(store: &RocksStore, block: &BlockRecord) {
        store.insert_transactions(&block.transactions).unwrap();
        store.insert_block(block).unwrap();
    }

    #[test]
    fn test_block_roundtrip() {
        let (store, _temp) = create_test_store();
        let block = sample_block(10, 2);
        insert_full_block(&store, &block);

        assert!(store.block_exists(10).unwrap());
        assert!(!store.block_exists(11).unwrap());

        let stored = store.get_block(10).unwrap().unwrap();
        assert_eq!(stored.hash, block.hash);
        assert_eq!(stored.tx_hashes(), block.tx_hashes());
        assert!(stored.receipts.is_empty());
    }

    #[test]
    fn test_missing_block_returns_none() {
        let (store, _temp) = create_test_store();
        assert!(store.get_block(1).unwrap().is_none());
        assert!(!store.delete_block_by_height(1).unwrap());
    }

    #[test]
    fn test_delete_block_removes_rows() {
        let (store, _temp) = create_test_store();
        let block = sample_block(10, 2);
        insert_full_block(&store, &block);
        assert_eq!(store.count_blocks_by_proposer(block.proposer).unwrap(), 1);

        assert!(store.delete_block_by_height(10).unwrap());
        assert!(!store.block_exists(10).unwrap());
        assert!(store.get_transaction(block.transactions[0].hash).unwrap().is_none());
        assert_eq!(store.count_blocks_by_proposer(block.proposer).unwrap(), 0);
    }

    #[test]
    fn test_delete_keeps_tx_moved_to_other_height() {
        let (store, _temp) = create_test_store();
        let stale = sample_block(9, 1);
        insert_full_block(&store, &stale);

        // The same transaction reappears at height 10 after a reorg.
        let mut moved = stale.transactions[0].clone();
        moved.block_height = 10;
        let mut block = sample_block(10, 0);
        block.transactions = vec![moved.clone()];
        block.num_txs = 1;
        insert_full_block(&store, &block);

        assert!(store.delete_block_by_height(9).unwrap());
        assert_eq!(store.get_transaction(moved.hash).unwrap(), Some(moved.clone()));
        let stored = store.get_block(10).unwrap().unwrap();
        assert_eq!(stored.tx_hashes(), vec![moved.hash]);
    }

    #[test]
    fn test_latest_block_height() {
        let (store, _temp) = create_test_store();
        assert_eq!(store.latest_block_height().unwrap(), None);
        for height in [5, 300, 42] {
            insert_full_block(&store, &sample_block(height, 0));
        }
        assert_eq!(store.latest_block_height().unwrap(), Some(300));
    }

    #[test]
    fn test_count_blocks_by_proposer() {
        let (store, _temp) = create_test_store();
        let other = address!("00000000000000000000000000000000000000ff");
        for height in 1..=3 {
            insert_full_block(&store, &sample_block(height, 0));
        }
        let mut foreign = sample_block(4, 0);
        foreign.proposer = other;
        insert_full_block(&store, &foreign);

        assert_eq!(store.count_blocks_by_proposer(sample_block(1, 0).proposer).unwrap(), 3);
        assert_eq!(store.count_blocks_by_proposer(other).unwrap(), 1);
    }

    #[test]
    fn test_logs_by_block_are_ordered() {
        let (store, _temp) = create_test_store();
        let logs = vec![sample_log(7, 1, 0), sample_log(7, 0, 1), sample_log(8, 0, 0)];
        store.insert_logs(&logs).unwrap();

        let stored = store.get_logs_by_block(7).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!((stored[0].tx_index, stored[0].log_index), (0, 1));
        assert_eq!((stored[1].tx_index, stored[1].log_index), (1, 0));
    }

    #[test]
    fn test_type_abi_roundtrip() {
        let (store, _temp) = create_test_store();
        assert!(store.get_abi_by_type("KRC20").unwrap().is_none());
        store.put_abi_by_type("KRC20", "W10=").unwrap();
        assert_eq!(store.get_abi_by_type("KRC20").unwrap().as_deref(), Some("W10="));
    }

    #[test]
    fn test_address_upsert_and_count() {
        let (store, _temp) = create_test_store();
        let addr = address!("0000000000000000000000000000000000000001");
        let mut record = AddressRecord {
            address: addr,
            is_contract: false,
            balance: "1".to_string(),
            balance_float: 1e-18,
            name: String::new(),
            updated_at: 1,
        };
        store.upsert_addresses(&[record.clone()]).unwrap();
        record.balance = "2".to_string();
        store.upsert_addresses(&[record.clone()]).unwrap();

        assert_eq!(store.count_addresses().unwrap(), 1);
        assert_eq!(store.get_address(addr).unwrap().unwrap().balance, "2");
    }

    #[test]
    fn test_validators() {
        let (store, _temp) = create_test_store();
        let validator = ValidatorRecord {
            address: address!("0000000000000000000000000000000000000009"),
            name: "Validator One".to_string(),
        };
        store.upsert_validator(&validator).unwrap();
        assert_eq!(store.get_validators().unwrap(), vec![validator]);
    }
}
