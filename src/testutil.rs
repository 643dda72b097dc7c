//! Test fixtures: sample records, a scripted chain and failure-injecting
//! Store/Cache wrappers.

use crate::cache::Cache;
use crate::chain::{ChainClient, LogFilter, LogStream};
use crate::records::{
    AddressRecord, BlockRecord, ContractRecord, LogRecord, ReceiptRecord, TransactionRecord,
    ValidatorRecord,
};
use crate::store::{RocksStore, Store};
use alloy_primitives::{address, Address, B256, U256};
use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;

pub fn proposer() -> Address {
    address!("00000000000000000000000000000000000000aa")
}

pub fn sender() -> Address {
    address!("0000000000000000000000000000000000000001")
}

pub fn recipient() -> Address {
    address!("0000000000000000000000000000000000000002")
}

pub fn contract() -> Address {
    address!("00000000000000000000000000000000000000cc")
}

/// Deterministic 32-byte value tagged by kind.
pub fn hash_of(tag: u8, n: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = tag;
    bytes[24..].copy_from_slice(&n.to_be_bytes());
    B256::from(bytes)
}

pub fn block_hash(height: u64) -> B256 {
    hash_of(0xb0, height)
}

pub fn tx_hash(height: u64, index: u64) -> B256 {
    hash_of(0x70, height * 1000 + index)
}

/// A chain-fetched block with `n_txs` simple transfers, each paired with
/// a successful receipt using 21000 gas at price 2.
pub fn sample_block(height: u64, n_txs: u64) -> BlockRecord {
    let timestamp = 1_700_000_000 + height;
    let transactions = (0..n_txs)
        .map(|index| TransactionRecord {
            hash: tx_hash(height, index),
            block_height: height,
            block_hash: block_hash(height),
            index,
            timestamp,
            from: sender(),
            to: Some(recipient()),
            contract_address: None,
            value: U256::from(1),
            gas_limit: 21000,
            gas_price: U256::from(2),
            gas_used: U256::ZERO,
            input: Vec::new(),
            status: 0,
            tx_fee: String::new(),
            logs: Vec::new(),
        })
        .collect::<Vec<_>>();
    let receipts = transactions
        .iter()
        .map(|tx| ReceiptRecord {
            transaction_hash: tx.hash,
            status: 1,
            gas_used: U256::from(21000),
            contract_address: None,
            logs: Vec::new(),
        })
        .collect();

    BlockRecord {
        height,
        hash: block_hash(height),
        parent_hash: block_hash(height.saturating_sub(1)),
        timestamp,
        proposer: proposer(),
        num_txs: n_txs,
        gas_used: 21000 * n_txs,
        transactions,
        receipts,
    }
}

pub fn sample_log(height: u64, tx_index: u64, log_index: u64) -> LogRecord {
    LogRecord {
        address: contract(),
        topics: vec![hash_of(0xe0, 1)],
        data: Vec::new(),
        block_height: height,
        block_hash: block_hash(height),
        tx_hash: tx_hash(height, tx_index),
        tx_index,
        log_index,
        removed: false,
        timestamp: 0,
        decoded: None,
    }
}

/// Base64 JSON ABI with an ERC20-style `Transfer` event.
pub fn erc20_abi() -> String {
    let abi = json!([
        {
            "type": "event",
            "name": "Transfer",
            "anonymous": false,
            "inputs": [
                {"name": "from", "type": "address", "indexed": true},
                {"name": "to", "type": "address", "indexed": true},
                {"name": "value", "type": "uint256", "indexed": false}
            ]
        },
        {
            "type": "function",
            "name": "transfer",
            "inputs": [
                {"name": "to", "type": "address"},
                {"name": "value", "type": "uint256"}
            ]
        }
    ]);
    STANDARD.encode(abi.to_string())
}

pub fn create_store() -> (Arc<RocksStore>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = RocksStore::open(temp_dir.path()).unwrap();
    (Arc::new(store), temp_dir)
}

/// Scripted [`ChainClient`].
///
/// Blocks added with [`FakeChain::add_block`] are served by both paths;
/// [`FakeChain::set_canonical`] overrides what the trusted node returns.
#[derive(Default)]
pub struct FakeChain {
    latest: AtomicU64,
    blocks: Mutex<HashMap<u64, BlockRecord>>,
    canonical: Mutex<HashMap<u64, BlockRecord>>,
    failing: Mutex<HashSet<u64>>,
    failing_addresses: Mutex<HashSet<Address>>,
    balances: Mutex<HashMap<Address, U256>>,
    code: Mutex<HashMap<Address, Vec<u8>>>,
    transactions: Mutex<HashMap<B256, TransactionRecord>>,
    logs: Mutex<VecDeque<Result<LogRecord>>>,
    filters: Mutex<Vec<LogFilter>>,
    pub block_calls: AtomicUsize,
    pub code_calls: AtomicUsize,
    pub subscriptions: AtomicUsize,
}

impl FakeChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_latest(&self, height: u64) {
        self.latest.store(height, Ordering::SeqCst);
    }

    pub fn add_block(&self, block: BlockRecord) {
        for tx in &block.transactions {
            self.transactions.lock().unwrap().insert(tx.hash, tx.clone());
        }
        self.canonical.lock().unwrap().insert(block.height, block.clone());
        self.blocks.lock().unwrap().insert(block.height, block);
    }

    pub fn set_canonical(&self, block: BlockRecord) {
        self.canonical.lock().unwrap().insert(block.height, block);
    }

    /// Make every fetch of `height` fail until [`FakeChain::heal`] is called.
    pub fn fail_height(&self, height: u64) {
        self.failing.lock().unwrap().insert(height);
    }

    pub fn heal(&self, height: u64) {
        self.failing.lock().unwrap().remove(&height);
    }

    /// Make balance and code lookups of `address` fail.
    pub fn fail_address(&self, address: Address) {
        self.failing_addresses.lock().unwrap().insert(address);
    }

    fn check_address(&self, address: Address) -> Result<()> {
        if self.failing_addresses.lock().unwrap().contains(&address) {
            anyhow::bail!("node unavailable for address {}", address);
        }
        Ok(())
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.balances.lock().unwrap().insert(address, balance);
    }

    pub fn set_code(&self, address: Address, code: Vec<u8>) {
        self.code.lock().unwrap().insert(address, code);
    }

    pub fn add_transaction(&self, tx: TransactionRecord) {
        self.transactions.lock().unwrap().insert(tx.hash, tx);
    }

    /// Queue logs for delivery by subscriptions.
    pub fn push_logs(&self, logs: Vec<LogRecord>) {
        self.logs.lock().unwrap().extend(logs.into_iter().map(Ok));
    }

    /// Queue a stream error. The subscription delivering it ends there and
    /// the next one picks up the remaining queued logs.
    pub fn push_log_error(&self, message: &str) {
        self.logs.lock().unwrap().push_back(Err(anyhow::anyhow!("{}", message)));
    }

    /// Filters of every subscription opened so far.
    pub fn log_filters(&self) -> Vec<LogFilter> {
        self.filters.lock().unwrap().clone()
    }

    fn fetch(&self, map: &Mutex<HashMap<u64, BlockRecord>>, height: u64) -> Result<Option<BlockRecord>> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&height) {
            anyhow::bail!("node unavailable for block {}", height);
        }
        Ok(map.lock().unwrap().get(&height).cloned())
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn latest_height(&self) -> Result<u64> {
        Ok(self.latest.load(Ordering::SeqCst))
    }

    async fn block_by_height(&self, height: u64) -> Result<Option<BlockRecord>> {
        self.fetch(&self.blocks, height)
    }

    async fn block_by_height_canonical(&self, height: u64) -> Result<Option<BlockRecord>> {
        self.fetch(&self.canonical, height)
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        self.check_address(address)?;
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(U256::ZERO))
    }

    async fn code(&self, address: Address) -> Result<Vec<u8>> {
        self.code_calls.fetch_add(1, Ordering::SeqCst);
        self.check_address(address)?;
        Ok(self.code.lock().unwrap().get(&address).cloned().unwrap_or_default())
    }

    async fn transaction(&self, hash: B256) -> Result<Option<TransactionRecord>> {
        Ok(self.transactions.lock().unwrap().get(&hash).cloned())
    }

    async fn subscribe_logs(&self, filter: LogFilter) -> Result<LogStream> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        self.filters.lock().unwrap().push(filter);
        let items = {
            let mut queued = self.logs.lock().unwrap();
            let mut items = Vec::new();
            while let Some(item) = queued.pop_front() {
                let failed = item.is_err();
                items.push(item);
                if failed {
                    break;
                }
            }
            items
        };
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Cache whose every operation fails.
pub struct FailingCache;

macro_rules! fail {
    () => {
        Err(anyhow::anyhow!("cache unavailable"))
    };
}

impl Cache for FailingCache {
    fn push_error_height(&self, _: u64) -> Result<bool> { fail!() }
    fn pop_error_height(&self) -> Result<Option<u64>> { fail!() }
    fn error_queue_len(&self) -> Result<u64> { fail!() }
    fn push_skip_height(&self, _: u64) -> Result<()> { fail!() }
    fn remove_skip_height(&self, _: u64) -> Result<bool> { fail!() }
    fn is_skipped(&self, _: u64) -> Result<bool> { fail!() }
    fn skip_heights(&self) -> Result<Vec<u64>> { fail!() }
    fn push_unverified_height(&self, _: u64) -> Result<bool> { fail!() }
    fn pop_unverified_height(&self) -> Result<Option<u64>> { fail!() }
    fn unverified_queue_len(&self) -> Result<u64> { fail!() }
    fn get_abi(&self, _: &str) -> Result<Option<String>> { fail!() }
    fn set_abi(&self, _: &str, _: &str) -> Result<()> { fail!() }
    fn remove_abi(&self, _: &str) -> Result<()> { fail!() }
    fn incr_total_txs(&self, _: u64) -> Result<u64> { fail!() }
    fn set_total_addresses(&self, _: u64) -> Result<()> { fail!() }
    fn set_total_contracts(&self, _: u64) -> Result<()> { fail!() }
    fn counter(&self, _: &str) -> Result<u64> { fail!() }
    fn proposer_block_count(&self, _: Address) -> Result<Option<u64>> { fail!() }
    fn set_proposer_block_count(&self, _: Address, _: u64) -> Result<()> { fail!() }
    fn push_receipt_hashes(&self, _: &[B256]) -> Result<()> { fail!() }
    fn pop_receipt_hashes(&self, _: usize) -> Result<Vec<B256>> { fail!() }
    fn receipt_queue_len(&self) -> Result<u64> { fail!() }
    fn mirror_block(&self, _: &BlockRecord) -> Result<()> { fail!() }
    fn mirrored_block(&self, _: u64) -> Result<Option<BlockRecord>> { fail!() }
}

/// Store wrapper counting contract and type-ABI reads.
pub struct CountingStore {
    inner: Arc<dyn Store>,
    pub contract_reads: AtomicUsize,
    pub type_abi_reads: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self {
            inner,
            contract_reads: AtomicUsize::new(0),
            type_abi_reads: AtomicUsize::new(0),
        }
    }
}

impl Store for CountingStore {
    fn block_exists(&self, height: u64) -> Result<bool> {
        self.inner.block_exists(height)
    }
    fn get_block(&self, height: u64) -> Result<Option<BlockRecord>> {
        self.inner.get_block(height)
    }
    fn insert_block(&self, block: &BlockRecord) -> Result<()> {
        self.inner.insert_block(block)
    }
    fn delete_block_by_height(&self, height: u64) -> Result<bool> {
        self.inner.delete_block_by_height(height)
    }
    fn latest_block_height(&self) -> Result<Option<u64>> {
        self.inner.latest_block_height()
    }
    fn insert_transactions(&self, txs: &[TransactionRecord]) -> Result<()> {
        self.inner.insert_transactions(txs)
    }
    fn get_transaction(&self, hash: B256) -> Result<Option<TransactionRecord>> {
        self.inner.get_transaction(hash)
    }
    fn insert_logs(&self, logs: &[LogRecord]) -> Result<()> {
        self.inner.insert_logs(logs)
    }
    fn get_logs_by_block(&self, height: u64) -> Result<Vec<LogRecord>> {
        self.inner.get_logs_by_block(height)
    }
    fn get_contract(&self, addr: Address) -> Result<Option<ContractRecord>> {
        self.contract_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_contract(addr)
    }
    fn insert_contract(&self, contract: &ContractRecord) -> Result<()> {
        self.inner.insert_contract(contract)
    }
    fn get_abi_by_type(&self, kind: &str) -> Result<Option<String>> {
        self.type_abi_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_abi_by_type(kind)
    }
    fn put_abi_by_type(&self, kind: &str, abi: &str) -> Result<()> {
        self.inner.put_abi_by_type(kind, abi)
    }
    fn upsert_addresses(&self, addrs: &[AddressRecord]) -> Result<()> {
        self.inner.upsert_addresses(addrs)
    }
    fn get_address(&self, addr: Address) -> Result<Option<AddressRecord>> {
        self.inner.get_address(addr)
    }
    fn count_addresses(&self) -> Result<u64> {
        self.inner.count_addresses()
    }
    fn count_contracts(&self) -> Result<u64> {
        self.inner.count_contracts()
    }
    fn count_blocks_by_proposer(&self, proposer: Address) -> Result<u64> {
        self.inner.count_blocks_by_proposer(proposer)
    }
    fn upsert_validator(&self, validator: &ValidatorRecord) -> Result<()> {
        self.inner.upsert_validator(validator)
    }
    fn get_validators(&self) -> Result<Vec<ValidatorRecord>> {
        self.inner.get_validators()
    }
}

/// Store wrapper that holds the first deletion of one height until the
/// returned sender fires, so another writer can run in between.
pub struct PausingStore {
    inner: Arc<dyn Store>,
    height: u64,
    armed: AtomicBool,
    /// Notified once the held deletion has been applied
    pub deleted: Notify,
    release: Mutex<mpsc::Receiver<()>>,
}

impl PausingStore {
    pub fn new(inner: Arc<dyn Store>, height: u64) -> (Self, mpsc::Sender<()>) {
        let (release, receiver) = mpsc::channel();
        let store = Self {
            inner,
            height,
            armed: AtomicBool::new(true),
            deleted: Notify::new(),
            release: Mutex::new(receiver),
        };
        (store, release)
    }
}

impl Store for PausingStore {
    fn block_exists(&self, height: u64) -> Result<bool> {
        self.inner.block_exists(height)
    }
    fn get_block(&self, height: u64) -> Result<Option<BlockRecord>> {
        self.inner.get_block(height)
    }
    fn insert_block(&self, block: &BlockRecord) -> Result<()> {
        self.inner.insert_block(block)
    }
    fn delete_block_by_height(&self, height: u64) -> Result<bool> {
        let deleted = self.inner.delete_block_by_height(height)?;
        if height == self.height && self.armed.swap(false, Ordering::SeqCst) {
            self.deleted.notify_one();
            let _ = self.release.lock().unwrap().recv();
        }
        Ok(deleted)
    }
    fn latest_block_height(&self) -> Result<Option<u64>> {
        self.inner.latest_block_height()
    }
    fn insert_transactions(&self, txs: &[TransactionRecord]) -> Result<()> {
        self.inner.insert_transactions(txs)
    }
    fn get_transaction(&self, hash: B256) -> Result<Option<TransactionRecord>> {
        self.inner.get_transaction(hash)
    }
    fn insert_logs(&self, logs: &[LogRecord]) -> Result<()> {
        self.inner.insert_logs(logs)
    }
    fn get_logs_by_block(&self, height: u64) -> Result<Vec<LogRecord>> {
        self.inner.get_logs_by_block(height)
    }
    fn get_contract(&self, addr: Address) -> Result<Option<ContractRecord>> {
        self.inner.get_contract(addr)
    }
    fn insert_contract(&self, contract: &ContractRecord) -> Result<()> {
        self.inner.insert_contract(contract)
    }
    fn get_abi_by_type(&self, kind: &str) -> Result<Option<String>> {
        self.inner.get_abi_by_type(kind)
    }
    fn put_abi_by_type(&self, kind: &str, abi: &str) -> Result<()> {
        self.inner.put_abi_by_type(kind, abi)
    }
    fn upsert_addresses(&self, addrs: &[AddressRecord]) -> Result<()> {
        self.inner.upsert_addresses(addrs)
    }
    fn get_address(&self, addr: Address) -> Result<Option<AddressRecord>> {
        self.inner.get_address(addr)
    }
    fn count_addresses(&self) -> Result<u64> {
        self.inner.count_addresses()
    }
    fn count_contracts(&self) -> Result<u64> {
        self.inner.count_contracts()
    }
    fn count_blocks_by_proposer(&self, proposer: Address) -> Result<u64> {
        self.inner.count_blocks_by_proposer(proposer)
    }
    fn upsert_validator(&self, validator: &ValidatorRecord) -> Result<()> {
        self.inner.upsert_validator(validator)
    }
    fn get_validators(&self) -> Result<Vec<ValidatorRecord>> {
        self.inner.get_validators()
    }
}
