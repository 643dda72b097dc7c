//! Cache trait and implementations
//!
//! The cache holds derived accelerators (counters, ABIs, mirrored blocks)
//! and the durable mailboxes the workers coordinate through:
//!
//! - error queue: heights that failed to import. LIFO, so a height that is
//!   re-queued after a failure is the next one popped.
//! - unverified queue: heights waiting for a canonical cross-check. FIFO.
//! - skip list: heights excluded from automatic retry.
//! - receipt queue: receipt hashes announced to downstream consumers.
//!   Bounded: once more than the receipt capacity are waiting, the oldest
//!   hashes are dropped.
//!
//! Both queues de-duplicate: pushing a height that is already queued is a
//! no-op and returns `false`.

use crate::keys::{
    decode_height_key, encode_address_key, encode_block_key, encode_meta_key,
    encode_named_key, encode_queue_member_key, encode_queue_slot_key, encode_skip_key,
};
use crate::records::BlockRecord;
use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Counter holding the total number of imported transactions.
pub const TOTAL_TXS: &str = "total_txs";
/// Counter holding the number of known addresses.
pub const TOTAL_ADDRESSES: &str = "total_addresses";
/// Counter holding the number of known contracts.
pub const TOTAL_CONTRACTS: &str = "total_contracts";

/// Number of most recent blocks kept by the block mirror.
pub const MIRROR_DEPTH: u64 = 128;

/// Default number of receipt hashes kept waiting for a consumer.
pub const RECEIPT_QUEUE_DEPTH: u64 = 100_000;

/// Cache key of the ABI resolved for one contract address.
pub fn abi_address_key(addr: Address) -> String {
    format!("abi#0x{:x}", addr)
}

/// Cache key of the ABI shared by every contract of a type tag.
pub fn abi_type_key(kind: &str) -> String {
    format!("abi#type#{}", kind)
}

/// Trait defining the interface for the cache and work queues.
pub trait Cache: Send + Sync {
    /// Queue a height for backfill at the front of the error queue.
    fn push_error_height(&self, height: u64) -> Result<bool>;

    /// Pop the most recently queued error height.
    fn pop_error_height(&self) -> Result<Option<u64>>;

    /// Number of heights in the error queue.
    fn error_queue_len(&self) -> Result<u64>;

    /// Add a height to the permanent skip list.
    fn push_skip_height(&self, height: u64) -> Result<()>;

    /// Remove a height from the skip list. Returns false if it was absent.
    fn remove_skip_height(&self, height: u64) -> Result<bool>;

    /// Check whether a height is on the skip list.
    fn is_skipped(&self, height: u64) -> Result<bool>;

    /// All skipped heights in ascending order.
    fn skip_heights(&self) -> Result<Vec<u64>>;

    /// Queue a height for verification at the back of the unverified queue.
    fn push_unverified_height(&self, height: u64) -> Result<bool>;

    /// Pop the oldest unverified height.
    fn pop_unverified_height(&self) -> Result<Option<u64>>;

    /// Number of heights in the unverified queue.
    fn unverified_queue_len(&self) -> Result<u64>;

    /// Get a cached base64 ABI.
    fn get_abi(&self, key: &str) -> Result<Option<String>>;

    /// Cache a base64 ABI.
    fn set_abi(&self, key: &str, abi: &str) -> Result<()>;

    /// Drop a cached ABI entry.
    fn remove_abi(&self, key: &str) -> Result<()>;

    /// Add to the total transaction counter, returning the new total.
    fn incr_total_txs(&self, by: u64) -> Result<u64>;

    /// Overwrite the total address counter.
    fn set_total_addresses(&self, total: u64) -> Result<()>;

    /// Overwrite the total contract counter.
    fn set_total_contracts(&self, total: u64) -> Result<()>;

    /// Read a named counter, 0 when unset.
    fn counter(&self, name: &str) -> Result<u64>;

    /// Cached number of blocks proposed by an address.
    fn proposer_block_count(&self, proposer: Address) -> Result<Option<u64>>;

    /// Cache the number of blocks proposed by an address.
    fn set_proposer_block_count(&self, proposer: Address, count: u64) -> Result<()>;

    /// Announce processed receipt hashes, dropping the oldest ones beyond
    /// the receipt capacity.
    fn push_receipt_hashes(&self, hashes: &[B256]) -> Result<()>;

    /// Take up to `max` of the oldest announced receipt hashes.
    fn pop_receipt_hashes(&self, max: usize) -> Result<Vec<B256>>;

    /// Number of announced receipt hashes not yet consumed.
    fn receipt_queue_len(&self) -> Result<u64>;

    /// Mirror a block, keeping only the most recent [`MIRROR_DEPTH`] heights.
    fn mirror_block(&self, block: &BlockRecord) -> Result<()>;

    /// Get a mirrored block.
    fn mirrored_block(&self, height: u64) -> Result<Option<BlockRecord>>;
}

#[derive(Default)]
struct DedupQueue<T> {
    items: VecDeque<T>,
    members: HashSet<T>,
}

impl<T: Copy + Eq + std::hash::Hash> DedupQueue<T> {
    fn push(&mut self, value: T, front: bool) -> bool {
        if !self.members.insert(value) {
            return false;
        }
        if front {
            self.items.push_front(value);
        } else {
            self.items.push_back(value);
        }
        true
    }

    fn pop(&mut self) -> Option<T> {
        let value = self.items.pop_front()?;
        self.members.remove(&value);
        Some(value)
    }

    fn len(&self) -> u64 {
        self.items.len() as u64
    }
}

#[derive(Default)]
struct MemoryState {
    errors: DedupQueue<u64>,
    unverified: DedupQueue<u64>,
    receipts: DedupQueue<B256>,
    skipped: BTreeSet<u64>,
    abis: HashMap<String, String>,
    counters: HashMap<String, u64>,
    proposers: HashMap<Address, u64>,
    blocks: BTreeMap<u64, BlockRecord>,
}

/// In-process cache.
///
/// Nothing survives a restart; use [`RocksCache`] when the queues must be
/// durable.
pub struct MemoryCache {
    state: Mutex<MemoryState>,
    receipt_capacity: u64,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            receipt_capacity: RECEIPT_QUEUE_DEPTH,
        }
    }
}

impl MemoryCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override how many receipt hashes may wait in the receipt queue.
    pub fn with_receipt_capacity(mut self, capacity: u64) -> Self {
        self.receipt_capacity = capacity;
        self
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory cache lock poisoned"))
    }
}

impl Cache for MemoryCache {
    fn push_error_height(&self, height: u64) -> Result<bool> {
        Ok(self.state()?.errors.push(height, true))
    }

    fn pop_error_height(&self) -> Result<Option<u64>> {
        Ok(self.state()?.errors.pop())
    }

    fn error_queue_len(&self) -> Result<u64> {
        Ok(self.state()?.errors.len())
    }

    fn push_skip_height(&self, height: u64) -> Result<()> {
        self.state()?.skipped.insert(height);
        Ok(())
    }

    fn remove_skip_height(&self, height: u64) -> Result<bool> {
        Ok(self.state()?.skipped.remove(&height))
    }

    fn is_skipped(&self, height: u64) -> Result<bool> {
        Ok(self.state()?.skipped.contains(&height))
    }

    fn skip_heights(&self) -> Result<Vec<u64>> {
        Ok(self.state()?.skipped.iter().copied().collect())
    }

    fn push_unverified_height(&self, height: u64) -> Result<bool> {
        Ok(self.state()?.unverified.push(height, false))
    }

    fn pop_unverified_height(&self) -> Result<Option<u64>> {
        Ok(self.state()?.unverified.pop())
    }

    fn unverified_queue_len(&self) -> Result<u64> {
        Ok(self.state()?.unverified.len())
    }

    fn get_abi(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state()?.abis.get(key).cloned())
    }

    fn set_abi(&self, key: &str, abi: &str) -> Result<()> {
        self.state()?.abis.insert(key.to_string(), abi.to_string());
        Ok(())
    }

    fn remove_abi(&self, key: &str) -> Result<()> {
        self.state()?.abis.remove(key);
        Ok(())
    }

    fn incr_total_txs(&self, by: u64) -> Result<u64> {
        let mut state = self.state()?;
        let total = state.counters.entry(TOTAL_TXS.to_string()).or_insert(0);
        *total += by;
        Ok(*total)
    }

    fn set_total_addresses(&self, total: u64) -> Result<()> {
        self.state()?.counters.insert(TOTAL_ADDRESSES.to_string(), total);
        Ok(())
    }

    fn set_total_contracts(&self, total: u64) -> Result<()> {
        self.state()?.counters.insert(TOTAL_CONTRACTS.to_string(), total);
        Ok(())
    }

    fn counter(&self, name: &str) -> Result<u64> {
        Ok(self.state()?.counters.get(name).copied().unwrap_or(0))
    }

    fn proposer_block_count(&self, proposer: Address) -> Result<Option<u64>> {
        Ok(self.state()?.proposers.get(&proposer).copied())
    }

    fn set_proposer_block_count(&self, proposer: Address, count: u64) -> Result<()> {
        self.state()?.proposers.insert(proposer, count);
        Ok(())
    }

    fn push_receipt_hashes(&self, hashes: &[B256]) -> Result<()> {
        let mut state = self.state()?;
        for hash in hashes {
            state.receipts.push(*hash, false);
        }
        while state.receipts.len() > self.receipt_capacity {
            state.receipts.pop();
        }
        Ok(())
    }

    fn pop_receipt_hashes(&self, max: usize) -> Result<Vec<B256>> {
        let mut state = self.state()?;
        Ok((0..max).map_while(|_| state.receipts.pop()).collect())
    }

    fn receipt_queue_len(&self) -> Result<u64> {
        Ok(self.state()?.receipts.len())
    }

    fn mirror_block(&self, block: &BlockRecord) -> Result<()> {
        let mut state = self.state()?;
        state.blocks.insert(block.height, block.clone());
        let floor = block.height.saturating_sub(MIRROR_DEPTH - 1);
        let kept = state.blocks.split_off(&floor);
        state.blocks = kept;
        Ok(())
    }

    fn mirrored_block(&self, height: u64) -> Result<Option<BlockRecord>> {
        Ok(self.state()?.blocks.get(&height).cloned())
    }
}

/// Sequence number both queue ends start from, so that front pushes
/// never underflow.
const QUEUE_ORIGIN: u64 = 1 << 63;
const META_HEAD: u8 = 0x01;
const META_TAIL: u8 = 0x02;

/// RocksDB-backed cache.
///
/// Every queue lives in its own column family as a contiguous run of
/// slot keys between the head and tail sequence numbers, plus one
/// membership key per queued value for de-duplication. Queue state
/// survives restarts, which is what makes the pipeline restart-safe.
///
/// Column families:
/// - error_queue, unverified_queue, receipt_queue: durable queues
/// - skip: skip list
/// - abi: cached ABIs
/// - counters: named counters and proposer block counts
/// - blocks: mirrored recent blocks
pub struct RocksCache {
    db: DB,
    queue_lock: Mutex<()>,
    receipt_capacity: u64,
}

impl RocksCache {
    /// Open or create a RocksDB cache at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let column_families = vec![
            ColumnFamilyDescriptor::new("error_queue", Options::default()),
            ColumnFamilyDescriptor::new("unverified_queue", Options::default()),
            ColumnFamilyDescriptor::new("receipt_queue", Options::default()),
            ColumnFamilyDescriptor::new("skip", Options::default()),
            ColumnFamilyDescriptor::new("abi", Options::default()),
            ColumnFamilyDescriptor::new("counters", Options::default()),
            ColumnFamilyDescriptor::new("blocks", Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, column_families)
            .context("Failed to open RocksDB cache")?;

        Ok(Self {
            db,
            queue_lock: Mutex::new(()),
            receipt_capacity: RECEIPT_QUEUE_DEPTH,
        })
    }

    /// Override how many receipt hashes may wait in the receipt queue.
    pub fn with_receipt_capacity(mut self, capacity: u64) -> Self {
        self.receipt_capacity = capacity;
        self
    }

    /// Get a column family handle by name.
    fn get_cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .with_context(|| format!("Column family '{}' not found", name))
    }

    /// Serialize read-modify-write sequences on queues and counters.
    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.queue_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Cache queue lock poisoned"))
    }

    fn read_u64(&self, cf: &rocksdb::ColumnFamily, key: &[u8]) -> Result<Option<u64>> {
        match self.db.get_cf(cf, key).context("Failed to read cache value")? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .context("Cache integer must be 8 bytes")?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn queue_bounds(&self, cf: &rocksdb::ColumnFamily) -> Result<(u64, u64)> {
        let head = self
            .read_u64(cf, &encode_meta_key(META_HEAD))?
            .unwrap_or(QUEUE_ORIGIN);
        let tail = self
            .read_u64(cf, &encode_meta_key(META_TAIL))?
            .unwrap_or(QUEUE_ORIGIN);
        Ok((head, tail))
    }

    fn queue_push(&self, cf_name: &str, value: &[u8], front: bool) -> Result<bool> {
        let _guard = self.lock()?;
        let cf = self.get_cf(cf_name)?;
        let member_key = encode_queue_member_key(value);
        if self
            .db
            .get_pinned_cf(cf, &member_key)
            .context("Failed to check queue membership")?
            .is_some()
        {
            return Ok(false);
        }

        let (head, tail) = self.queue_bounds(cf)?;
        let mut batch = WriteBatch::default();
        let seq = if front {
            let seq = head - 1;
            batch.put_cf(cf, encode_meta_key(META_HEAD), seq.to_be_bytes());
            seq
        } else {
            batch.put_cf(cf, encode_meta_key(META_TAIL), (tail + 1).to_be_bytes());
            tail
        };
        batch.put_cf(cf, encode_queue_slot_key(seq), value);
        batch.put_cf(cf, member_key, seq.to_be_bytes());
        self.db.write(batch).with_context(|| format!("Failed to push onto {}", cf_name))?;
        Ok(true)
    }

    fn queue_pop(&self, cf_name: &str) -> Result<Option<Vec<u8>>> {
        let _guard = self.lock()?;
        let cf = self.get_cf(cf_name)?;
        let (head, tail) = self.queue_bounds(cf)?;
        if head >= tail {
            return Ok(None);
        }

        let slot_key = encode_queue_slot_key(head);
        let value = self
            .db
            .get_cf(cf, &slot_key)
            .with_context(|| format!("Failed to read head of {}", cf_name))?
            .with_context(|| format!("Queue {} is missing slot {}", cf_name, head))?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf, slot_key);
        batch.delete_cf(cf, encode_queue_member_key(&value));
        batch.put_cf(cf, encode_meta_key(META_HEAD), (head + 1).to_be_bytes());
        self.db.write(batch).with_context(|| format!("Failed to pop from {}", cf_name))?;
        Ok(Some(value))
    }

    fn queue_len(&self, cf_name: &str) -> Result<u64> {
        let cf = self.get_cf(cf_name)?;
        let (head, tail) = self.queue_bounds(cf)?;
        Ok(tail.saturating_sub(head))
    }

    fn pop_height(&self, cf_name: &str) -> Result<Option<u64>> {
        match self.queue_pop(cf_name)? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .context("Queued height must be 8 bytes")?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn put_counter(&self, name: &str, value: u64) -> Result<()> {
        let cf = self.get_cf("counters")?;
        self.db
            .put_cf(cf, encode_named_key(b'N', name), value.to_be_bytes())
            .with_context(|| format!("Failed to set counter {}", name))?;
        Ok(())
    }
}

impl Cache for RocksCache {
    fn push_error_height(&self, height: u64) -> Result<bool> {
        self.queue_push("error_queue", &height.to_be_bytes(), true)
    }

    fn pop_error_height(&self) -> Result<Option<u64>> {
        self.pop_height("error_queue")
    }

    fn error_queue_len(&self) -> Result<u64> {
        self.queue_len("error_queue")
    }

    fn push_skip_height(&self, height: u64) -> Result<()> {
        let cf = self.get_cf("skip")?;
        self.db
            .put_cf(cf, encode_skip_key(height), b"")
            .context("Failed to put skip height")?;
        Ok(())
    }

    fn remove_skip_height(&self, height: u64) -> Result<bool> {
        let existed = self.is_skipped(height)?;
        if existed {
            let cf = self.get_cf("skip")?;
            self.db
                .delete_cf(cf, encode_skip_key(height))
                .context("Failed to delete skip height")?;
        }
        Ok(existed)
    }

    fn is_skipped(&self, height: u64) -> Result<bool> {
        let cf = self.get_cf("skip")?;
        let found = self
            .db
            .get_pinned_cf(cf, encode_skip_key(height))
            .context("Failed to check skip list")?;
        Ok(found.is_some())
    }

    fn skip_heights(&self) -> Result<Vec<u64>> {
        let cf = self.get_cf("skip")?;
        let mut heights = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item.context("Failed to read iterator")?;
            heights.push(decode_height_key(&key)?);
        }
        Ok(heights)
    }

    fn push_unverified_height(&self, height: u64) -> Result<bool> {
        self.queue_push("unverified_queue", &height.to_be_bytes(), false)
    }

    fn pop_unverified_height(&self) -> Result<Option<u64>> {
        self.pop_height("unverified_queue")
    }

    fn unverified_queue_len(&self) -> Result<u64> {
        self.queue_len("unverified_queue")
    }

    fn get_abi(&self, key: &str) -> Result<Option<String>> {
        let cf = self.get_cf("abi")?;
        match self
            .db
            .get_cf(cf, encode_named_key(b'K', key))
            .context("Failed to get cached ABI")?
        {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes).context("Cached ABI is not valid UTF-8")?,
            )),
            None => Ok(None),
        }
    }

    fn set_abi(&self, key: &str, abi: &str) -> Result<()> {
        let cf = self.get_cf("abi")?;
        self.db
            .put_cf(cf, encode_named_key(b'K', key), abi.as_bytes())
            .context("Failed to cache ABI")?;
        Ok(())
    }

    fn remove_abi(&self, key: &str) -> Result<()> {
        let cf = self.get_cf("abi")?;
        self.db
            .delete_cf(cf, encode_named_key(b'K', key))
            .context("Failed to drop cached ABI")?;
        Ok(())
    }

    fn incr_total_txs(&self, by: u64) -> Result<u64> {
        let _guard = self.lock()?;
        let total = self.counter(TOTAL_TXS)? + by;
        self.put_counter(TOTAL_TXS, total)?;
        Ok(total)
    }

    fn set_total_addresses(&self, total: u64) -> Result<()> {
        self.put_counter(TOTAL_ADDRESSES, total)
    }

    fn set_total_contracts(&self, total: u64) -> Result<()> {
        self.put_counter(TOTAL_CONTRACTS, total)
    }

    fn counter(&self, name: &str) -> Result<u64> {
        let cf = self.get_cf("counters")?;
        Ok(self.read_u64(cf, &encode_named_key(b'N', name))?.unwrap_or(0))
    }

    fn proposer_block_count(&self, proposer: Address) -> Result<Option<u64>> {
        let cf = self.get_cf("counters")?;
        self.read_u64(cf, &encode_address_key(proposer))
    }

    fn set_proposer_block_count(&self, proposer: Address, count: u64) -> Result<()> {
        let cf = self.get_cf("counters")?;
        self.db
            .put_cf(cf, encode_address_key(proposer), count.to_be_bytes())
            .context("Failed to set proposer block count")?;
        Ok(())
    }

    fn push_receipt_hashes(&self, hashes: &[B256]) -> Result<()> {
        for hash in hashes {
            self.queue_push("receipt_queue", hash.as_slice(), false)?;
        }
        let overflow = self
            .queue_len("receipt_queue")?
            .saturating_sub(self.receipt_capacity);
        for _ in 0..overflow {
            self.queue_pop("receipt_queue")?;
        }
        Ok(())
    }

    fn pop_receipt_hashes(&self, max: usize) -> Result<Vec<B256>> {
        let mut hashes = Vec::new();
        while hashes.len() < max {
            let Some(bytes) = self.queue_pop("receipt_queue")? else {
                break;
            };
            if bytes.len() != 32 {
                anyhow::bail!("Queued receipt hash must be 32 bytes, got {}", bytes.len());
            }
            hashes.push(B256::from_slice(&bytes));
        }
        Ok(hashes)
    }

    fn receipt_queue_len(&self) -> Result<u64> {
        self.queue_len("receipt_queue")
    }

    fn mirror_block(&self, block: &BlockRecord) -> Result<()> {
        let cf = self.get_cf("blocks")?;
        let value = postcard::to_allocvec(block).context("Failed to serialize mirrored block")?;
        let floor = block.height.saturating_sub(MIRROR_DEPTH - 1);

        let mut batch = WriteBatch::default();
        batch.put_cf(cf, encode_block_key(block.height), value);
        if floor > 0 {
            batch.delete_range_cf(cf, encode_block_key(0), encode_block_key(floor));
        }
        self.db.write(batch).context("Failed to mirror block")?;
        Ok(())
    }

    fn mirrored_block(&self, height: u64) -> Result<Option<BlockRecord>> {
        let cf = self.get_cf("blocks")?;
        match self
            .db
            .get_cf(cf, encode_block_key(height))
            .context("Failed to get mirrored block")?
        {
            Some(bytes) => Ok(Some(
                postcard::from_bytes(&bytes).context("Failed to deserialize mirrored block")?,
            )),
            None => Ok(None),
        }
    }
}
