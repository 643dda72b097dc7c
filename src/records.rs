//! Record types for indexed chain data
//!
//! These structs represent the data persisted in the store and passed
//! between the workers. They use postcard for binary serialization,
//! which is compact and deterministic.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

/// A block together with its transactions and receipts.
///
/// `transactions` and `receipts` are only populated on blocks fetched from
/// the chain. Blocks read back from the store carry their merged
/// transactions and an empty receipt list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Block height (unique key)
    pub height: u64,
    /// Block hash
    pub hash: B256,
    /// Parent block hash
    pub parent_hash: B256,
    /// Block timestamp (Unix epoch seconds)
    pub timestamp: u64,
    /// Address of the validator that proposed the block
    pub proposer: Address,
    /// Transaction count declared by the node
    pub num_txs: u64,
    /// Total gas used by the block
    pub gas_used: u64,
    /// Ordered transactions
    pub transactions: Vec<TransactionRecord>,
    /// Ordered receipts
    pub receipts: Vec<ReceiptRecord>,
}

impl BlockRecord {
    /// Hashes of the block's transactions, in block order.
    pub fn tx_hashes(&self) -> Vec<B256> {
        self.transactions.iter().map(|tx| tx.hash).collect()
    }
}

/// Block row as stored: header fields plus the ordered transaction hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRow {
    pub height: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
    pub proposer: Address,
    pub num_txs: u64,
    pub gas_used: u64,
    pub tx_hashes: Vec<B256>,
}

impl From<&BlockRecord> for BlockRow {
    fn from(block: &BlockRecord) -> Self {
        Self {
            height: block.height,
            hash: block.hash,
            parent_hash: block.parent_hash,
            timestamp: block.timestamp,
            proposer: block.proposer,
            num_txs: block.num_txs,
            gas_used: block.gas_used,
            tx_hashes: block.tx_hashes(),
        }
    }
}

impl BlockRow {
    /// Reassemble a block record from the row and its stored transactions.
    pub fn into_record(self, transactions: Vec<TransactionRecord>) -> BlockRecord {
        BlockRecord {
            height: self.height,
            hash: self.hash,
            parent_hash: self.parent_hash,
            timestamp: self.timestamp,
            proposer: self.proposer,
            num_txs: self.num_txs,
            gas_used: self.gas_used,
            transactions,
            receipts: Vec::new(),
        }
    }
}

/// A transaction, merged with its receipt once imported.
///
/// `status`, `gas_used`, `tx_fee` and `logs` are derived from the receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction hash
    pub hash: B256,
    /// Height of the containing block
    pub block_height: u64,
    /// Hash of the containing block
    pub block_hash: B256,
    /// Position within the block
    pub index: u64,
    /// Timestamp of the containing block
    pub timestamp: u64,
    /// Sender address
    pub from: Address,
    /// Recipient address (None for contract creation)
    pub to: Option<Address>,
    /// Created contract address (set on contract creation)
    pub contract_address: Option<Address>,
    /// Value transferred in hydro
    pub value: U256,
    /// Gas limit
    pub gas_limit: u64,
    /// Gas price
    pub gas_price: U256,
    /// Gas used (from the receipt)
    pub gas_used: U256,
    /// Call data
    pub input: Vec<u8>,
    /// Execution status: 1 = success, 0 = failure or not yet merged
    pub status: u64,
    /// `gas_price * gas_used` as an exact decimal string
    pub tx_fee: String,
    /// Logs emitted by the transaction (from the receipt)
    pub logs: Vec<LogRecord>,
}

impl TransactionRecord {
    /// Check if the transaction created a contract.
    pub fn is_contract_creation(&self) -> bool {
        self.contract_address.is_some()
    }
}

/// Execution receipt of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub transaction_hash: B256,
    pub status: u64,
    pub gas_used: U256,
    pub contract_address: Option<Address>,
    pub logs: Vec<LogRecord>,
}

/// A log event emitted by a contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Emitting contract
    pub address: Address,
    /// Indexed topics (topic0 = event signature hash)
    pub topics: Vec<B256>,
    /// Non-indexed event data
    pub data: Vec<u8>,
    pub block_height: u64,
    pub block_hash: B256,
    pub tx_hash: B256,
    pub tx_index: u64,
    pub log_index: u64,
    /// Set when the log was dropped by a reorg
    pub removed: bool,
    /// Timestamp of the containing block, 0 when unknown
    pub timestamp: u64,
    /// Decoded event, None when no ABI could be resolved
    pub decoded: Option<DecodedEvent>,
}

impl LogRecord {
    /// Event signature hash, if the log has topics.
    pub fn topic0(&self) -> Option<B256> {
        self.topics.first().copied()
    }
}

/// Event decoded against a contract ABI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedEvent {
    /// Event name, e.g. `Transfer`
    pub name: String,
    /// Canonical signature, e.g. `Transfer(address,address,uint256)`
    pub signature: String,
    pub params: Vec<DecodedParam>,
}

/// One decoded event argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedParam {
    pub name: String,
    /// Solidity type, e.g. `uint256`
    pub kind: String,
    pub indexed: bool,
    /// Rendered value (decimal for integers, 0x-hex otherwise)
    pub value: String,
}

/// Address record, re-derived on every batch touching the address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub address: Address,
    pub is_contract: bool,
    /// Exact balance in hydro, decimal string
    pub balance: String,
    /// Balance scaled by 10^18, for display only
    pub balance_float: f64,
    /// Display name, overridden by known validator names
    pub name: String,
    /// Height of the block that last touched the address
    pub updated_at: u64,
}

/// Contract detected from a contract-creation transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRecord {
    pub address: Address,
    pub bytecode: Vec<u8>,
    pub owner: Address,
    /// Hash of the creating transaction
    pub tx_hash: B256,
    /// Timestamp of the creating block
    pub created_at: u64,
    /// Type tag (e.g. `KRC20`), empty when unknown
    pub kind: String,
    /// Embedded ABI, base64-encoded JSON
    pub abi: Option<String>,
    pub verified: bool,
}

impl ContractRecord {
    /// A freshly detected, unverified contract of unknown type.
    pub fn detected(address: Address, owner: Address, tx_hash: B256, created_at: u64) -> Self {
        Self {
            address,
            bytecode: Vec::new(),
            owner,
            tx_hash,
            created_at,
            kind: String::new(),
            abi: None,
            verified: false,
        }
    }
}

/// Known validator and its display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRecord {
    pub address: Address,
    pub name: String,
}
