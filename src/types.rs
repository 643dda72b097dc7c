//! JSON-RPC types
//!
//! Type definitions for blocks, transactions, receipts and logs
//! returned from EVM-compatible JSON-RPC endpoints, plus their
//! conversion into the records persisted by the pipeline.

use crate::records::{BlockRecord, LogRecord, ReceiptRecord, TransactionRecord};
use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Deserializer};

/// Block with full transaction details.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcBlock {
    /// Block number (hex string in JSON, parsed to u64)
    #[serde(rename = "number", deserialize_with = "deserialize_hex_u64")]
    pub number: u64,

    /// Block hash (hex string in JSON)
    #[serde(rename = "hash", deserialize_with = "deserialize_hex_b256")]
    pub hash: B256,

    /// Parent block hash (hex string in JSON)
    #[serde(rename = "parentHash", deserialize_with = "deserialize_hex_b256")]
    pub parent_hash: B256,

    /// Block timestamp (hex string in JSON)
    #[serde(rename = "timestamp", deserialize_with = "deserialize_hex_u64")]
    pub timestamp: u64,

    /// Block proposer (hex string in JSON)
    #[serde(rename = "miner", deserialize_with = "deserialize_hex_address")]
    pub miner: Address,

    /// Gas used by all transactions (hex string in JSON)
    #[serde(rename = "gasUsed", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub gas_used: Option<u64>,

    /// List of transactions in the block
    #[serde(rename = "transactions", default)]
    pub transactions: Vec<RpcTransaction>,
}

impl RpcBlock {
    /// Convert into a block record carrying the given receipts.
    ///
    /// Transactions are left unmerged; the importer fills in status,
    /// gas used, fee and logs from the receipts.
    pub fn into_record(self, receipts: Vec<RpcReceipt>) -> BlockRecord {
        let timestamp = self.timestamp;
        let block_hash = self.hash;
        let receipts = receipts
            .into_iter()
            .map(|receipt| receipt.into_record(timestamp))
            .collect();
        let transactions = self
            .transactions
            .into_iter()
            .enumerate()
            .map(|(position, tx)| tx.into_record(self.number, block_hash, position as u64, timestamp))
            .collect::<Vec<_>>();

        BlockRecord {
            height: self.number,
            hash: self.hash,
            parent_hash: self.parent_hash,
            timestamp,
            proposer: self.miner,
            num_txs: transactions.len() as u64,
            gas_used: self.gas_used.unwrap_or(0),
            transactions,
            receipts,
        }
    }
}

/// Transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcTransaction {
    /// Transaction hash (hex string in JSON)
    #[serde(rename = "hash", deserialize_with = "deserialize_hex_b256")]
    pub hash: B256,

    /// Sender address (hex string in JSON)
    #[serde(rename = "from", deserialize_with = "deserialize_hex_address")]
    pub from: Address,

    /// Recipient address (None for contract creation, hex string in JSON)
    #[serde(rename = "to", default, deserialize_with = "deserialize_hex_address_opt")]
    pub to: Option<Address>,

    /// Value transferred (hex string in JSON)
    #[serde(rename = "value", deserialize_with = "deserialize_hex_u256")]
    pub value: U256,

    /// Gas price (hex string in JSON)
    #[serde(rename = "gasPrice", default, deserialize_with = "deserialize_hex_u256_opt")]
    pub gas_price: Option<U256>,

    /// Gas limit (hex string in JSON)
    #[serde(rename = "gas", deserialize_with = "deserialize_hex_u64")]
    pub gas: u64,

    /// Transaction input data (hex string in JSON, "0x" for simple transfers)
    #[serde(rename = "input", deserialize_with = "deserialize_hex_bytes")]
    pub input: Vec<u8>,

    /// Containing block (null for pending transactions)
    #[serde(rename = "blockNumber", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub block_number: Option<u64>,

    /// Position within the block (null for pending transactions)
    #[serde(rename = "transactionIndex", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub transaction_index: Option<u64>,
}

impl RpcTransaction {
    /// Convert into an unmerged transaction record.
    pub fn into_record(
        self,
        block_height: u64,
        block_hash: B256,
        position: u64,
        timestamp: u64,
    ) -> TransactionRecord {
        TransactionRecord {
            hash: self.hash,
            block_height,
            block_hash,
            index: self.transaction_index.unwrap_or(position),
            timestamp,
            from: self.from,
            to: self.to,
            contract_address: None,
            value: self.value,
            gas_limit: self.gas,
            gas_price: self.gas_price.unwrap_or(U256::ZERO),
            gas_used: U256::ZERO,
            input: self.input,
            status: 0,
            tx_fee: String::new(),
            logs: Vec::new(),
        }
    }
}

/// Log entry emitted by a contract during transaction execution.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcLog {
    /// Address of the contract that emitted the log
    #[serde(rename = "address", deserialize_with = "deserialize_hex_address")]
    pub address: Address,

    /// Indexed topics (topic0 = event signature, topics[1..] = indexed params)
    #[serde(rename = "topics", default, deserialize_with = "deserialize_hex_b256_vec")]
    pub topics: Vec<B256>,

    /// Non-indexed event data (hex string)
    #[serde(rename = "data", deserialize_with = "deserialize_hex_bytes")]
    pub data: Vec<u8>,

    #[serde(rename = "blockNumber", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub block_number: Option<u64>,

    #[serde(rename = "blockHash", default, deserialize_with = "deserialize_hex_b256_opt")]
    pub block_hash: Option<B256>,

    #[serde(rename = "transactionHash", default, deserialize_with = "deserialize_hex_b256_opt")]
    pub transaction_hash: Option<B256>,

    #[serde(rename = "transactionIndex", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub transaction_index: Option<u64>,

    #[serde(rename = "logIndex", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub log_index: Option<u64>,

    /// True when the log was removed by a chain reorganization
    #[serde(rename = "removed", default)]
    pub removed: bool,
}

impl RpcLog {
    /// Convert into an undecoded log record.
    pub fn into_record(self, timestamp: u64) -> LogRecord {
        LogRecord {
            address: self.address,
            topics: self.topics,
            data: self.data,
            block_height: self.block_number.unwrap_or(0),
            block_hash: self.block_hash.unwrap_or(B256::ZERO),
            tx_hash: self.transaction_hash.unwrap_or(B256::ZERO),
            tx_index: self.transaction_index.unwrap_or(0),
            log_index: self.log_index.unwrap_or(0),
            removed: self.removed,
            timestamp,
            decoded: None,
        }
    }
}

/// Transaction receipt.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcReceipt {
    /// Hash of the transaction (hex string in JSON)
    #[serde(rename = "transactionHash", deserialize_with = "deserialize_hex_b256")]
    pub transaction_hash: B256,

    /// Transaction status: 1 = success, 0 = failure (hex string in JSON)
    #[serde(rename = "status", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub status: Option<u64>,

    /// Gas used (hex string in JSON)
    #[serde(rename = "gasUsed", deserialize_with = "deserialize_hex_u256")]
    pub gas_used: U256,

    /// Created contract, for contract-creation transactions
    #[serde(rename = "contractAddress", default, deserialize_with = "deserialize_hex_address_opt")]
    pub contract_address: Option<Address>,

    /// Logs emitted during transaction execution (empty for reverted txs)
    #[serde(rename = "logs", default)]
    pub logs: Vec<RpcLog>,
}

impl RpcReceipt {
    /// Convert into a receipt record.
    pub fn into_record(self, timestamp: u64) -> ReceiptRecord {
        ReceiptRecord {
            transaction_hash: self.transaction_hash,
            status: self.status.unwrap_or(0),
            gas_used: self.gas_used,
            contract_address: self.contract_address,
            logs: self
                .logs
                .into_iter()
                .map(|log| log.into_record(timestamp))
                .collect(),
        }
    }
}

// Hex deserialization helpers

/// Pad an odd-length hex string with a leading zero.
/// This handles cases where RPC returns hex strings without leading zeros.
fn pad_hex_string(s: &str) -> String {
    if s.is_empty() {
        return s.to_string();
    }
    if s.len() % 2 == 1 {
        format!("0{}", s)
    } else {
        s.to_string()
    }
}

/// Parse a hex quantity string into a u64.
pub fn parse_hex_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16)
}

/// Parse a hex quantity string into a U256.
pub fn parse_hex_u256(s: &str) -> Result<U256, hex::FromHexError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(U256::ZERO);
    }
    let bytes = hex::decode(pad_hex_string(s))?;
    if bytes.len() > 32 {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    Ok(U256::from_be_slice(&bytes))
}

fn parse_hex_fixed<const N: usize>(s: &str) -> Result<[u8; N], String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(pad_hex_string(s)).map_err(|e| e.to_string())?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| format!("Expected {} bytes, got {}", N, bytes.len()))
}

/// Deserialize a hex string to u64.
fn deserialize_hex_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_hex_u64(&s).map_err(serde::de::Error::custom)
}

/// Deserialize an optional hex string to u64.
fn deserialize_hex_u64_opt<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => parse_hex_u64(&s).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Deserialize a hex string to U256.
fn deserialize_hex_u256<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_hex_u256(&s).map_err(serde::de::Error::custom)
}

/// Deserialize an optional hex string to U256.
fn deserialize_hex_u256_opt<'de, D>(deserializer: D) -> Result<Option<U256>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => parse_hex_u256(&s).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Deserialize a hex string to B256.
fn deserialize_hex_b256<'de, D>(deserializer: D) -> Result<B256, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_hex_fixed::<32>(&s)
        .map(B256::from)
        .map_err(serde::de::Error::custom)
}

/// Deserialize an optional hex string to B256.
fn deserialize_hex_b256_opt<'de, D>(deserializer: D) -> Result<Option<B256>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => parse_hex_fixed::<32>(&s)
            .map(|bytes| Some(B256::from(bytes)))
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Deserialize a list of hex strings to B256 topics.
fn deserialize_hex_b256_vec<'de, D>(deserializer: D) -> Result<Vec<B256>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<String>::deserialize(deserializer)?
        .iter()
        .map(|s| parse_hex_fixed::<32>(s).map(B256::from))
        .collect::<Result<_, _>>()
        .map_err(serde::de::Error::custom)
}

/// Deserialize a hex string to Address.
fn deserialize_hex_address<'de, D>(deserializer: D) -> Result<Address, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_hex_fixed::<20>(&s)
        .map(Address::from)
        .map_err(serde::de::Error::custom)
}

/// Deserialize an optional hex string to Address.
///
/// Null, missing and empty strings all map to None.
fn deserialize_hex_address_opt<'de, D>(deserializer: D) -> Result<Option<Address>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) if !s.strip_prefix("0x").unwrap_or(&s).is_empty() => parse_hex_fixed::<20>(&s)
            .map(|bytes| Some(Address::from(bytes)))
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

/// Deserialize a hex string to bytes.
fn deserialize_hex_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let s = s.strip_prefix("0x").unwrap_or(&s);
    if s.is_empty() {
        Ok(Vec::new())
    } else {
        hex::decode(pad_hex_string(s)).map_err(serde::de::Error::custom)
    }
}
