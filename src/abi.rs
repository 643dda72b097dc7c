//! ABI resolution and event decoding
//!
//! ABIs are stored base64-encoded JSON. [`AbiResolver`] finds the ABI of
//! a contract through three levels:
//!
//! 1. the ABI cached under the contract address
//! 2. the ABI embedded in the contract record
//! 3. the ABI shared by the contract's type tag, cached under the type and
//!    loaded from the store on a miss
//!
//! An embedded ABI is cached under the address. A type-resolved one only
//! caches a reference to its type there, so re-registering the shared ABI
//! of a type reaches every contract of that type. Either way the shared
//! ABI of a type is read from the store at most once.

use crate::cache::{abi_address_key, abi_type_key, Cache};
use crate::error::AbiError;
use crate::records::{DecodedEvent, DecodedParam, LogRecord};
use crate::store::Store;
use alloy_primitives::{keccak256, Address, B256, I256, U256};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Prefix of an address-level cache entry that points at a type tag.
/// Base64 never contains `@`.
const TYPE_REFERENCE: &str = "@type:";

/// Resolves contract ABIs through the cache and the store.
pub struct AbiResolver {
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
}

impl AbiResolver {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn Cache>) -> Self {
        Self { store, cache }
    }

    /// Resolve the base64 ABI of a contract.
    pub fn resolve(&self, address: Address) -> Result<String, AbiError> {
        let address_key = abi_address_key(address);
        if let Some(entry) = self.cached(&address_key) {
            return match entry.strip_prefix(TYPE_REFERENCE) {
                Some(kind) => self.resolve_type(address, kind),
                None => Ok(entry),
            };
        }

        let contract = self
            .store
            .get_contract(address)
            .map_err(AbiError::Store)?
            .ok_or(AbiError::NotFound(address))?;

        match contract.abi {
            Some(abi) => {
                self.remember(&address_key, &abi);
                Ok(abi)
            }
            None if !contract.kind.is_empty() => {
                let abi = self.resolve_type(address, &contract.kind)?;
                self.remember(&address_key, &format!("{}{}", TYPE_REFERENCE, contract.kind));
                Ok(abi)
            }
            None => Err(AbiError::NotFound(address)),
        }
    }

    fn resolve_type(&self, address: Address, kind: &str) -> Result<String, AbiError> {
        let type_key = abi_type_key(kind);
        if let Some(abi) = self.cached(&type_key) {
            return Ok(abi);
        }

        debug!(kind, "Loading shared ABI from store");
        let abi = self
            .store
            .get_abi_by_type(kind)
            .map_err(AbiError::Store)?
            .ok_or(AbiError::NotFound(address))?;
        self.remember(&type_key, &abi);
        Ok(abi)
    }

    fn cached(&self, key: &str) -> Option<String> {
        match self.cache.get_abi(key) {
            Ok(abi) => abi,
            Err(e) => {
                warn!(key, "Failed to read cached ABI: {:#}", e);
                None
            }
        }
    }

    fn remember(&self, key: &str, abi: &str) {
        if let Err(e) = self.cache.set_abi(key, abi) {
            warn!(key, "Failed to cache ABI: {:#}", e);
        }
    }
}

#[derive(Debug, Deserialize)]
struct AbiEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    inputs: Vec<AbiParam>,
    #[serde(default)]
    anonymous: bool,
}

#[derive(Debug, Deserialize)]
struct AbiParam {
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    indexed: bool,
    #[serde(default)]
    components: Vec<AbiParam>,
}

impl AbiParam {
    /// Canonical type as used in signatures: `uint` becomes `uint256`,
    /// tuples are spelled out.
    fn canonical_type(&self) -> String {
        if let Some(suffix) = self.kind.strip_prefix("tuple") {
            let inner: Vec<String> = self.components.iter().map(AbiParam::canonical_type).collect();
            return format!("({}){}", inner.join(","), suffix);
        }
        match self.kind.as_str() {
            "uint" => "uint256".to_string(),
            "int" => "int256".to_string(),
            other => other.to_string(),
        }
    }
}

/// Decode a base64 JSON ABI.
fn parse_abi(abi: &str) -> Result<Vec<AbiEntry>, AbiError> {
    let json = STANDARD
        .decode(abi.trim())
        .map_err(|e| AbiError::Decode(format!("invalid base64: {}", e)))?;
    serde_json::from_slice(&json).map_err(|e| AbiError::Decode(format!("invalid ABI JSON: {}", e)))
}

fn event_signature(entry: &AbiEntry) -> String {
    let types: Vec<String> = entry.inputs.iter().map(AbiParam::canonical_type).collect();
    format!("{}({})", entry.name, types.join(","))
}

/// Decode a log against a base64 JSON ABI.
///
/// The event is selected by matching keccak256 of its signature against
/// topic0. Indexed parameters come from the remaining topics; dynamic
/// indexed parameters only carry their hash. Non-indexed parameters are
/// decoded from the data section.
pub fn decode_log(abi: &str, log: &LogRecord) -> Result<DecodedEvent, AbiError> {
    let topic0 = log
        .topic0()
        .ok_or_else(|| AbiError::Decode("log has no topics".to_string()))?;

    let entries = parse_abi(abi)?;
    let (entry, signature) = entries
        .iter()
        .filter(|entry| entry.kind == "event" && !entry.anonymous)
        .map(|entry| (entry, event_signature(entry)))
        .find(|(_, signature)| keccak256(signature.as_bytes()) == topic0)
        .ok_or_else(|| AbiError::Decode(format!("no event matches topic0 {}", topic0)))?;

    let mut topics = log.topics.iter().skip(1);
    let mut head = 0;
    let mut params = Vec::with_capacity(entry.inputs.len());
    for input in &entry.inputs {
        let kind = input.canonical_type();
        let value = if input.indexed {
            let topic = topics.next().ok_or_else(|| {
                AbiError::Decode(format!("missing topic for indexed parameter {}", input.name))
            })?;
            if is_dynamic(&kind) {
                format!("0x{}", hex::encode(topic))
            } else {
                decode_word(&kind, &topic.0)?
            }
        } else {
            let value = decode_data_param(&kind, &log.data, head)?;
            head += 1;
            value
        };
        params.push(DecodedParam {
            name: input.name.clone(),
            kind,
            indexed: input.indexed,
            value,
        });
    }

    Ok(DecodedEvent {
        name: entry.name.clone(),
        signature,
        params,
    })
}

fn is_dynamic(kind: &str) -> bool {
    kind == "string" || kind == "bytes" || kind.ends_with(']') || kind.starts_with('(')
}

fn word_at(data: &[u8], index: usize) -> Result<[u8; 32], AbiError> {
    let start = index * 32;
    data.get(start..start + 32)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| AbiError::Decode(format!("data too short for word {}", index)))
}

fn decode_data_param(kind: &str, data: &[u8], head: usize) -> Result<String, AbiError> {
    let word = word_at(data, head)?;
    match kind {
        "string" | "bytes" => {
            let offset = usize::try_from(U256::from_be_bytes(word))
                .map_err(|_| AbiError::Decode("offset out of range".to_string()))?;
            if offset % 32 != 0 {
                return Err(AbiError::Decode(format!("unaligned offset {}", offset)));
            }
            let len_word = word_at(data, offset / 32)?;
            let len = usize::try_from(U256::from_be_bytes(len_word))
                .map_err(|_| AbiError::Decode("length out of range".to_string()))?;
            let start = offset + 32;
            let bytes = data
                .get(start..start.saturating_add(len))
                .ok_or_else(|| AbiError::Decode(format!("data too short for {} of {} bytes", kind, len)))?;
            if kind == "string" {
                Ok(String::from_utf8_lossy(bytes).into_owned())
            } else {
                Ok(format!("0x{}", hex::encode(bytes)))
            }
        }
        _ if is_dynamic(kind) => Err(AbiError::Decode(format!("unsupported parameter type {}", kind))),
        _ => decode_word(kind, &word),
    }
}

/// Render one static 32-byte word.
fn decode_word(kind: &str, word: &[u8; 32]) -> Result<String, AbiError> {
    if kind == "address" {
        return Ok(format!("0x{:x}", Address::from_slice(&word[12..])));
    }
    if kind == "bool" {
        return Ok((word[31] != 0).to_string());
    }
    if kind.starts_with("uint") {
        return Ok(U256::from_be_bytes(*word).to_string());
    }
    if kind.starts_with("int") {
        return Ok(I256::from_raw(U256::from_be_bytes(*word)).to_string());
    }
    if let Some(size) = kind.strip_prefix("bytes") {
        let size: usize = size
            .parse()
            .map_err(|_| AbiError::Decode(format!("unsupported parameter type {}", kind)))?;
        if size == 0 || size > 32 {
            return Err(AbiError::Decode(format!("unsupported parameter type {}", kind)));
        }
        return Ok(format!("0x{}", hex::encode(&word[..size])));
    }
    Err(AbiError::Decode(format!("unsupported parameter type {}", kind)))
}

/// Hash of an event signature, i.e. the topic0 of its logs.
pub fn event_topic(signature: &str) -> B256 {
    keccak256(signature.as_bytes())
}
