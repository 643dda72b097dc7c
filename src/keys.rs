//! Key encoding and decoding utilities
//!
//! All keys use a single-byte prefix followed by binary data.
//! Heights and sequence numbers are big-endian so that RocksDB's
//! lexicographic order matches numeric order.

use alloy_primitives::{Address, B256};
use anyhow::Result;

/// Encode a block key.
///
/// Format: byte 'B' (0x42) + height (8 bytes, big-endian)
/// Total length: 9 bytes
pub fn encode_block_key(height: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(b'B');
    key.extend_from_slice(&height.to_be_bytes());
    key
}

/// Encode a transaction key.
///
/// Format: byte 'T' (0x54) + tx_hash (32 bytes)
/// Total length: 33 bytes
pub fn encode_tx_key(hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b'T');
    key.extend_from_slice(hash.as_slice());
    key
}

/// Encode a log key.
///
/// Format: byte 'L' (0x4C) + height (8 bytes) + tx_index (8 bytes) + log_index (8 bytes)
/// Total length: 25 bytes. All logs of one block share the 9-byte prefix
/// returned by [`encode_log_prefix`].
pub fn encode_log_key(height: u64, tx_index: u64, log_index: u64) -> Vec<u8> {
    let mut key = encode_log_prefix(height);
    key.reserve(16);
    key.extend_from_slice(&tx_index.to_be_bytes());
    key.extend_from_slice(&log_index.to_be_bytes());
    key
}

/// Encode the per-block prefix of log keys.
pub fn encode_log_prefix(height: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(25);
    key.push(b'L');
    key.extend_from_slice(&height.to_be_bytes());
    key
}

/// Encode an address key.
///
/// Format: byte 'A' (0x41) + address (20 bytes)
pub fn encode_address_key(addr: Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(b'A');
    key.extend_from_slice(addr.as_slice());
    key
}

/// Encode a contract key.
///
/// Format: byte 'C' (0x43) + address (20 bytes)
pub fn encode_contract_key(addr: Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(b'C');
    key.extend_from_slice(addr.as_slice());
    key
}

/// Encode a validator key.
///
/// Format: byte 'V' (0x56) + address (20 bytes)
pub fn encode_validator_key(addr: Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(b'V');
    key.extend_from_slice(addr.as_slice());
    key
}

/// Encode the key of a shared ABI for a contract type tag.
///
/// Format: byte 'Y' (0x59) + UTF-8 type tag
pub fn encode_abi_type_key(kind: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + kind.len());
    key.push(b'Y');
    key.extend_from_slice(kind.as_bytes());
    key
}

/// Encode a proposer index key.
///
/// Format: byte 'P' (0x50) + proposer (20 bytes) + height (8 bytes, big-endian)
/// Total length: 29 bytes. Prefix-scanning the first 21 bytes counts the
/// blocks proposed by one address.
pub fn encode_proposer_key(proposer: Address, height: u64) -> Vec<u8> {
    let mut key = encode_proposer_prefix(proposer);
    key.extend_from_slice(&height.to_be_bytes());
    key
}

/// Encode the per-proposer prefix of proposer index keys.
pub fn encode_proposer_prefix(proposer: Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(29);
    key.push(b'P');
    key.extend_from_slice(proposer.as_slice());
    key
}

/// Encode a queue slot key.
///
/// Format: byte 'Q' (0x51) + sequence (8 bytes, big-endian)
pub fn encode_queue_slot_key(seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(b'Q');
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Encode a queue membership key.
///
/// Format: byte 'M' (0x4D) + queued value bytes
pub fn encode_queue_member_key(value: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + value.len());
    key.push(b'M');
    key.extend_from_slice(value);
    key
}

/// Encode a skip list key.
///
/// Format: byte 'S' (0x53) + height (8 bytes, big-endian)
pub fn encode_skip_key(height: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(b'S');
    key.extend_from_slice(&height.to_be_bytes());
    key
}

/// Encode a cache entry key for an arbitrary string key.
///
/// Format: given prefix byte + UTF-8 key
pub fn encode_named_key(prefix: u8, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(prefix);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Encode a meta key.
///
/// Format: byte 'X' (0x58) + meta_id (1 byte)
///
/// Meta IDs:
/// - 0x01: queue head sequence
/// - 0x02: queue tail sequence
pub fn encode_meta_key(meta_id: u8) -> Vec<u8> {
    vec![b'X', meta_id]
}

/// Decode the height from a 9-byte prefix + height key.
pub fn decode_height_key(key: &[u8]) -> Result<u64> {
    if key.len() != 9 {
        anyhow::bail!("Height key must be 9 bytes, got {}", key.len());
    }
    Ok(u64::from_be_bytes(key[1..9].try_into()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256};

    #[test]
    fn test_block_key_encoding() {
        let key = encode_block_key(12345);
        assert_eq!(key.len(), 9);
        assert_eq!(key[0], b'B');
        assert_eq!(decode_height_key(&key).unwrap(), 12345);
    }

    #[test]
    fn test_block_keys_sort_numerically() {
        assert!(encode_block_key(255) < encode_block_key(256));
        assert!(encode_queue_slot_key(1) < encode_queue_slot_key(u64::MAX / 2));
    }

    #[test]
    fn test_tx_key_encoding() {
        let hash = b256!("0000000000000000000000000000000000000000000000000000000000000001");
        let key = encode_tx_key(hash);
        assert_eq!(key.len(), 33);
        assert_eq!(key[0], b'T');
        assert_eq!(&key[1..], hash.as_slice());
    }

    #[test]
    fn test_log_key_encoding() {
        let key = encode_log_key(10, 2, 3);
        assert_eq!(key.len(), 25);
        assert!(key.starts_with(&encode_log_prefix(10)));
        assert_eq!(&key[17..], &3u64.to_be_bytes());
    }

    #[test]
    fn test_proposer_key_encoding() {
        let addr = address!("0742d35Cc6634C0532925a3b844Bc9e7595f0bEb");
        let key = encode_proposer_key(addr, 99);
        assert_eq!(key.len(), 29);
        assert!(key.starts_with(&encode_proposer_prefix(addr)));
        assert_eq!(&key[1..21], addr.as_slice());
    }

    #[test]
    fn test_queue_member_key_encoding() {
        let key = encode_queue_member_key(&7u64.to_be_bytes());
        assert_eq!(key.len(), 9);
        assert_eq!(key[0], b'M');
        assert_eq!(decode_height_key(&key).unwrap(), 7);
    }

    #[test]
    fn test_named_key_encoding() {
        let key = encode_named_key(b'K', "abi#type#KRC20");
        assert_eq!(key[0], b'K');
        assert_eq!(&key[1..], b"abi#type#KRC20");
    }

    #[test]
    fn test_decode_rejects_short_key() {
        assert!(decode_height_key(&[b'B', 0, 1]).is_err());
    }
}
