//! Typed errors for outcomes callers branch on
//!
//! Everything else flows through `anyhow` with context.

use alloy_primitives::Address;
use thiserror::Error;

/// Outcome of a failed block import.
#[derive(Debug, Error)]
pub enum ImportError {
    /// The height is already stored. Callers treat this as success.
    #[error("block {0} already exists")]
    AlreadyExists(u64),

    /// A store write or read failed; the import did not complete.
    #[error("store error: {0:#}")]
    Store(anyhow::Error),
}

impl ImportError {
    /// Whether the error is the benign "already imported" case.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ImportError::AlreadyExists(_))
    }
}

/// Failure to resolve or apply a contract ABI.
#[derive(Debug, Error)]
pub enum AbiError {
    /// No ABI is known for the contract, either embedded or by type.
    #[error("no ABI found for contract 0x{0:x}")]
    NotFound(Address),

    #[error("store error: {0:#}")]
    Store(anyhow::Error),

    /// The ABI is malformed or does not describe the log.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Failure to verify a height against the canonical node.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The canonical node could not serve the block; the height was re-queued.
    #[error("canonical fetch of block {height} failed: {source:#}")]
    CanonicalFetch {
        height: u64,
        source: anyhow::Error,
    },

    /// The stored block differed and the repair itself failed.
    #[error("repair of block {height} failed: {source}")]
    Repair {
        height: u64,
        source: ImportError,
    },

    #[error("store error: {0:#}")]
    Store(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn test_already_exists_is_benign() {
        assert!(ImportError::AlreadyExists(5).is_already_exists());
        assert!(!ImportError::Store(anyhow::anyhow!("disk full")).is_already_exists());
    }

    #[test]
    fn test_error_messages() {
        let err = ImportError::Store(anyhow::anyhow!("disk full").context("Failed to put block"));
        assert_eq!(err.to_string(), "store error: Failed to put block: disk full");

        let err = AbiError::NotFound(address!("00000000000000000000000000000000000000aa"));
        assert_eq!(
            err.to_string(),
            "no ABI found for contract 0x00000000000000000000000000000000000000aa"
        );
    }
}
