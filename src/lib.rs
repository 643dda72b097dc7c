//! chainkeeper - EVM chain indexer
//!
//! Follows the head of an EVM chain and keeps a persistent index of its
//! blocks, transactions, logs, addresses and contracts. Independent workers
//! share a [`store::Store`] and coordinate only through the mailboxes of a
//! [`cache::Cache`]:
//!
//! - the [`listener::Listener`] imports each new head and queues gaps
//! - the [`backfill::BackfillWorker`] retries failed heights
//! - the [`verifier::VerifierWorker`] repairs blocks that differ from a
//!   trusted node
//! - the [`events::EventProcessor`] decodes and stores contract events

pub mod abi;
pub mod backfill;
pub mod cache;
pub mod chain;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod fee;
pub mod importer;
pub mod keys;
pub mod listener;
pub mod metrics;
pub mod records;
pub mod retry;
pub mod rpc;
pub mod store;
pub mod tracker;
pub mod types;
pub mod verifier;

#[cfg(test)]
mod testutil;

// Re-export the main types for convenience
pub use backfill::{BackfillSettings, BackfillWorker};
pub use error::{AbiError, ImportError, VerifyError};
pub use importer::Importer;
pub use listener::Listener;
pub use metrics::{Metrics, MetricsSnapshot};
pub use records::{
    AddressRecord, BlockRecord, ContractRecord, DecodedEvent, LogRecord, TransactionRecord,
    ValidatorRecord,
};
pub use retry::RetryPolicy;
pub use store::{RocksStore, Store};
pub use verifier::VerifierWorker;
