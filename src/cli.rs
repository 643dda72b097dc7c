//! CLI implementation for keeperctl
//!
//! Operator interface over the indexer's store and cache. All commands
//! output pretty JSON. The daemon holds the database locks while it runs,
//! so keeperctl is meant for a stopped daemon.

use crate::cache::{
    abi_address_key, abi_type_key, Cache, RocksCache, TOTAL_ADDRESSES, TOTAL_CONTRACTS,
    TOTAL_TXS,
};
use crate::config::{load_validator_names, parse_address};
use crate::records::ValidatorRecord;
use crate::store::{RocksStore, Store};
use alloy_primitives::B256;
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;

/// Chain indexer operator tool
#[derive(Parser)]
#[command(name = "keeperctl")]
#[command(about = "Inspect and repair the chain indexer database")]
pub struct Cli {
    /// Path to the RocksDB store directory
    #[arg(short, long, default_value = "./keeper_db")]
    db_path: PathBuf,

    /// Path to the RocksDB cache directory
    #[arg(short, long, default_value = "./keeper_cache")]
    cache_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Get a stored block with its transactions and logs
    GetBlock {
        /// Block height
        height: u64,
    },
    /// Get the latest stored block height
    GetHead,
    /// Get a transaction
    GetTx {
        /// Transaction hash (hex, with or without 0x prefix)
        hash: String,
    },
    /// Get a contract record
    GetContract {
        /// Contract address (hex, with or without 0x prefix)
        address: String,
    },
    /// Get an address record
    GetAddress {
        /// Address (hex, with or without 0x prefix)
        address: String,
    },
    /// Show queue lengths and the skip list
    Queues,
    /// Show the global counters
    Counters,
    /// Take the oldest announced receipt hashes off the receipt queue
    Receipts {
        /// Maximum number of hashes to take
        #[arg(long, default_value_t = 100)]
        max: usize,
    },
    /// Move a skipped height back onto the error queue
    Requeue {
        /// Block height
        height: u64,
    },
    /// Register the shared ABI of a contract type
    RegisterTypeAbi {
        /// Type tag, e.g. KRC20
        kind: String,
        /// Path to a JSON ABI file
        #[arg(long, conflicts_with = "base64")]
        file: Option<PathBuf>,
        /// Base64-encoded JSON ABI
        #[arg(long)]
        base64: Option<String>,
    },
    /// Set the type tag of a stored contract
    TagContract {
        /// Contract address (hex, with or without 0x prefix)
        address: String,
        /// Type tag, e.g. KRC20
        kind: String,
    },
    /// Register a validator display name
    RegisterValidator {
        /// Validator address (hex, with or without 0x prefix)
        address: String,
        /// Display name
        name: String,
    },
    /// Register every validator listed in a names file
    ImportValidators {
        /// File with one `address name` pair per line
        file: PathBuf,
    },
    /// List registered validators
    Validators,
}

/// Parse a hex string into a 32-byte hash.
fn parse_hash(s: &str) -> Result<B256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).with_context(|| format!("Invalid hex hash: {}", s))?;
    if bytes.len() != 32 {
        anyhow::bail!("Hash must be 32 bytes (64 hex chars), got {} bytes", bytes.len());
    }
    Ok(B256::from_slice(&bytes))
}

/// Base64-encode a JSON ABI after checking that it is a JSON array.
fn encode_abi(json_text: &str) -> Result<String> {
    let parsed: Value = serde_json::from_str(json_text).context("ABI is not valid JSON")?;
    if !parsed.is_array() {
        anyhow::bail!("ABI must be a JSON array");
    }
    Ok(STANDARD.encode(json_text.trim()))
}

/// Execute one command against the given store and cache.
pub fn execute(command: Commands, store: &dyn Store, cache: &dyn Cache) -> Result<Value> {
    let result = match command {
        Commands::GetBlock { height } => match store.get_block(height)? {
            Some(block) => json!({
                "height": height,
                "block": block,
                "logs": store.get_logs_by_block(height)?,
            }),
            None => json!({ "height": height, "block": null }),
        },
        Commands::GetHead => json!({ "latest_height": store.latest_block_height()? }),
        Commands::GetTx { hash } => {
            let hash = parse_hash(&hash)?;
            json!({
                "hash": format!("{:#x}", hash),
                "transaction": store.get_transaction(hash)?,
            })
        }
        Commands::GetContract { address } => {
            let addr = parse_address(&address)?;
            json!({
                "address": format!("{:#x}", addr),
                "contract": store.get_contract(addr)?,
            })
        }
        Commands::GetAddress { address } => {
            let addr = parse_address(&address)?;
            json!({
                "address": format!("{:#x}", addr),
                "record": store.get_address(addr)?,
                "blocks_proposed": store.count_blocks_by_proposer(addr)?,
            })
        }
        Commands::Queues => json!({
            "error_queue": cache.error_queue_len()?,
            "unverified_queue": cache.unverified_queue_len()?,
            "receipt_queue": cache.receipt_queue_len()?,
            "skipped": cache.skip_heights()?,
        }),
        Commands::Counters => json!({
            TOTAL_TXS: cache.counter(TOTAL_TXS)?,
            TOTAL_ADDRESSES: cache.counter(TOTAL_ADDRESSES)?,
            TOTAL_CONTRACTS: cache.counter(TOTAL_CONTRACTS)?,
            "stored_addresses": store.count_addresses()?,
            "stored_contracts": store.count_contracts()?,
        }),
        Commands::Receipts { max } => {
            let hashes: Vec<String> = cache
                .pop_receipt_hashes(max)?
                .into_iter()
                .map(|hash| format!("{:#x}", hash))
                .collect();
            json!({
                "receipts": hashes,
                "remaining": cache.receipt_queue_len()?,
            })
        }
        Commands::Requeue { height } => {
            let was_skipped = cache.remove_skip_height(height)?;
            let queued = cache.push_error_height(height)?;
            json!({
                "status": "ok",
                "height": height,
                "was_skipped": was_skipped,
                "queued": queued,
            })
        }
        Commands::RegisterTypeAbi { kind, file, base64 } => {
            let abi = match (file, base64) {
                (Some(path), None) => {
                    let text = fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read ABI file {:?}", path))?;
                    encode_abi(&text)?
                }
                (None, Some(encoded)) => {
                    let bytes = STANDARD.decode(encoded.trim()).context("Invalid base64 ABI")?;
                    let text = String::from_utf8(bytes).context("ABI is not UTF-8")?;
                    encode_abi(&text)?
                }
                _ => anyhow::bail!("Pass exactly one of --file or --base64"),
            };
            store.put_abi_by_type(&kind, &abi)?;
            cache.set_abi(&abi_type_key(&kind), &abi)?;
            json!({ "status": "ok", "kind": kind, "abi_length": abi.len() })
        }
        Commands::TagContract { address, kind } => {
            let addr = parse_address(&address)?;
            let mut contract = store
                .get_contract(addr)?
                .with_context(|| format!("No contract stored at {:#x}", addr))?;
            contract.kind = kind;
            store.insert_contract(&contract)?;
            cache.remove_abi(&abi_address_key(addr))?;
            json!({ "status": "ok", "contract": contract })
        }
        Commands::RegisterValidator { address, name } => {
            let validator = ValidatorRecord {
                address: parse_address(&address)?,
                name,
            };
            store.upsert_validator(&validator)?;
            json!({ "status": "ok", "validator": validator })
        }
        Commands::ImportValidators { file } => {
            let validators = load_validator_names(&file)?;
            for validator in &validators {
                store.upsert_validator(validator)?;
            }
            json!({ "status": "ok", "imported": validators.len() })
        }
        Commands::Validators => json!({ "validators": store.get_validators()? }),
    };
    Ok(result)
}

/// Run the CLI command and print JSON output.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let store = RocksStore::open(&cli.db_path)
        .with_context(|| format!("Failed to open database at {:?}", cli.db_path))?;
    let cache = RocksCache::open(&cli.cache_path)
        .with_context(|| format!("Failed to open cache at {:?}", cli.cache_path))?;

    let result = execute(cli.command, &store, &cache)?;

    // Pretty print JSON
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
