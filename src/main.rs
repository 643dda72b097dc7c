//! keeperctl - chain indexer operator tool
//!
//! Inspects the indexer's RocksDB store and cache, and performs manual
//! repairs such as re-queueing skipped heights or registering type ABIs.

use chainkeeper::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
