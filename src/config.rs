//! Pipeline configuration and validator-name loading
//!
//! [`PipelineConfig`] carries worker cadences and thresholds. Validator
//! display names are loaded from a plain text file.

use crate::records::ValidatorRecord;
use alloy_primitives::Address;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Worker cadences and thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Listener poll interval
    pub listen_interval: Duration,
    /// Backfill worker poll interval
    pub backfill_interval: Duration,
    /// Verifier worker poll interval
    pub verify_interval: Duration,
    /// Number of ancestors checked behind every new head
    pub ancestor_window: u64,
    /// Heights drained from a queue per tick
    pub batch_size: usize,
    /// Consecutive failures after which a height is skipped
    pub skip_threshold: u32,
    /// Upper bound of the backfill backoff after failing ticks
    pub max_backoff: Duration,
    /// Mirror imported blocks into the cache
    pub mirror_blocks: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            listen_interval: Duration::from_secs(1),
            backfill_interval: Duration::from_secs(1),
            verify_interval: Duration::from_secs(5),
            ancestor_window: 10,
            batch_size: 10,
            skip_threshold: 3,
            max_backoff: Duration::from_secs(30),
            mirror_blocks: true,
        }
    }
}

/// Load validator display names from a file.
///
/// Each line holds an address (hex, with or without 0x prefix) followed by
/// whitespace and the display name, which may itself contain spaces.
/// Empty lines and lines starting with '#' are ignored.
///
/// # Example file format:
/// ```text
/// 0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb Validator One
/// # This is a comment
/// 0xdAC17F958D2ee523a2206206994597C13D831ec7 Second
/// ```
pub fn load_validator_names(path: &Path) -> Result<Vec<ValidatorRecord>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read validator names file: {:?}", path))?;

    let mut validators = Vec::new();
    for (line_num, line) in contents.lines().enumerate() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (addr, name) = line
            .split_once(char::is_whitespace)
            .with_context(|| format!("Missing validator name on line {}: {}", line_num + 1, line))?;
        let address = parse_address(addr)
            .with_context(|| format!("Invalid address on line {}: {}", line_num + 1, addr))?;

        validators.push(ValidatorRecord {
            address,
            name: name.trim().to_string(),
        });
    }

    Ok(validators)
}

/// Pad an odd-length hex string with a leading zero.
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

/// Parse an address from a hex string.
///
/// Accepts addresses with or without 0x prefix.
pub fn parse_address(s: &str) -> Result<Address> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let s = pad_hex_string(s);
    let bytes = hex::decode(&s).with_context(|| format!("Invalid hex address: {}", s))?;

    if bytes.len() != 20 {
        anyhow::bail!("Address must be 20 bytes (40 hex chars), got {} bytes", bytes.len());
    }

    Ok(Address::from_slice(&bytes))
}
