//! JSON-RPC client for EVM nodes
//!
//! Provides a typed interface to a single JSON-RPC endpoint.
//! Handles hex string parsing and error handling.

use crate::types::{parse_hex_u256, parse_hex_u64, RpcBlock, RpcLog, RpcReceipt, RpcTransaction};
use alloy_primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use serde_json::{json, Value};

/// JSON-RPC client for one node endpoint.
#[derive(Clone)]
pub struct RpcClient {
    client: reqwest::Client,
    url: String,
}

impl RpcClient {
    /// Create a new RPC client.
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    /// Endpoint URL this client talks to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Make a JSON-RPC call.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request to {}", method, self.url))?;

        let json: Value = response
            .json()
            .await
            .context("Failed to parse RPC response")?;

        // Check for RPC error
        if let Some(error) = json.get("error") {
            anyhow::bail!("RPC error from {}: {}", method, error);
        }

        // Extract result
        json.get("result")
            .cloned()
            .context("RPC response missing 'result' field")
    }

    /// Get the latest block number.
    pub async fn get_block_number(&self) -> Result<u64> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        let number = result
            .as_str()
            .context("Block number response is not a string")?;
        parse_hex_u64(number).context("Failed to parse block number")
    }

    /// Get a block by number with full transaction details.
    ///
    /// Returns None when the node does not know the block yet.
    pub async fn get_block_by_number(&self, height: u64) -> Result<Option<RpcBlock>> {
        let params = json!([format!("0x{:x}", height), true]);
        let result = self.call("eth_getBlockByNumber", params).await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .with_context(|| format!("Failed to deserialize block {}", height))
    }

    /// Get a transaction receipt by hash.
    pub async fn get_transaction_receipt(&self, tx_hash: B256) -> Result<Option<RpcReceipt>> {
        let params = json!([format!("0x{:x}", tx_hash)]);
        let result = self.call("eth_getTransactionReceipt", params).await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .context("Failed to deserialize receipt")
    }

    /// Get a transaction by hash.
    pub async fn get_transaction_by_hash(&self, tx_hash: B256) -> Result<Option<RpcTransaction>> {
        let params = json!([format!("0x{:x}", tx_hash)]);
        let result = self.call("eth_getTransactionByHash", params).await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .context("Failed to deserialize transaction")
    }

    /// Get the latest balance of an address.
    pub async fn get_balance(&self, address: Address) -> Result<U256> {
        let params = json!([format!("0x{:x}", address), "latest"]);
        let result = self.call("eth_getBalance", params).await?;

        let balance = result
            .as_str()
            .context("Balance response is not a string")?;
        tracing::trace!("RPC get_balance({:?}) returned raw: {}", address, balance);
        parse_hex_u256(balance).context("Failed to decode balance hex")
    }

    /// Get the latest code at an address.
    ///
    /// Returns empty Vec for EOA addresses, contract bytecode for contracts.
    pub async fn get_code(&self, address: Address) -> Result<Vec<u8>> {
        let params = json!([format!("0x{:x}", address), "latest"]);
        let result = self.call("eth_getCode", params).await?;

        let code = result
            .as_str()
            .context("Code response is not a string")?;
        let code = code.strip_prefix("0x").unwrap_or(code);
        if code.is_empty() {
            return Ok(Vec::new());
        }

        // Handle odd-length hex strings by padding with a leading zero
        let code = if code.len() % 2 == 1 {
            format!("0{}", code)
        } else {
            code.to_string()
        };
        hex::decode(&code).context("Failed to decode code hex")
    }

    /// Get logs in an inclusive block range, optionally filtered by
    /// emitting addresses and topic0 values.
    pub async fn get_logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[Address],
        topics: &[B256],
    ) -> Result<Vec<RpcLog>> {
        let mut filter = json!({
            "fromBlock": format!("0x{:x}", from),
            "toBlock": format!("0x{:x}", to),
        });
        if !addresses.is_empty() {
            let addresses: Vec<String> = addresses.iter().map(|a| format!("0x{:x}", a)).collect();
            filter["address"] = json!(addresses);
        }
        if !topics.is_empty() {
            let topics: Vec<String> = topics.iter().map(|t| format!("0x{:x}", t)).collect();
            filter["topics"] = json!([topics]);
        }

        let result = self.call("eth_getLogs", json!([filter])).await?;
        serde_json::from_value(result)
            .with_context(|| format!("Failed to deserialize logs for blocks {}..={}", from, to))
    }
}
