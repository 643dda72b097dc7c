//! Topic handler registry
//!
//! Decoded logs are routed by their signature topic to every handler
//! registered for it. Handlers run independently: one failing handler is
//! logged and does not stop the others. A log may be delivered more than
//! once, so handlers must be idempotent.

use crate::abi::event_topic;
use crate::records::{DecodedEvent, LogRecord};
use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Handles decoded logs carrying one signature topic.
pub trait TopicHandler: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &'static str;

    /// Signature hash this handler subscribes to.
    fn topic(&self) -> B256;

    fn handle(&self, log: &LogRecord, event: &DecodedEvent) -> Result<()>;
}

/// Handlers keyed by topic0.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<B256, Vec<Box<dyn TopicHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Box<dyn TopicHandler>) {
        debug!(handler = handler.name(), topic = %handler.topic(), "Registered topic handler");
        self.handlers.entry(handler.topic()).or_default().push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every handler registered for the log's topic0. Returns how many
    /// handlers succeeded.
    pub fn dispatch(&self, log: &LogRecord, event: &DecodedEvent) -> usize {
        let Some(handlers) = log.topic0().and_then(|topic| self.handlers.get(&topic)) else {
            return 0;
        };

        let mut handled = 0;
        for handler in handlers {
            match handler.handle(log, event) {
                Ok(()) => handled += 1,
                Err(e) => warn!(
                    handler = handler.name(),
                    tx = %log.tx_hash,
                    log_index = log.log_index,
                    "Topic handler failed: {:#}",
                    e
                ),
            }
        }
        handled
    }
}

/// Tracks the holders of every token that emits `Transfer` events.
///
/// Mints (from the zero address) and burns (to the zero address) only
/// record the non-zero side.
pub struct TransferHandler {
    topic: B256,
    holders: Mutex<HashMap<Address, BTreeSet<Address>>>,
}

impl TransferHandler {
    pub const SIGNATURE: &'static str = "Transfer(address,address,uint256)";

    pub fn new() -> Self {
        Self {
            topic: event_topic(Self::SIGNATURE),
            holders: Mutex::new(HashMap::new()),
        }
    }

    /// Known holders of a token, in address order.
    pub fn holders(&self, token: Address) -> Vec<Address> {
        self.holders
            .lock()
            .map(|holders| {
                holders
                    .get(&token)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

impl Default for TransferHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn param_address(event: &DecodedEvent, position: usize) -> Result<Address> {
    let param = event
        .params
        .get(position)
        .with_context(|| format!("{} has no parameter {}", event.signature, position))?;
    param
        .value
        .parse()
        .with_context(|| format!("Invalid address in {}: {}", param.name, param.value))
}

impl TopicHandler for TransferHandler {
    fn name(&self) -> &'static str {
        "transfer"
    }

    fn topic(&self) -> B256 {
        self.topic
    }

    fn handle(&self, log: &LogRecord, event: &DecodedEvent) -> Result<()> {
        if event.signature != Self::SIGNATURE {
            anyhow::bail!("Unexpected event {}", event.signature);
        }
        let from = param_address(event, 0)?;
        let to = param_address(event, 1)?;

        let mut holders = self
            .holders
            .lock()
            .map_err(|_| anyhow::anyhow!("Transfer holders lock poisoned"))?;
        let token = holders.entry(log.address).or_default();
        for holder in [from, to] {
            if holder != Address::ZERO {
                token.insert(holder);
            }
        }
        Ok(())
    }
}
