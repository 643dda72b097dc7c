//! Pipeline metrics
//!
//! Lock-free counters and gauges shared by every worker. A
//! [`MetricsSnapshot`] is a serializable point-in-time copy.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Shared metrics provider.
#[derive(Debug, Default)]
pub struct Metrics {
    processing_ms: AtomicU64,
    scraping_ms: AtomicU64,
    indexing_ms: AtomicU64,
    latest_height: AtomicU64,
    todo_length: AtomicU64,
    reorg_count: AtomicU64,
    invalid_block_count: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Duration of the last block import, in milliseconds
    pub processing_ms: u64,
    /// Duration of the last listener tick, in milliseconds
    pub scraping_ms: u64,
    /// Duration of the last event processing pass, in milliseconds
    pub indexing_ms: u64,
    pub latest_height: u64,
    /// Heights waiting in the error queue
    pub todo_length: u64,
    pub reorg_count: u64,
    pub invalid_block_count: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processing(&self, elapsed: Duration) {
        self.processing_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_scraping(&self, elapsed: Duration) {
        self.scraping_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_indexing(&self, elapsed: Duration) {
        self.indexing_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record the chain head. Never moves backwards.
    pub fn set_latest_height(&self, height: u64) {
        self.latest_height.fetch_max(height, Ordering::Relaxed);
    }

    pub fn latest_height(&self) -> u64 {
        self.latest_height.load(Ordering::Relaxed)
    }

    pub fn set_todo_length(&self, len: u64) {
        self.todo_length.store(len, Ordering::Relaxed);
    }

    pub fn incr_reorg_count(&self) {
        self.reorg_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_invalid_block_count(&self) {
        self.invalid_block_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processing_ms: self.processing_ms.load(Ordering::Relaxed),
            scraping_ms: self.scraping_ms.load(Ordering::Relaxed),
            indexing_ms: self.indexing_ms.load(Ordering::Relaxed),
            latest_height: self.latest_height.load(Ordering::Relaxed),
            todo_length: self.todo_length.load(Ordering::Relaxed),
            reorg_count: self.reorg_count.load(Ordering::Relaxed),
            invalid_block_count: self.invalid_block_count.load(Ordering::Relaxed),
        }
    }
}
