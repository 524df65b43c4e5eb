//! Consensus loop performance counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ConsensusPerformanceCounter {
    processed_blocks: AtomicU64,
    rejected_blocks: AtomicU64,
    processed_transactions: AtomicU64,
    processed_inputs: AtomicU64,
    header_us: AtomicU64,
    body_us: AtomicU64,
    fetch_us: AtomicU64,
    execution_us: AtomicU64,
    persist_us: AtomicU64,
    total_us: AtomicU64,
}

/// Timings of one accepted block, in microseconds.
#[derive(Clone, Debug, Default)]
pub struct BlockTimings {
    pub header_us: u64,
    pub body_us: u64,
    pub fetch_us: u64,
    pub execution_us: u64,
    pub persist_us: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsensusPerformanceSnapshot {
    pub processed_blocks: u64,
    pub rejected_blocks: u64,
    pub processed_transactions: u64,
    pub processed_inputs: u64,
    pub header_us: u64,
    pub body_us: u64,
    pub fetch_us: u64,
    pub execution_us: u64,
    pub persist_us: u64,
    pub total_us: u64,
}

pub fn micros(elapsed: Duration) -> u64 {
    elapsed.as_micros() as u64
}

impl ConsensusPerformanceCounter {
    pub fn record_block(&self, transactions: u64, inputs: u64, timings: &BlockTimings) {
        self.processed_blocks.fetch_add(1, Ordering::Relaxed);
        self.processed_transactions
            .fetch_add(transactions, Ordering::Relaxed);
        self.processed_inputs.fetch_add(inputs, Ordering::Relaxed);
        self.header_us.fetch_add(timings.header_us, Ordering::Relaxed);
        self.body_us.fetch_add(timings.body_us, Ordering::Relaxed);
        self.fetch_us.fetch_add(timings.fetch_us, Ordering::Relaxed);
        self.execution_us
            .fetch_add(timings.execution_us, Ordering::Relaxed);
        self.persist_us
            .fetch_add(timings.persist_us, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_total(&self, elapsed: Duration) {
        self.total_us.fetch_add(micros(elapsed), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsensusPerformanceSnapshot {
        ConsensusPerformanceSnapshot {
            processed_blocks: self.processed_blocks.load(Ordering::Relaxed),
            rejected_blocks: self.rejected_blocks.load(Ordering::Relaxed),
            processed_transactions: self.processed_transactions.load(Ordering::Relaxed),
            processed_inputs: self.processed_inputs.load(Ordering::Relaxed),
            header_us: self.header_us.load(Ordering::Relaxed),
            body_us: self.body_us.load(Ordering::Relaxed),
            fetch_us: self.fetch_us.load(Ordering::Relaxed),
            execution_us: self.execution_us.load(Ordering::Relaxed),
            persist_us: self.persist_us.load(Ordering::Relaxed),
            total_us: self.total_us.load(Ordering::Relaxed),
        }
    }
}

impl ConsensusPerformanceSnapshot {
    /// Counter growth since `earlier`.
    pub fn since(&self, earlier: &Self) -> Self {
        Self {
            processed_blocks: self.processed_blocks.saturating_sub(earlier.processed_blocks),
            rejected_blocks: self.rejected_blocks.saturating_sub(earlier.rejected_blocks),
            processed_transactions: self
                .processed_transactions
                .saturating_sub(earlier.processed_transactions),
            processed_inputs: self.processed_inputs.saturating_sub(earlier.processed_inputs),
            header_us: self.header_us.saturating_sub(earlier.header_us),
            body_us: self.body_us.saturating_sub(earlier.body_us),
            fetch_us: self.fetch_us.saturating_sub(earlier.fetch_us),
            execution_us: self.execution_us.saturating_sub(earlier.execution_us),
            persist_us: self.persist_us.saturating_sub(earlier.persist_us),
            total_us: self.total_us.saturating_sub(earlier.total_us),
        }
    }

    pub fn average_block_ms(&self) -> f64 {
        if self.processed_blocks == 0 {
            return 0.0;
        }
        self.total_us as f64 / self.processed_blocks as f64 / 1_000.0
    }
}
