//! Lifetime counters for an [`Engine`](crate::Engine).
//!
//! Counters are lock-free and updated with relaxed atomics; a
//! [`CounterSnapshot`] is a plain copy suitable for logging or serialization.

use crate::{ConversionStats, PackingStats};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter metric (monotonically increasing).
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Increment the counter.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Add a value to the counter.
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset the counter.
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Totals across every call made on one engine.
#[derive(Debug, Default)]
pub struct EngineCounters {
    /// Rows converted.
    pub rows_converted: Counter,
    /// Rows replaced by the default record.
    pub malformed_records: Counter,
    /// Text fields cut by the budget.
    pub truncated_fields: Counter,
    /// Examples offered to the packer.
    pub examples_packed: Counter,
    /// Examples longer than a block.
    pub overflowed_examples: Counter,
    /// Blocks emitted.
    pub blocks_emitted: Counter,
}

/// Point-in-time copy of [`EngineCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Rows converted.
    pub rows_converted: u64,
    /// Rows replaced by the default record.
    pub malformed_records: u64,
    /// Text fields cut by the budget.
    pub truncated_fields: u64,
    /// Examples offered to the packer.
    pub examples_packed: u64,
    /// Examples longer than a block.
    pub overflowed_examples: u64,
    /// Blocks emitted.
    pub blocks_emitted: u64,
}

impl EngineCounters {
    /// Add the result of one conversion call.
    pub fn record_conversion(&self, stats: &ConversionStats) {
        self.rows_converted.add(stats.rows as u64);
        self.malformed_records.add(stats.malformed as u64);
        self.truncated_fields.add(stats.truncated_fields as u64);
    }

    /// Add the result of one packing call.
    pub fn record_packing(&self, stats: &PackingStats) {
        self.examples_packed.add(stats.num_examples as u64);
        self.overflowed_examples.add(stats.overflowed() as u64);
        self.blocks_emitted.add(stats.num_blocks as u64);
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            rows_converted: self.rows_converted.get(),
            malformed_records: self.malformed_records.get(),
            truncated_fields: self.truncated_fields.get(),
            examples_packed: self.examples_packed.get(),
            overflowed_examples: self.overflowed_examples.get(),
            blocks_emitted: self.blocks_emitted.get(),
        }
    }

    /// Reset every counter.
    pub fn reset(&self) {
        self.rows_converted.reset();
        self.malformed_records.reset();
        self.truncated_fields.reset();
        self.examples_packed.reset();
        self.overflowed_examples.reset();
        self.blocks_emitted.reset();
    }
}
