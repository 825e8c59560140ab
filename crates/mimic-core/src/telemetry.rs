//! Runtime telemetry counters
//!
//! A fixed table of atomic counters incremented from hot paths (notably the
//! unaligned-atomic fault handler). Counters are process-wide and cheap
//! enough to bump from a signal handler.

use std::sync::atomic::{AtomicU64, Ordering};

/// Telemetry counter identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    /// Atomic access crossed a 16-byte boundary (classic split lock)
    SplitLocks = 0,
    /// Atomic access crossed an 8-byte boundary but fit in 16 bytes
    SplitLock16B = 1,
    /// 16-bit compare-exchange emulated non-atomically
    Cas16Tear = 2,
    /// 32-bit compare-exchange emulated non-atomically
    Cas32Tear = 3,
    /// 64-bit compare-exchange emulated non-atomically
    Cas64Tear = 4,
    /// 128-bit compare-exchange emulated non-atomically
    Cas128Tear = 5,
}

const COUNTER_COUNT: usize = 6;

const COUNTER_NAMES: [&str; COUNTER_COUNT] = [
    "split_locks",
    "split_lock_16b",
    "cas_16bit_tear",
    "cas_32bit_tear",
    "cas_64bit_tear",
    "cas_128bit_tear",
];

/// Process-wide telemetry table
pub struct Telemetry {
    counters: [AtomicU64; COUNTER_COUNT],
}

impl Telemetry {
    pub const fn new() -> Self {
        Telemetry {
            counters: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
        }
    }

    pub fn increment(&self, counter: Counter) {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    /// Snapshot all non-zero counters as (name, value) pairs.
    pub fn report(&self) -> Vec<(&'static str, u64)> {
        self.counters
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                let value = c.load(Ordering::Relaxed);
                (value != 0).then_some((COUNTER_NAMES[i], value))
            })
            .collect()
    }
}

static TELEMETRY: Telemetry = Telemetry::new();

/// The process-wide telemetry table.
///
/// Signal-handler callers rely on this being a plain static with no lazy
/// initialization.
pub fn global() -> &'static Telemetry {
    &TELEMETRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_report() {
        let t = Telemetry::new();
        assert_eq!(t.get(Counter::SplitLock16B), 0);
        t.increment(Counter::SplitLock16B);
        t.increment(Counter::SplitLock16B);
        t.increment(Counter::SplitLocks);
        assert_eq!(t.get(Counter::SplitLock16B), 2);

        let report = t.report();
        assert!(report.contains(&("split_lock_16b", 2)));
        assert!(report.contains(&("split_locks", 1)));
        assert_eq!(report.len(), 2);
    }
}
