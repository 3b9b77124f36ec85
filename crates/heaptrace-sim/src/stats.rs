//! Simulation statistics.

use std::collections::BTreeMap;

/// A sample of memory statistics maintained by the simulator.
///
/// The fixed counters hold the cross-implementation accounting identity:
/// at any point, `object_bytes + stack_bytes + unused_bytes + free_bytes`
/// equals the total bytes handed out by the address space. Named metrics
/// break those down per implementation.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    /// Tick of the most recent event processed.
    pub timestamp: u64,

    /// Complete GC cycles observed so far.
    pub gc_cycles: u64,

    /// Total object allocations processed.
    pub allocs: u64,

    /// Total object frees processed.
    pub frees: u64,

    /// Bytes occupied by live objects.
    pub object_bytes: u64,

    /// Bytes occupied by live stacks.
    pub stack_bytes: u64,

    /// Bytes not holding live memory that cannot currently serve new
    /// allocations either (fragmentation of every flavor).
    pub unused_bytes: u64,

    /// Bytes available for future allocations.
    pub free_bytes: u64,

    other: BTreeMap<&'static str, u64>,
}

impl Stats {
    /// Create an empty statistics bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the registered implementation-specific metrics, sorted.
    pub fn other_stats(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.other.keys().copied()
    }

    /// Value of an implementation-specific metric; zero if unregistered.
    #[must_use]
    pub fn get_other(&self, name: &str) -> u64 {
        self.other.get(name).copied().unwrap_or(0)
    }

    /// Register an implementation-specific metric. Idempotent: a second
    /// registration keeps the current value.
    pub fn register_other(&mut self, name: &'static str) {
        self.other.entry(name).or_insert(0);
    }

    /// Add to an implementation-specific metric.
    ///
    /// # Panics
    ///
    /// Panics if the metric was never registered.
    pub fn add_other(&mut self, name: &str, amount: u64) {
        let value = self
            .other
            .get_mut(name)
            .unwrap_or_else(|| panic!("add to unregistered stat {name:?}"));
        *value += amount;
    }

    /// Subtract from an implementation-specific metric.
    ///
    /// # Panics
    ///
    /// Panics if the metric was never registered.
    pub fn sub_other(&mut self, name: &str, amount: u64) {
        let value = self
            .other
            .get_mut(name)
            .unwrap_or_else(|| panic!("subtract from unregistered stat {name:?}"));
        *value -= amount;
    }
}
