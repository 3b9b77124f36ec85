//! Monotonic simulated address space.

use crate::mem::align_up;
use crate::stats::Stats;
use crate::traits::{AddressSpace, Context, Simulation};

/// An address space in the style of a 48-bit user-mode heap: ranges are
/// handed out from a traditional high-half anchor, grow monotonically, and
/// are never reused.
pub struct AddressSpace48 {
    base: u64,
    page_bytes: u64,
    mapped: u64,
}

impl AddressSpace48 {
    /// Create an address space that rounds mappings to `page_bytes`.
    ///
    /// # Panics
    ///
    /// Panics unless `page_bytes` is a power of two.
    #[must_use]
    pub fn new(page_bytes: u64) -> Self {
        assert!(
            page_bytes.is_power_of_two(),
            "page size must be a power of two"
        );
        Self {
            base: 0xc000_0000_0000,
            page_bytes,
            mapped: 0,
        }
    }

    /// Total bytes mapped so far. Together with [`Stats`], this anchors the
    /// accounting identity `object + stack + unused + free == mapped`.
    #[must_use]
    pub const fn total_mapped(&self) -> u64 {
        self.mapped
    }
}

impl Simulation for AddressSpace48 {
    fn register_stats(&self, _stats: &mut Stats) {}
}

impl AddressSpace for AddressSpace48 {
    fn map_aligned(&mut self, ctx: &mut Context<'_>, size: u64, align: u64) -> (u64, u64) {
        let size = align_up(size, self.page_bytes);
        let base = align_up(self.base, align);
        self.base = base + size;
        self.mapped += size;
        ctx.stats.free_bytes += size;
        (base, size)
    }
}
