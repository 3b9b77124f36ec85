//! Trace stream sanity checking.
//!
//! Replaying a malformed trace through the simulators aborts deep inside
//! allocator invariants; running it through a [`StreamChecker`] first
//! yields a readable report instead.

use heaptrace::{Event, EventKind};

use crate::addr_set::AddressSet;

/// Findings from a checked event stream.
#[derive(Debug, Default)]
pub struct CheckReport {
    /// Object and stack allocations observed.
    pub allocs: u64,
    /// Object and stack frees observed.
    pub frees: u64,
    /// Complete GC cycles observed.
    pub gc_cycles: u64,
    /// Allocations over an address that was never freed.
    pub reused_without_free: Vec<Event>,
    /// Frees of addresses not currently allocated.
    pub double_frees: Vec<Event>,
    /// GC boundary events that do not pair up.
    pub gc_mismatches: Vec<Event>,
}

impl CheckReport {
    /// Whether the stream held no violations.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.reused_without_free.is_empty()
            && self.double_frees.is_empty()
            && self.gc_mismatches.is_empty()
    }
}

/// Consumes events and cross-checks their alloc/free pairing and GC
/// boundary nesting.
#[derive(Default)]
pub struct StreamChecker {
    live: AddressSet,
    gc_running: bool,
    report: CheckReport,
}

impl StreamChecker {
    /// Create a checker with an empty address set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event.
    pub fn observe(&mut self, ev: &Event) {
        match ev.kind {
            EventKind::Alloc | EventKind::StackAlloc => {
                if !self.live.insert(ev.address) {
                    self.report.reused_without_free.push(*ev);
                }
                self.report.allocs += 1;
            }
            EventKind::Free | EventKind::StackFree => {
                if !self.live.remove(ev.address) {
                    self.report.double_frees.push(*ev);
                }
                self.report.frees += 1;
            }
            EventKind::GcStart => {
                if self.gc_running {
                    self.report.gc_mismatches.push(*ev);
                }
                self.gc_running = true;
            }
            EventKind::GcEnd => {
                if !self.gc_running {
                    self.report.gc_mismatches.push(*ev);
                }
                self.gc_running = false;
                self.report.gc_cycles += 1;
            }
        }
    }

    /// Violations found so far.
    #[must_use]
    pub fn violations(&self) -> usize {
        self.report.reused_without_free.len()
            + self.report.double_frees.len()
            + self.report.gc_mismatches.len()
    }

    /// Finish checking and hand back the report.
    #[must_use]
    pub fn finish(self) -> CheckReport {
        self.report
    }
}
