//! Simulated allocators for replaying heap allocation traces.
//!
//! The [`Simulator`] drives an [`ObjectAllocator`] and a [`StackAllocator`]
//! over the event stream produced by the `heaptrace` parser, maintaining a
//! [`Stats`] bundle of live bytes, fragmentation waste, and sweep costs.
//! Two object allocator models ship with the crate:
//!
//! - [`SegFit`]: size-class segregated fit with per-processor span caches
//!   and two-epoch lazy sweeping.
//! - [`Immix`]: line-mark bump allocation in multi-line spans with
//!   per-class overflow slots.
//!
//! Both draw pages from a shared [`PageHeap`], which in turn maps arenas
//! from a monotonic [`AddressSpace48`]. A typical assembly:
//!
//! ```
//! use heaptrace_sim::{shared, AddressSpace48, PageHeap, SegFit, Simulator, StackPool, Stats};
//!
//! let pages = shared(PageHeap::new(AddressSpace48::new(4096)));
//! let sim = Simulator::new(SegFit::new(pages.clone()), StackPool::new(pages));
//! let mut stats = Stats::new();
//! sim.register_stats(&mut stats);
//! ```
//!
//! Everything after parser construction is strictly single-threaded;
//! invariant violations (double frees, frees of unmapped addresses,
//! cached spans seen during sweep) indicate malformed input or a model
//! bug and abort the process.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod addr_set;
mod addr_space;
mod arena;
mod check;
mod immix;
mod page;
mod segfit;
mod simulator;
mod stack;
mod stats;
mod traits;

pub mod mem;

pub use addr_set::AddressSet;
pub use addr_space::AddressSpace48;
pub use check::{CheckReport, StreamChecker};
pub use immix::{
    Immix, HEADER_STAT, LINES_STAT, MEDIUM_WASTE_STAT, SMALL_WASTE_STAT, TINY_WASTE_STAT,
};
pub use page::{PageHeap, PAGE_BYTES};
pub use segfit::{SegFit, OBJECT_WASTE_STAT, SIZE_CLASS_WASTE_STAT, TAIL_WASTE_STAT};
pub use simulator::Simulator;
pub use stack::StackPool;
pub use stats::Stats;
pub use traits::{
    shared, AddressSpace, Context, ObjectAllocator, PageAllocator, Shared, Simulation,
    StackAllocator,
};
