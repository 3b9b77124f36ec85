//! Interfaces between the driver and the simulated allocators.

use std::cell::RefCell;
use std::rc::Rc;

use heaptrace::ProcId;

use crate::stats::Stats;

/// Shared single-threaded ownership of a collaborator.
///
/// The object and stack allocators draw from one page allocator, and the
/// page allocator owns the address space; the whole assembly is strictly
/// single-threaded, so plain `Rc<RefCell<_>>` sharing suffices.
pub type Shared<T> = Rc<RefCell<T>>;

/// Wrap a collaborator for sharing.
pub fn shared<T>(value: T) -> Shared<T> {
    Rc::new(RefCell::new(value))
}

/// Per-event simulation context: the acting processor and the statistics
/// being maintained.
pub struct Context<'a> {
    /// The processor the current event is attributed to.
    pub proc: ProcId,
    /// Statistics updated as a side effect of every operation.
    pub stats: &'a mut Stats,
}

/// Common surface of every simulated component.
pub trait Simulation {
    /// Register implementation-specific statistics.
    ///
    /// Must be idempotent, like [`Stats::register_other`].
    fn register_stats(&self, stats: &mut Stats);
}

/// A simulated object allocator.
pub trait ObjectAllocator: Simulation {
    /// Allocate an object and return its base address.
    fn alloc_object(
        &mut self,
        ctx: &mut Context<'_>,
        size: u64,
        array: bool,
        pointer_free: bool,
    ) -> u64;

    /// Mark the object starting at `addr` dead. The object's memory is not
    /// necessarily released; sweeping policy is the allocator's own.
    ///
    /// After [`gc_end`](ObjectAllocator::gc_end), the dead-object calls for
    /// everything that did not survive marking must arrive before any other
    /// operation, so the allocator learns the live/dead partition up front.
    /// Fully dead spans must release their pages eagerly to keep sweeping
    /// policy comparable across implementations.
    fn dead_object(&mut self, ctx: &mut Context<'_>, addr: u64);

    /// A GC cycle is starting (sweep termination).
    fn gc_start(&mut self, ctx: &mut Context<'_>);

    /// A GC cycle finished marking (mark termination).
    fn gc_end(&mut self, ctx: &mut Context<'_>);
}

/// A simulated stack allocator.
pub trait StackAllocator: Simulation {
    /// Allocate a stack of `size` bytes; returns its `(lo, hi)` range.
    fn alloc_stack(&mut self, ctx: &mut Context<'_>, size: u64) -> (u64, u64);

    /// Free the stack previously returned as `(lo, hi)`.
    fn free_stack(&mut self, ctx: &mut Context<'_>, lo: u64, hi: u64);

    /// A GC cycle is starting.
    fn gc_start(&mut self, ctx: &mut Context<'_>);

    /// A GC cycle finished marking.
    fn gc_end(&mut self, ctx: &mut Context<'_>);
}

/// A simulated page-granularity allocator.
pub trait PageAllocator: Simulation {
    /// Bytes per page. Always a power of two.
    fn bytes_per_page(&self) -> u64;

    /// Allocate `pages` contiguous pages; returns the base address.
    fn alloc_pages(&mut self, ctx: &mut Context<'_>, pages: u64) -> u64;

    /// Free `pages` contiguous pages starting at `addr`.
    fn free_pages(&mut self, ctx: &mut Context<'_>, addr: u64, pages: u64);
}

/// A simulated address space handing out virtual address ranges.
pub trait AddressSpace: Simulation {
    /// Map a region of at least `size` bytes aligned to `align`, like an
    /// OS `mmap` with alignment. Returns the base and the rounded size.
    fn map_aligned(&mut self, ctx: &mut Context<'_>, size: u64, align: u64) -> (u64, u64);
}
