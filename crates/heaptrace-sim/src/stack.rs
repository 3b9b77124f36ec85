//! Stack allocation from pooled spans.
//!
//! Stacks are powers of two, 2 KiB at minimum. The four smallest orders
//! are served from per-processor free-list caches backed by a central pool
//! of 32 KiB spans; anything at or above the pool span size comes from
//! per-order "large" free lists or straight from the page allocator.
//! While a GC runs, page release is deferred and settled at mark
//! termination.

use std::collections::HashMap;

use heaptrace::ProcId;

use crate::arena::{Linked, Links, SpanArena, SpanList, SpanRef};
use crate::mem::{log2, pages_for};
use crate::stats::Stats;
use crate::traits::{Context, PageAllocator, Shared, Simulation, StackAllocator};

const MIN_STACK_LOG2: u32 = 11;
const MIN_STACK_BYTES: u64 = 1 << MIN_STACK_LOG2;
const NUM_ORDERS: usize = 4;
/// Size of one pool span, and the boundary above which stacks are "large".
const POOL_SPAN_BYTES: u64 = MIN_STACK_BYTES << NUM_ORDERS;
const NUM_LARGE_ORDERS: usize = 64 - NUM_ORDERS - MIN_STACK_LOG2 as usize;

/// One stack's address range.
#[derive(Debug, Clone, Copy)]
struct StackRange {
    lo: u64,
    hi: u64,
}

impl StackRange {
    const fn size(self) -> u64 {
        self.hi - self.lo
    }
}

/// A LIFO free list of equally sized stacks, tracking its total bytes.
#[derive(Debug, Default)]
struct StackFreeList {
    stacks: Vec<StackRange>,
    bytes: u64,
}

impl StackFreeList {
    fn push(&mut self, stack: StackRange) {
        self.bytes += stack.size();
        self.stacks.push(stack);
    }

    fn pop(&mut self) -> Option<StackRange> {
        let stack = self.stacks.pop()?;
        self.bytes -= stack.size();
        Some(stack)
    }
}

/// Which central list a pool span is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListId {
    Pool(usize),
    PoolFull(usize),
}

/// A pool span: 32 KiB of pages carved into equally sized stacks.
struct PoolSpan {
    links: Links<ListId>,
    base: u64,
    free: Vec<StackRange>,
    alloc_count: u32,
}

impl PoolSpan {
    fn owns(&self, stack: StackRange) -> bool {
        stack.lo >= self.base && stack.hi <= self.base + POOL_SPAN_BYTES
    }
}

impl Linked for PoolSpan {
    type ListId = ListId;

    fn links(&self) -> &Links<ListId> {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links<ListId> {
        &mut self.links
    }
}

fn find_owner(
    arena: &SpanArena<PoolSpan>,
    list: &SpanList<ListId>,
    stack: StackRange,
) -> Option<SpanRef> {
    let mut cur = list.first();
    while let Some(r) = cur {
        let span = arena.get(r);
        if span.owns(stack) {
            return Some(r);
        }
        cur = span.links().next();
    }
    None
}

/// The stack allocator.
pub struct StackPool<P> {
    pages: Shared<P>,
    cache: HashMap<ProcId, [StackFreeList; NUM_ORDERS]>,
    arena: SpanArena<PoolSpan>,
    pool: [SpanList<ListId>; NUM_ORDERS],
    pool_full: [SpanList<ListId>; NUM_ORDERS],
    large: Vec<StackFreeList>,
    gc_running: bool,
}

impl<P: PageAllocator> StackPool<P> {
    /// Create a stack allocator over the shared page allocator.
    ///
    /// # Panics
    ///
    /// Panics unless the page allocator uses 8 KiB pages.
    pub fn new(pages: Shared<P>) -> Self {
        assert!(
            pages.borrow().bytes_per_page() == 8192,
            "stack allocator requires 8 KiB pages"
        );
        Self {
            pages,
            cache: HashMap::new(),
            arena: SpanArena::new(),
            pool: std::array::from_fn(|order| SpanList::new(ListId::Pool(order))),
            pool_full: std::array::from_fn(|order| SpanList::new(ListId::PoolFull(order))),
            large: (0..NUM_LARGE_ORDERS).map(|_| StackFreeList::default()).collect(),
            gc_running: false,
        }
    }

    fn page_bytes(&self) -> u64 {
        self.pages.borrow().bytes_per_page()
    }

    /// Take one stack of `size` bytes from the central pool, growing it by
    /// a fresh span when the order's pool is empty.
    fn alloc_from_pool(&mut self, ctx: &mut Context<'_>, size: u64) -> StackRange {
        let order = (log2(size) - MIN_STACK_LOG2) as usize;
        if self.pool[order].is_empty() {
            let npages = pages_for(POOL_SPAN_BYTES, self.page_bytes());
            let base = self.pages.borrow_mut().alloc_pages(ctx, npages);
            let mut free = Vec::with_capacity((POOL_SPAN_BYTES / size) as usize);
            let mut at = 0;
            while at < POOL_SPAN_BYTES {
                free.push(StackRange {
                    lo: base + at,
                    hi: base + at + size,
                });
                at += size;
            }
            let r = self.arena.insert(PoolSpan {
                links: Links::default(),
                base,
                free,
                alloc_count: 0,
            });
            self.pool[order].push_front(&mut self.arena, r);
        }
        let r = self.pool[order].first().expect("pool refill produced nothing");
        let span = self.arena.get_mut(r);
        let stack = span.free.pop().expect("pool span with no free stacks");
        span.alloc_count += 1;
        if span.free.is_empty() {
            self.pool[order].remove(&mut self.arena, r);
            self.pool_full[order].push_front(&mut self.arena, r);
        }
        stack
    }

    /// Return a stack to its owning pool span, releasing the span's pages
    /// once it empties outside a GC.
    fn free_to_pool(&mut self, ctx: &mut Context<'_>, stack: StackRange) {
        let order = (log2(stack.size()) - MIN_STACK_LOG2) as usize;
        if let Some(r) = find_owner(&self.arena, &self.pool[order], stack) {
            let span = self.arena.get_mut(r);
            span.free.push(stack);
            span.alloc_count -= 1;
            if span.alloc_count == 0 && !self.gc_running {
                self.pool[order].remove(&mut self.arena, r);
                self.release_span(ctx, r);
            }
            return;
        }
        if let Some(r) = find_owner(&self.arena, &self.pool_full[order], stack) {
            let span = self.arena.get_mut(r);
            span.free.push(stack);
            span.alloc_count -= 1;
            let emptied = span.alloc_count == 0;
            self.pool_full[order].remove(&mut self.arena, r);
            if emptied && !self.gc_running {
                self.release_span(ctx, r);
            } else {
                self.pool[order].push_front(&mut self.arena, r);
            }
            return;
        }
        panic!("no pool span owns the freed stack");
    }

    fn release_span(&mut self, ctx: &mut Context<'_>, r: SpanRef) {
        let span = self.arena.remove(r);
        let npages = pages_for(POOL_SPAN_BYTES, self.page_bytes());
        self.pages.borrow_mut().free_pages(ctx, span.base, npages);
    }

    fn cache_list(&mut self, proc: ProcId, order: usize) -> &mut StackFreeList {
        &mut self.cache.entry(proc).or_default()[order]
    }
}

impl<P: PageAllocator> Simulation for StackPool<P> {
    fn register_stats(&self, stats: &mut Stats) {
        self.pages.borrow().register_stats(stats);
    }
}

impl<P: PageAllocator> StackAllocator for StackPool<P> {
    fn alloc_stack(&mut self, ctx: &mut Context<'_>, size: u64) -> (u64, u64) {
        assert!(size.is_power_of_two(), "stack size must be a power of two");
        assert!(size >= MIN_STACK_BYTES, "stack below the minimum size");
        let stack = if size < POOL_SPAN_BYTES {
            if ctx.proc == ProcId::NONE {
                self.alloc_from_pool(ctx, size)
            } else {
                let order = (log2(size) - MIN_STACK_LOG2) as usize;
                let mut stack = self.cache_list(ctx.proc, order).pop();
                if stack.is_none() {
                    // Refill the cache to half capacity from the pool.
                    while self.cache[&ctx.proc][order].bytes < POOL_SPAN_BYTES / 2 {
                        let fresh = self.alloc_from_pool(ctx, size);
                        self.cache_list(ctx.proc, order).push(fresh);
                    }
                    stack = self.cache_list(ctx.proc, order).pop();
                }
                stack.expect("cache refill produced nothing")
            }
        } else {
            let order = (log2(size) - NUM_ORDERS as u32 - MIN_STACK_LOG2) as usize;
            self.large[order].pop().unwrap_or_else(|| {
                let npages = pages_for(size, self.page_bytes());
                let lo = self.pages.borrow_mut().alloc_pages(ctx, npages);
                StackRange { lo, hi: lo + size }
            })
        };
        ctx.stats.free_bytes -= size;
        ctx.stats.stack_bytes += size;
        (stack.lo, stack.hi)
    }

    fn free_stack(&mut self, ctx: &mut Context<'_>, lo: u64, hi: u64) {
        let size = hi - lo;
        assert!(size.is_power_of_two(), "stack size must be a power of two");
        assert!(size >= MIN_STACK_BYTES, "stack below the minimum size");
        let stack = StackRange { lo, hi };
        if size < POOL_SPAN_BYTES {
            if ctx.proc == ProcId::NONE {
                self.free_to_pool(ctx, stack);
            } else {
                let order = (log2(size) - MIN_STACK_LOG2) as usize;
                // A cache at capacity drains half back to the pool first.
                if self.cache_list(ctx.proc, order).bytes >= POOL_SPAN_BYTES {
                    while self.cache[&ctx.proc][order].bytes > POOL_SPAN_BYTES / 2 {
                        let drained = self
                            .cache_list(ctx.proc, order)
                            .pop()
                            .expect("draining an empty cache");
                        self.free_to_pool(ctx, drained);
                    }
                }
                self.cache_list(ctx.proc, order).push(stack);
            }
        } else {
            let order = (log2(size) - NUM_ORDERS as u32 - MIN_STACK_LOG2) as usize;
            if self.gc_running {
                self.large[order].push(stack);
            } else {
                let npages = pages_for(size, self.page_bytes());
                self.pages.borrow_mut().free_pages(ctx, lo, npages);
            }
        }
        ctx.stats.free_bytes += size;
        ctx.stats.stack_bytes -= size;
    }

    fn gc_start(&mut self, _ctx: &mut Context<'_>) {
        self.gc_running = true;
    }

    fn gc_end(&mut self, ctx: &mut Context<'_>) {
        self.gc_running = false;
        // Settle deferred releases: empty pool spans and everything parked
        // on the large lists go back to the page allocator.
        for order in 0..NUM_ORDERS {
            for r in self.pool[order].refs(&self.arena) {
                if self.arena.get(r).alloc_count == 0 {
                    self.pool[order].remove(&mut self.arena, r);
                    self.release_span(ctx, r);
                }
            }
        }
        for order in 0..NUM_LARGE_ORDERS {
            while let Some(stack) = self.large[order].pop() {
                let npages = pages_for(stack.size(), self.page_bytes());
                self.pages.borrow_mut().free_pages(ctx, stack.lo, npages);
            }
        }
    }
}
