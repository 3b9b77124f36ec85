//! Size-class segregated-fit object allocation.
//!
//! Small objects are rounded up to a size class and served bitmap-first-fit
//! from spans dedicated to that class; larger objects get a span of their
//! own. Each processor caches one span per span class. Central lists are
//! split by sweep epoch: a single-bit toggle selects the current epoch, and
//! spans surviving from the previous epoch are swept lazily as the
//! allocator reaches for them.

use std::collections::HashMap;

use heaptrace::sizeclass::{
    size_to_class, SpanClass, CLASS_TO_PAGES, CLASS_TO_SIZE, MAX_SMALL_SIZE, NUM_SPAN_CLASSES,
};
use heaptrace::ProcId;

use crate::arena::{Linked, Links, SpanArena, SpanList, SpanRef};
use crate::mem::align_down;
use crate::stats::Stats;
use crate::traits::{Context, ObjectAllocator, PageAllocator, Shared, Simulation};

/// Bytes dead objects still occupy until their span is swept.
pub const OBJECT_WASTE_STAT: &str = "SegFitObjectUnusedBytes";
/// Bytes lost to rounding objects up to their size class.
pub const SIZE_CLASS_WASTE_STAT: &str = "SegFitSizeClassUnusedBytes";
/// Bytes past the last whole element of each span.
pub const TAIL_WASTE_STAT: &str = "SegFitTailUnusedBytes";

const FREE_WORDS: usize = 128;

/// Which central list a span is on: partial or full, per sweep epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListId {
    Partial { class: u8, epoch: u8 },
    Full { class: u8, epoch: u8 },
}

struct Span {
    links: Links<ListId>,
    base: u64,
    npages: u64,
    class: SpanClass,
    elem_size: u64,
    num_elems: u64,
    alloc_count: u64,
    freed_count: u64,
    cached: bool,
    /// Free bitmap, one bit per element slot.
    free: [u64; FREE_WORDS],
    /// Slots freed since the last sweep; folded into `free` by `sweep`.
    freed: [u64; FREE_WORDS],
    tail_waste: u64,
    /// Bytes of dead objects awaiting sweep.
    obj_unused: u64,
    /// Live size-class rounding waste.
    sc_unused: u64,
    /// Rounding waste of dead objects awaiting sweep.
    sc_freed: u64,
}

impl Span {
    fn new(class: SpanClass, base: u64, npages: u64, elem_size: u64, num_elems: u64) -> Self {
        Self {
            links: Links::default(),
            base,
            npages,
            class,
            elem_size,
            num_elems,
            alloc_count: 0,
            freed_count: 0,
            cached: false,
            free: [0; FREE_WORDS],
            freed: [0; FREE_WORDS],
            tail_waste: 0,
            obj_unused: 0,
            sc_unused: 0,
            sc_freed: 0,
        }
    }

    /// Claim the lowest free slot, if any.
    fn alloc_slot(&mut self) -> Option<u64> {
        let words = (self.num_elems as usize + 63) / 64;
        for word in 0..words {
            let bits = self.free[word];
            if bits != 0 {
                let bit = bits.trailing_zeros() as u64;
                self.free[word] &= !(1 << bit);
                self.alloc_count += 1;
                let slot = word as u64 * 64 + bit;
                return Some(self.base + slot * self.elem_size);
            }
        }
        None
    }

    fn is_full(&self) -> bool {
        self.alloc_count == self.num_elems
    }

    /// Fold deferred frees back into the free bitmap and settle the waste
    /// they were carrying into free bytes.
    fn sweep(&mut self, ctx: &mut Context<'_>) {
        let words = (self.num_elems as usize + 63) / 64;
        for word in 0..words {
            self.free[word] |= self.freed[word];
            self.freed[word] = 0;
        }
        self.alloc_count -= self.freed_count;
        ctx.stats.frees += self.freed_count;
        self.freed_count = 0;
        self.sc_unused -= self.sc_freed;
        ctx.stats.sub_other(SIZE_CLASS_WASTE_STAT, self.sc_freed);
        ctx.stats.sub_other(OBJECT_WASTE_STAT, self.obj_unused);
        ctx.stats.free_bytes += self.obj_unused + self.sc_freed;
        ctx.stats.unused_bytes -= self.obj_unused + self.sc_freed;
        self.obj_unused = 0;
        self.sc_freed = 0;
    }
}

impl Linked for Span {
    type ListId = ListId;

    fn links(&self) -> &Links<ListId> {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links<ListId> {
        &mut self.links
    }
}

struct ClassLists {
    partial: [SpanList<ListId>; 2],
    full: [SpanList<ListId>; 2],
}

/// Central span lists for every span class, split by sweep epoch.
struct Central {
    classes: Vec<ClassLists>,
}

impl Central {
    fn new() -> Self {
        let classes = (0..NUM_SPAN_CLASSES)
            .map(|class| {
                let class = class as u8;
                ClassLists {
                    partial: std::array::from_fn(|epoch| {
                        SpanList::new(ListId::Partial {
                            class,
                            epoch: epoch as u8,
                        })
                    }),
                    full: std::array::from_fn(|epoch| {
                        SpanList::new(ListId::Full {
                            class,
                            epoch: epoch as u8,
                        })
                    }),
                }
            })
            .collect();
        Self { classes }
    }

    fn list_mut(&mut self, id: ListId) -> &mut SpanList<ListId> {
        match id {
            ListId::Partial { class, epoch } => {
                &mut self.classes[class as usize].partial[epoch as usize]
            }
            ListId::Full { class, epoch } => &mut self.classes[class as usize].full[epoch as usize],
        }
    }

    fn partial_mut(&mut self, class: usize, epoch: usize) -> &mut SpanList<ListId> {
        &mut self.classes[class].partial[epoch]
    }

    fn full_mut(&mut self, class: usize, epoch: usize) -> &mut SpanList<ListId> {
        &mut self.classes[class].full[epoch]
    }
}

/// Per-processor cache: the span currently allocating for each span class.
struct Cache {
    alloc: Box<[Option<SpanRef>]>,
}

impl Cache {
    fn new() -> Self {
        Self {
            alloc: vec![None; NUM_SPAN_CLASSES].into_boxed_slice(),
        }
    }
}

/// The segregated-fit object allocator.
pub struct SegFit<P> {
    swept_epoch: usize,
    pages: Shared<P>,
    arena: SpanArena<Span>,
    /// Page base address of every span page, to the owning span.
    index: HashMap<u64, SpanRef>,
    caches: HashMap<ProcId, Cache>,
    central: Central,
    object_sizes: HashMap<u64, u64>,
}

impl<P: PageAllocator> SegFit<P> {
    /// Create a segregated-fit allocator over the shared page allocator.
    ///
    /// # Panics
    ///
    /// Panics unless the page allocator uses 8 KiB pages.
    pub fn new(pages: Shared<P>) -> Self {
        assert!(
            pages.borrow().bytes_per_page() == 8192,
            "object allocator requires 8 KiB pages"
        );
        Self {
            swept_epoch: 0,
            pages,
            arena: SpanArena::new(),
            index: HashMap::new(),
            caches: HashMap::new(),
            central: Central::new(),
            object_sizes: HashMap::new(),
        }
    }

    fn page_bytes(&self) -> u64 {
        self.pages.borrow().bytes_per_page()
    }

    fn add_to_index(&mut self, r: SpanRef) {
        let span = self.arena.get(r);
        let (base, npages) = (span.base, span.npages);
        let page_bytes = self.page_bytes();
        for i in 0..npages {
            let prev = self.index.insert(base + i * page_bytes, r);
            debug_assert!(prev.is_none(), "span pages indexed twice");
        }
    }

    fn remove_from_index(&mut self, r: SpanRef) {
        let span = self.arena.get(r);
        let (base, npages) = (span.base, span.npages);
        let page_bytes = self.page_bytes();
        for i in 0..npages {
            self.index.remove(&(base + i * page_bytes));
        }
    }

    fn install(&mut self, proc: ProcId, spc: SpanClass, r: SpanRef) {
        self.arena.get_mut(r).cached = true;
        self.caches.get_mut(&proc).expect("missing cache").alloc[spc.index()] = Some(r);
    }

    fn cached_alloc(&mut self, proc: ProcId, spc: SpanClass) -> Option<u64> {
        let slot = self.caches.get(&proc)?.alloc[spc.index()]?;
        self.arena.get_mut(slot).alloc_slot()
    }

    /// Replace the processor's cache slot for `spc` with a span that has a
    /// free element: first the current epoch's partials, then swept-on-
    /// demand spans from the previous epoch, finally a fresh span.
    fn refill(&mut self, ctx: &mut Context<'_>, spc: SpanClass) {
        let class = spc.index();
        let swept = self.swept_epoch;
        let prev = 1 - swept;

        if let Some(r) = self.caches.get_mut(&ctx.proc).expect("missing cache").alloc[class].take()
        {
            let span = self.arena.get_mut(r);
            assert!(span.is_full(), "refilling a span with free elements");
            span.cached = false;
            self.central.full_mut(class, swept).push_front(&mut self.arena, r);
        }

        if let Some(r) = self.central.partial_mut(class, swept).pop_back(&mut self.arena) {
            self.install(ctx.proc, spc, r);
            return;
        }
        if let Some(r) = self.central.partial_mut(class, prev).pop_back(&mut self.arena) {
            self.arena.get_mut(r).sweep(ctx);
            self.install(ctx.proc, spc, r);
            return;
        }
        while let Some(r) = self.central.full_mut(class, prev).pop_back(&mut self.arena) {
            self.arena.get_mut(r).sweep(ctx);
            if self.arena.get(r).is_full() {
                self.central.full_mut(class, swept).push_front(&mut self.arena, r);
            } else {
                self.install(ctx.proc, spc, r);
                return;
            }
        }

        // Nothing to reuse; grow a fresh span.
        let size_class = spc.size_class() as usize;
        let npages = CLASS_TO_PAGES[size_class];
        let elem_size = CLASS_TO_SIZE[size_class];
        let page_bytes = self.page_bytes();
        let num_elems = npages * page_bytes / elem_size;
        let base = self.pages.borrow_mut().alloc_pages(ctx, npages);
        let mut span = Span::new(spc, base, npages, elem_size, num_elems);
        span.tail_waste = npages * page_bytes - elem_size * num_elems;
        for slot in 0..num_elems {
            span.free[(slot / 64) as usize] |= 1 << (slot % 64);
        }
        span.cached = true;
        ctx.stats.free_bytes -= span.tail_waste;
        ctx.stats.unused_bytes += span.tail_waste;
        ctx.stats.add_other(TAIL_WASTE_STAT, span.tail_waste);
        let r = self.arena.insert(span);
        self.add_to_index(r);
        self.caches.get_mut(&ctx.proc).expect("missing cache").alloc[class] = Some(r);
    }
}

impl<P: PageAllocator> Simulation for SegFit<P> {
    fn register_stats(&self, stats: &mut Stats) {
        self.pages.borrow().register_stats(stats);
        stats.register_other(OBJECT_WASTE_STAT);
        stats.register_other(SIZE_CLASS_WASTE_STAT);
        stats.register_other(TAIL_WASTE_STAT);
    }
}

impl<P: PageAllocator> ObjectAllocator for SegFit<P> {
    fn alloc_object(
        &mut self,
        ctx: &mut Context<'_>,
        size: u64,
        _array: bool,
        pointer_free: bool,
    ) -> u64 {
        assert!(ctx.proc != ProcId::NONE, "object allocation requires a processor");
        if size <= MAX_SMALL_SIZE {
            self.caches.entry(ctx.proc).or_insert_with(Cache::new);
            let spc = SpanClass::new(size_to_class(size), pointer_free);
            let mut addr = self.cached_alloc(ctx.proc, spc);
            if addr.is_none() {
                self.refill(ctx, spc);
                addr = self.cached_alloc(ctx.proc, spc);
            }
            let addr = addr.expect("refilled span has no free element");
            self.object_sizes.insert(addr, size);

            let r = self.caches[&ctx.proc].alloc[spc.index()].expect("cache slot emptied");
            let span = self.arena.get_mut(r);
            let rounding = span.elem_size - size;
            span.sc_unused += rounding;
            ctx.stats.add_other(SIZE_CLASS_WASTE_STAT, rounding);
            ctx.stats.free_bytes -= span.elem_size;
            ctx.stats.object_bytes += size;
            ctx.stats.unused_bytes += rounding;
            ctx.stats.allocs += 1;
            return addr;
        }

        // Large object: one element, its own span, central from birth.
        let page_bytes = self.page_bytes();
        let npages = crate::mem::pages_for(size, page_bytes);
        let spc = SpanClass::new(0, pointer_free);
        let base = self.pages.borrow_mut().alloc_pages(ctx, npages);
        let mut span = Span::new(spc, base, npages, size, 1);
        span.alloc_count = 1;
        span.tail_waste = npages * page_bytes - size;
        let tail_waste = span.tail_waste;
        let r = self.arena.insert(span);
        self.central
            .full_mut(spc.index(), self.swept_epoch)
            .push_front(&mut self.arena, r);
        self.add_to_index(r);
        self.object_sizes.insert(base, size);
        ctx.stats.free_bytes -= npages * page_bytes;
        ctx.stats.object_bytes += size;
        ctx.stats.unused_bytes += tail_waste;
        ctx.stats.add_other(TAIL_WASTE_STAT, tail_waste);
        ctx.stats.allocs += 1;
        base
    }

    fn dead_object(&mut self, ctx: &mut Context<'_>, addr: u64) {
        let page = align_down(addr, self.page_bytes());
        let r = *self.index.get(&page).expect("free of unmapped address");
        let size = self
            .object_sizes
            .remove(&addr)
            .expect("free of unknown object");
        let span = self.arena.get_mut(r);
        assert!(!span.cached, "dead object in a cached span");
        let slot = (addr - span.base) / span.elem_size;
        let (word, bit) = ((slot / 64) as usize, slot % 64);
        assert!(span.freed[word] & (1 << bit) == 0, "object freed twice");
        span.freed[word] |= 1 << bit;
        span.freed_count += 1;
        span.obj_unused += size;
        span.sc_freed += span.elem_size - size;
        ctx.stats.object_bytes -= size;
        ctx.stats.unused_bytes += size;
        ctx.stats.add_other(OBJECT_WASTE_STAT, size);

        if span.freed_count == span.alloc_count {
            // Nothing lives here: release the pages now and settle all the
            // waste the span was carrying.
            let home = span.links.home().expect("dying span on no list");
            self.central.list_mut(home).remove(&mut self.arena, r);
            self.remove_from_index(r);
            let span = self.arena.remove(r);
            self.pages
                .borrow_mut()
                .free_pages(ctx, span.base, span.npages);
            let settled = span.tail_waste + span.obj_unused + span.sc_unused;
            ctx.stats.free_bytes += settled;
            ctx.stats.unused_bytes -= settled;
            ctx.stats.sub_other(TAIL_WASTE_STAT, span.tail_waste);
            ctx.stats.sub_other(SIZE_CLASS_WASTE_STAT, span.sc_unused);
            ctx.stats.sub_other(OBJECT_WASTE_STAT, span.obj_unused);
            ctx.stats.frees += span.freed_count;
        }
    }

    fn gc_start(&mut self, ctx: &mut Context<'_>) {
        // Sweep-and-rotate everything left in the previous epoch.
        let swept = self.swept_epoch;
        let prev = 1 - swept;
        for class in 0..NUM_SPAN_CLASSES {
            while let Some(r) = self.central.partial_mut(class, prev).pop_back(&mut self.arena) {
                self.arena.get_mut(r).sweep(ctx);
                self.central.partial_mut(class, swept).push_front(&mut self.arena, r);
            }
            while let Some(r) = self.central.full_mut(class, prev).pop_back(&mut self.arena) {
                self.arena.get_mut(r).sweep(ctx);
                if self.arena.get(r).is_full() {
                    self.central.full_mut(class, swept).push_front(&mut self.arena, r);
                } else {
                    self.central.partial_mut(class, swept).push_front(&mut self.arena, r);
                }
            }
        }
    }

    fn gc_end(&mut self, _ctx: &mut Context<'_>) {
        // Flush every processor cache so the coming dead-object stream
        // never meets a cached span, then open the next epoch.
        let mut flushed = Vec::new();
        for cache in self.caches.values_mut() {
            for slot in cache.alloc.iter_mut() {
                if let Some(r) = slot.take() {
                    flushed.push(r);
                }
            }
        }
        let swept = self.swept_epoch;
        for r in flushed {
            let span = self.arena.get_mut(r);
            span.cached = false;
            let class = span.class.index();
            if self.arena.get(r).is_full() {
                self.central.full_mut(class, swept).push_front(&mut self.arena, r);
            } else {
                self.central.partial_mut(class, swept).push_front(&mut self.arena, r);
            }
        }
        self.swept_epoch = 1 - self.swept_epoch;
    }
}

#[cfg(test)]
mod tests {
    use crate::addr_space::AddressSpace48;
    use crate::page::PageHeap;
    use crate::traits::shared;

    use super::*;

    fn segfit() -> SegFit<PageHeap<AddressSpace48>> {
        SegFit::new(shared(PageHeap::new(AddressSpace48::new(4096))))
    }

    fn ctx(stats: &mut Stats, proc: i32) -> Context<'_> {
        Context {
            proc: ProcId(proc),
            stats,
        }
    }

    fn registered(allocator: &SegFit<PageHeap<AddressSpace48>>) -> Stats {
        let mut stats = Stats::new();
        allocator.register_stats(&mut stats);
        stats
    }

    #[test]
    fn test_small_allocs_pack_a_span() {
        let mut allocator = segfit();
        let mut stats = registered(&allocator);
        let a = allocator.alloc_object(&mut ctx(&mut stats, 0), 48, false, false);
        let b = allocator.alloc_object(&mut ctx(&mut stats, 0), 48, false, false);
        assert_eq!(b, a + 48);
        assert_eq!(stats.object_bytes, 96);
        assert_eq!(stats.allocs, 2);
        // 40 bytes requested from the 48-byte class: 8 bytes of rounding.
        let c = allocator.alloc_object(&mut ctx(&mut stats, 0), 40, false, false);
        assert_eq!(c, b + 48);
        assert_eq!(stats.get_other(SIZE_CLASS_WASTE_STAT), 8);
        // The 48-byte class leaves a 32-byte tail per span.
        assert_eq!(stats.get_other(TAIL_WASTE_STAT), 32);
    }

    #[test]
    fn test_noscan_classes_use_separate_spans() {
        let mut allocator = segfit();
        let mut stats = registered(&allocator);
        let a = allocator.alloc_object(&mut ctx(&mut stats, 0), 64, false, false);
        let b = allocator.alloc_object(&mut ctx(&mut stats, 0), 64, false, true);
        // Same size class, different span class: different spans.
        assert_ne!(align_down(a, 8192), align_down(b, 8192));
    }

    #[test]
    fn test_dead_span_releases_eagerly() {
        let mut allocator = segfit();
        let mut stats = registered(&allocator);
        let a = allocator.alloc_object(&mut ctx(&mut stats, 0), 100, false, false);
        allocator.gc_end(&mut ctx(&mut stats, 0));
        allocator.dead_object(&mut ctx(&mut stats, 0), a);
        // Sole object of its span died: everything settles back to free.
        assert_eq!(stats.object_bytes, 0);
        assert_eq!(stats.unused_bytes, 0);
        assert_eq!(stats.get_other(OBJECT_WASTE_STAT), 0);
        assert_eq!(stats.get_other(SIZE_CLASS_WASTE_STAT), 0);
        assert_eq!(stats.get_other(TAIL_WASTE_STAT), 0);
        assert_eq!(stats.frees, 1);
        let mapped = allocator.pages.borrow().address_space().total_mapped();
        assert_eq!(stats.free_bytes, mapped);
    }

    #[test]
    fn test_lazy_sweep_revives_partial_span() {
        let mut allocator = segfit();
        let mut stats = registered(&allocator);
        let a = allocator.alloc_object(&mut ctx(&mut stats, 0), 64, false, false);
        let _b = allocator.alloc_object(&mut ctx(&mut stats, 0), 64, false, false);
        allocator.gc_end(&mut ctx(&mut stats, 0)); // flush cache, epoch 1
        allocator.dead_object(&mut ctx(&mut stats, 0), a);
        allocator.gc_start(&mut ctx(&mut stats, 0)); // sweep rotates the span
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.object_bytes, 64);
        // The freed slot is allocatable again.
        let c = allocator.alloc_object(&mut ctx(&mut stats, 0), 64, false, false);
        assert_eq!(c, a);
    }

    #[test]
    fn test_large_object_spans() {
        let mut allocator = segfit();
        let mut stats = registered(&allocator);
        let size = 40960;
        let a = allocator.alloc_object(&mut ctx(&mut stats, 0), size, false, false);
        assert_eq!(stats.object_bytes, size);
        assert_eq!(stats.get_other(TAIL_WASTE_STAT), 0); // 5 pages exactly
        allocator.gc_end(&mut ctx(&mut stats, 0));
        allocator.dead_object(&mut ctx(&mut stats, 0), a);
        assert_eq!(stats.object_bytes, 0);
        assert_eq!(stats.frees, 1);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn test_double_free_aborts() {
        let mut allocator = segfit();
        let mut stats = registered(&allocator);
        let a = allocator.alloc_object(&mut ctx(&mut stats, 0), 64, false, false);
        let _keep = allocator.alloc_object(&mut ctx(&mut stats, 0), 64, false, false);
        allocator.gc_end(&mut ctx(&mut stats, 0));
        allocator.dead_object(&mut ctx(&mut stats, 0), a);
        allocator.dead_object(&mut ctx(&mut stats, 0), a);
    }

    #[test]
    #[should_panic(expected = "cached span")]
    fn test_dead_object_in_cached_span_aborts() {
        let mut allocator = segfit();
        let mut stats = registered(&allocator);
        let a = allocator.alloc_object(&mut ctx(&mut stats, 0), 64, false, false);
        // No gc_end: the span is still in the processor cache.
        allocator.dead_object(&mut ctx(&mut stats, 0), a);
    }

    #[test]
    fn test_liveness_identity_through_churn() {
        let mut allocator = segfit();
        let mut stats = registered(&allocator);
        let mut live = Vec::new();
        for round in 0..4u64 {
            for i in 0..200u64 {
                let size = 16 + (i * 37 + round * 11) % 2000;
                live.push((
                    allocator.alloc_object(&mut ctx(&mut stats, (i % 3) as i32), size, false, i % 2 == 0),
                    size,
                ));
            }
            allocator.gc_end(&mut ctx(&mut stats, 0));
            // Kill every other live object, oldest first.
            let mut survivors = Vec::new();
            for (j, (addr, size)) in live.drain(..).enumerate() {
                if j % 2 == 0 {
                    allocator.dead_object(&mut ctx(&mut stats, -1), addr);
                } else {
                    survivors.push((addr, size));
                }
            }
            live = survivors;
            allocator.gc_start(&mut ctx(&mut stats, 0));

            let expected_object_bytes: u64 = live.iter().map(|&(_, s)| s).sum();
            assert_eq!(stats.object_bytes, expected_object_bytes);
            let mapped = allocator.pages.borrow().address_space().total_mapped();
            assert_eq!(
                stats.object_bytes + stats.stack_bytes + stats.unused_bytes + stats.free_bytes,
                mapped,
                "liveness identity broke in round {round}"
            );
        }
    }
}
