//! The event-routing simulation driver.

use std::collections::HashMap;

use heaptrace::{Event, EventKind};

use crate::stats::Stats;
use crate::traits::{Context, ObjectAllocator, StackAllocator};

/// Drives one object allocator and one stack allocator over a trace's
/// event stream.
///
/// The two allocators must share an address space, so their allocations
/// never overlap. Trace addresses are opaque identifiers here; the
/// simulator maps them to the simulated allocators' own addresses.
///
/// After every mark termination the driver enters a post-mark state: free
/// events apply immediately as dead-object calls, handing the allocator
/// the live/dead partition before anything else moves, while all other
/// events buffer until the next sweep termination and drain in order.
pub struct Simulator<O, S> {
    objects: O,
    stacks: S,
    collect_events: bool,
    gc_events: Vec<Event>,
    id_to_address: HashMap<u64, u64>,
    id_to_stack: HashMap<u64, (u64, u64)>,
}

impl<O: ObjectAllocator, S: StackAllocator> Simulator<O, S> {
    /// Build a simulator from the two allocators.
    pub fn new(objects: O, stacks: S) -> Self {
        Self {
            objects,
            stacks,
            collect_events: false,
            gc_events: Vec::new(),
            id_to_address: HashMap::new(),
            id_to_stack: HashMap::new(),
        }
    }

    /// Register both allocators' statistics.
    pub fn register_stats(&self, stats: &mut Stats) {
        use crate::traits::Simulation;
        self.objects.register_stats(stats);
        self.stacks.register_stats(stats);
    }

    /// Feed one trace event through the simulation.
    pub fn process(&mut self, ev: Event, stats: &mut Stats) {
        if self.collect_events {
            match ev.kind {
                EventKind::Free => {
                    // Dead objects must reach the allocator before any
                    // other mutation so it can plan its own sweeping.
                    let addr = self
                        .id_to_address
                        .remove(&ev.address)
                        .expect("free of an unknown allocation id");
                    let mut ctx = Context {
                        proc: ev.proc,
                        stats,
                    };
                    self.objects.dead_object(&mut ctx, addr);
                    return;
                }
                EventKind::GcStart => {
                    self.collect_events = false;
                }
                _ => {
                    self.gc_events.push(ev);
                    return;
                }
            }
        }
        if !self.gc_events.is_empty() {
            // Sweep termination: replay everything deferred during the
            // post-mark window. Frees were filtered out above and GC
            // boundaries cannot nest, so only allocations remain.
            let buffered = std::mem::take(&mut self.gc_events);
            for ev in &buffered {
                let mut ctx = Context {
                    proc: ev.proc,
                    stats,
                };
                match ev.kind {
                    EventKind::StackAlloc => {
                        let range = self.stacks.alloc_stack(&mut ctx, ev.size);
                        self.id_to_stack.insert(ev.address, range);
                    }
                    EventKind::StackFree => {
                        let (lo, hi) = self
                            .id_to_stack
                            .remove(&ev.address)
                            .expect("free of an unknown stack id");
                        self.stacks.free_stack(&mut ctx, lo, hi);
                    }
                    EventKind::Alloc => {
                        let addr = self.objects.alloc_object(
                            &mut ctx,
                            ev.size,
                            ev.array,
                            ev.pointer_free,
                        );
                        self.id_to_address.insert(ev.address, addr);
                    }
                    _ => panic!("deferred event of kind {:?}", ev.kind),
                }
            }
        }

        stats.timestamp = ev.timestamp;
        let mut ctx = Context {
            proc: ev.proc,
            stats,
        };
        match ev.kind {
            EventKind::StackAlloc => {
                let range = self.stacks.alloc_stack(&mut ctx, ev.size);
                self.id_to_stack.insert(ev.address, range);
            }
            EventKind::StackFree => {
                let (lo, hi) = self
                    .id_to_stack
                    .remove(&ev.address)
                    .expect("free of an unknown stack id");
                self.stacks.free_stack(&mut ctx, lo, hi);
            }
            EventKind::Alloc => {
                let addr = self
                    .objects
                    .alloc_object(&mut ctx, ev.size, ev.array, ev.pointer_free);
                self.id_to_address.insert(ev.address, addr);
            }
            EventKind::Free => {
                // Possible only for implementations that free concurrently
                // with marking; routed through the same dead-object path.
                let addr = self
                    .id_to_address
                    .remove(&ev.address)
                    .expect("free of an unknown allocation id");
                self.objects.dead_object(&mut ctx, addr);
            }
            EventKind::GcStart => {
                self.objects.gc_start(&mut ctx);
                self.stacks.gc_start(&mut ctx);
            }
            EventKind::GcEnd => {
                // Marking finished: the upcoming frees name the dead set.
                self.objects.gc_end(&mut ctx);
                self.stacks.gc_end(&mut ctx);
                stats.gc_cycles += 1;
                tracing::debug!(
                    cycle = stats.gc_cycles,
                    object_bytes = stats.object_bytes,
                    unused_bytes = stats.unused_bytes,
                    "gc cycle complete"
                );
                self.collect_events = true;
            }
        }
    }
}
