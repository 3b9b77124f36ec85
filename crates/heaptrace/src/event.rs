//! Decoded trace events.

/// Identifier of the runtime processor that emitted an event.
///
/// Processor ids are small non-negative integers; [`ProcId::NONE`] marks
/// events that carry no processor attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcId(pub i32);

impl ProcId {
    /// Sentinel for "no processor".
    pub const NONE: Self = Self(-1);
}

/// What a trace event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// An object allocation.
    Alloc,
    /// An object free, observed during sweeping.
    Free,
    /// GC sweep termination: the start of a new cycle's mutator phase.
    GcStart,
    /// GC mark termination: the live/dead partition is now known.
    GcEnd,
    /// A stack allocation.
    StackAlloc,
    /// A stack free.
    StackFree,
}

/// A single allocation trace event.
///
/// Events are yielded by [`Parser::next`](crate::Parser::next) in
/// non-decreasing timestamp order across all processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Time of the event in opaque monotonic ticks.
    pub timestamp: u64,

    /// Address of the allocation or free. Valid for `Alloc`, `Free`,
    /// `StackAlloc`, and `StackFree` events.
    pub address: u64,

    /// Size of the allocation in bytes. Valid for `Alloc` and `StackAlloc`
    /// events.
    pub size: u64,

    /// The processor that generated the event.
    pub proc: ProcId,

    /// Whether the allocation was for an array type.
    pub array: bool,

    /// Whether the allocation is guaranteed free of pointers.
    pub pointer_free: bool,

    /// What kind of event this is.
    pub kind: EventKind,
}
