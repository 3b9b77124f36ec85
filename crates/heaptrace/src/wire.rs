//! On-disk trace layout constants.
//!
//! A trace is a 4-byte file header followed by fixed-size batches. Bytes 2
//! and 3 of the file header hold a big-endian version; each batch opens
//! with a `BATCH_START` record naming its processor, a `SYNC` record naming
//! its starting tick, and closes with `BATCH_END`. Everything in between is
//! a sequence of tagged, varint-encoded records.

/// Size of the file header in bytes.
pub const TRACE_HEADER_BYTES: u64 = 4;

/// Size of every batch in bytes; batches are zero-padded to this stride.
pub const BATCH_BYTES: usize = 32 << 10;

/// The only trace version this crate understands (major 1, minor 15).
pub const SUPPORTED_VERSION: u16 = 1 << 8 | 15;

/// Record tags.
///
/// Tag 0 is reserved as invalid.
pub mod tag {
    /// Establishes the base address for a span class.
    pub const SPAN_ACQUIRE: u8 = 1;
    /// Class allocation relative to an acquired span base.
    pub const ALLOC: u8 = 2;
    /// [`ALLOC`] for an array type.
    pub const ALLOC_ARRAY: u8 = 3;
    /// Large allocation with an absolute address.
    pub const ALLOC_LARGE: u8 = 4;
    /// [`ALLOC_LARGE`] for pointer-free data.
    pub const ALLOC_LARGE_NOSCAN: u8 = 5;
    /// [`ALLOC_LARGE`] for an array type.
    pub const ALLOC_LARGE_ARRAY: u8 = 6;
    /// [`ALLOC_LARGE_ARRAY`] for pointer-free data.
    pub const ALLOC_LARGE_ARRAY_NOSCAN: u8 = 7;
    /// Clears the base address for a span class.
    pub const SPAN_RELEASE: u8 = 8;
    /// Sets the sweep timestamp and the base address for following frees.
    pub const SWEEP: u8 = 9;
    /// Free at an offset from the current sweep base.
    pub const FREE: u8 = 10;
    /// GC sweep termination.
    pub const SWEEP_TERM: u8 = 11;
    /// GC mark termination.
    pub const MARK_TERM: u8 = 12;
    /// Overrides the batch's sync tick.
    pub const SYNC: u8 = 13;
    /// Opens a batch; only valid in the batch header.
    pub const BATCH_START: u8 = 14;
    /// Closes a batch; trailing bytes after it are padding.
    pub const BATCH_END: u8 = 15;
    /// Stack allocation of a power-of-two size.
    pub const STACK_ALLOC: u8 = 16;
    /// Stack free.
    pub const STACK_FREE: u8 = 17;
}
