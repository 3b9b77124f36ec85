//! Trace parsing errors.

use std::io;

use thiserror::Error;

/// Errors produced while indexing or decoding a trace.
///
/// Construction-time errors abort parser creation. Errors surfaced from
/// [`Parser::next`](crate::Parser::next) leave the parser in an unspecified
/// state; callers should stop consuming.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The trace ended in the middle of a record, batch, or header.
    #[error("trace truncated mid-record")]
    TruncatedTrace,

    /// The trace header carries a version this parser does not understand.
    #[error("unsupported trace version {0:#06x}")]
    UnsupportedVersion(u16),

    /// The file is not a 4-byte header followed by whole 32 KiB batches.
    #[error("bad trace length {0}: want a 4-byte header plus whole 32 KiB batches")]
    BadFileLength(u64),

    /// A varint encoding ran past the 10-byte limit for 64-bit values.
    #[error("varint overflow")]
    VarintOverflow,

    /// An unknown record tag, or a known tag in a position it cannot occur.
    #[error("unexpected tag {0:#04x}")]
    UnexpectedTag(u8),

    /// A class allocation or release against a span class whose base was
    /// never established by a span-acquire record.
    #[error("{op} of unacquired span class {class}")]
    UnacquiredSpan {
        /// The offending span class.
        class: u8,
        /// Which operation tripped: `"alloc"` or `"release"`.
        op: &'static str,
    },

    /// The underlying byte source failed.
    #[error("trace read failed")]
    Io(#[from] io::Error),
}
