//! Parsing for binary heap allocation traces.
//!
//! A trace is a 4-byte header followed by fixed 32 KiB batches, each
//! belonging to one runtime processor and holding varint-encoded records:
//! allocations (span-relative or absolute), frees (sweep-relative), GC
//! phase boundaries, and stack allocation events. This crate indexes the
//! batches in parallel, then yields a single stream of [`Event`]s ordered
//! by timestamp across all processors.
//!
//! # Quick start
//!
//! ```ignore
//! use heaptrace::{Parser, TraceSource};
//!
//! let data = std::fs::read("heap.trace")?;
//! let mut parser = Parser::new(data)?;
//! while let Some(ev) = parser.next()? {
//!     println!("[{}] {:?} @ {:#x}", ev.timestamp, ev.kind, ev.address);
//! }
//! ```
//!
//! The parser never owns the trace bytes: any [`TraceSource`] with `len`
//! and `read_at` works, including a memory-mapped file.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod batch;
mod error;
mod event;
mod parser;
mod source;

pub mod sizeclass;
pub mod varint;
pub mod wire;

pub use error::ParseError;
pub use event::{Event, EventKind, ProcId};
pub use parser::Parser;
pub use source::TraceSource;
