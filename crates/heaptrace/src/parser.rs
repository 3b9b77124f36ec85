//! Trace indexing and the globally ordered event stream.
//!
//! Construction is the only parallel phase. Phase 1 splits the batches
//! into shards, scans each batch's header prefix, and builds sorted
//! per-shard, per-processor offset lists. Phase 2 k-way-merges the shard
//! lists into one ordered batch list per processor, with processors
//! distributed over a worker pool through a shared channel. After that the
//! parser is a strictly single-threaded pull source.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::thread;

use parking_lot::Mutex;

use crate::batch::BatchReader;
use crate::error::ParseError;
use crate::event::{Event, ProcId};
use crate::source::TraceSource;
use crate::varint;
use crate::wire::{tag, BATCH_BYTES, SUPPORTED_VERSION, TRACE_HEADER_BYTES};

/// One indexed batch: where it lives and when it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BatchOffset {
    start_ticks: u64,
    file_offset: u64,
}

/// A parser over a heap allocation trace.
///
/// Yields the trace's events in non-decreasing timestamp order across all
/// processors; ties go to the lowest processor id. The parser holds one
/// look-ahead event per processor and reads batches lazily, so memory use
/// is proportional to the processor count, not the trace size.
pub struct Parser<S> {
    src: S,
    index: Vec<VecDeque<BatchOffset>>,
    readers: Vec<BatchReader>,
    lookahead: Vec<Option<Event>>,
    total_batches: u64,
}

impl<S: TraceSource> Parser<S> {
    /// Create a parser, ordering the trace's batches first.
    ///
    /// Indexing reads every batch header and may be computationally
    /// expensive; it parallelizes across the machine.
    ///
    /// # Errors
    ///
    /// Fails on a malformed file length or header, an unsupported trace
    /// version, or any batch-header decode error found while indexing.
    pub fn new(src: S) -> Result<Self, ParseError> {
        let parallelism = thread::available_parallelism().map_or(1, NonZeroUsize::get);
        Self::with_parallelism(src, parallelism)
    }

    /// [`Parser::new`] with a pinned worker count, for deterministic tests.
    ///
    /// # Errors
    ///
    /// As [`Parser::new`].
    ///
    /// # Panics
    ///
    /// Panics if `max_parallelism` is zero.
    pub fn with_parallelism(src: S, max_parallelism: usize) -> Result<Self, ParseError> {
        assert!(max_parallelism > 0, "need at least one worker");

        let len = src.len();
        if len < TRACE_HEADER_BYTES || (len - TRACE_HEADER_BYTES) % BATCH_BYTES as u64 != 0 {
            return Err(ParseError::BadFileLength(len));
        }
        let version = read_version(&src)?;
        if version != SUPPORTED_VERSION {
            return Err(ParseError::UnsupportedVersion(version));
        }

        let num_batches = usize::try_from((len - TRACE_HEADER_BYTES) / BATCH_BYTES as u64)
            .expect("batch count exceeds address space");
        let shards = if max_parallelism > num_batches {
            1
        } else {
            max_parallelism
        };
        let per_shard = num_batches.div_ceil(shards);

        let shard_indexes = scan_shards(&src, shards, per_shard, num_batches)?;
        let index = merge_shards(&shard_indexes, shards);

        tracing::debug!(
            batches = num_batches,
            shards,
            procs = index.len(),
            "trace index built"
        );

        let procs = index.len();
        let mut parser = Self {
            src,
            index,
            readers: (0..procs).map(|_| BatchReader::new()).collect(),
            lookahead: vec![None; procs],
            total_batches: num_batches as u64,
        };
        for pid in 0..procs {
            parser.refill(pid)?;
        }
        Ok(parser)
    }

    /// Return the next event in the trace, or `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Surfaces batch decode errors; the parser is then in an unspecified
    /// state and should not be consumed further.
    pub fn next(&mut self) -> Result<Option<Event>, ParseError> {
        // Find the processor holding the earliest unread event. Scanning
        // in id order makes timestamp ties deterministic.
        let mut min_pid = None;
        let mut min_ticks = u64::MAX;
        for (pid, slot) in self.lookahead.iter().enumerate() {
            if let Some(ev) = slot {
                if ev.timestamp < min_ticks {
                    min_ticks = ev.timestamp;
                    min_pid = Some(pid);
                }
            }
        }
        let Some(pid) = min_pid else {
            return Ok(None);
        };

        let mut ev = self.lookahead[pid].take().expect("look-ahead vanished");
        ev.proc = ProcId(pid as i32 - 1);

        match self.readers[pid].next_event()? {
            Some(next) => self.lookahead[pid] = Some(next),
            None => self.refill(pid)?,
        }
        Ok(Some(ev))
    }

    /// Approximate progress through the trace in `[0, 1]`.
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.total_batches == 0 {
            return 1.0;
        }
        let left: u64 = self.index.iter().map(|q| q.len() as u64).sum();
        (self.total_batches - left) as f64 / self.total_batches as f64
    }

    /// Load batches for `pid` until one yields an event into the
    /// look-ahead slot, parking the processor when its batches run out.
    /// Batches that carry no events (header and terminator only) chain
    /// straight to the next one.
    fn refill(&mut self, pid: usize) -> Result<(), ParseError> {
        loop {
            let Some(bo) = self.index[pid].pop_front() else {
                self.lookahead[pid] = None;
                return Ok(());
            };
            let reader = &mut self.readers[pid];
            let n = self.src.read_at(bo.file_offset, reader.buf_mut())?;
            if n < BATCH_BYTES {
                return Err(ParseError::TruncatedTrace);
            }
            reader.begin(bo.start_ticks);
            if let Some(ev) = reader.next_event()? {
                self.lookahead[pid] = Some(ev);
                return Ok(());
            }
        }
    }
}

/// Read the 4-byte file header and extract the big-endian version from
/// bytes 2 and 3.
fn read_version<S: TraceSource>(src: &S) -> Result<u16, ParseError> {
    let mut header = [0u8; TRACE_HEADER_BYTES as usize];
    let n = src.read_at(0, &mut header)?;
    if n < header.len() {
        return Err(ParseError::TruncatedTrace);
    }
    Ok(u16::from_be_bytes([header[2], header[3]]))
}

/// Decode `(processor, start_ticks)` from the front of a batch.
fn parse_batch_header(buf: &[u8]) -> Result<(u64, u64), ParseError> {
    if buf.first() != Some(&tag::BATCH_START) {
        return Err(ParseError::UnexpectedTag(buf.first().copied().unwrap_or(0)));
    }
    let (n, pid) = varint::decode(&buf[1..])?;
    let rest = &buf[1 + n..];
    if rest.first() != Some(&tag::SYNC) {
        return Err(ParseError::UnexpectedTag(rest.first().copied().unwrap_or(0)));
    }
    let (_, ticks) = varint::decode(&rest[1..])?;
    Ok((pid, ticks))
}

/// Phase 1: scan batch headers shard-by-shard, producing for each shard a
/// per-processor list of batch offsets sorted by starting tick.
fn scan_shards<S: TraceSource>(
    src: &S,
    shards: usize,
    per_shard: usize,
    num_batches: usize,
) -> Result<Vec<Vec<Vec<BatchOffset>>>, ParseError> {
    thread::scope(|scope| {
        let handles: Vec<_> = (0..shards)
            .map(|shard| {
                scope.spawn(move || -> Result<Vec<Vec<BatchOffset>>, ParseError> {
                    let mut index: Vec<Vec<BatchOffset>> = Vec::new();
                    let start = (shard * per_shard).min(num_batches);
                    let end = ((shard + 1) * per_shard).min(num_batches);
                    // The header prefix is at most a tag, a processor
                    // varint, a sync tag, and a tick varint.
                    let mut buf = [0u8; 16];
                    for batch in start..end {
                        let offset = TRACE_HEADER_BYTES + batch as u64 * BATCH_BYTES as u64;
                        let n = src.read_at(offset, &mut buf)?;
                        if n < buf.len() {
                            return Err(ParseError::TruncatedTrace);
                        }
                        let (pid, start_ticks) = parse_batch_header(&buf)?;
                        let pid = usize::try_from(pid)
                            .map_err(|_| ParseError::UnexpectedTag(tag::BATCH_START))?;
                        if pid >= index.len() {
                            index.resize_with(pid + 1, Vec::new);
                        }
                        index[pid].push(BatchOffset {
                            start_ticks,
                            file_offset: offset,
                        });
                    }
                    for list in &mut index {
                        list.sort_by_key(|bo| bo.start_ticks);
                    }
                    Ok(index)
                })
            })
            .collect();
        // First worker error wins.
        handles
            .into_iter()
            .map(|h| h.join().expect("shard scan panicked"))
            .collect()
    })
}

/// Phase 2: for every processor seen by any shard, merge the shards'
/// sorted lists into one globally ordered list. Processors are handed to
/// workers through a shared channel; ticks tie-break by shard index.
fn merge_shards(
    shard_indexes: &[Vec<Vec<BatchOffset>>],
    shards: usize,
) -> Vec<VecDeque<BatchOffset>> {
    let procs = shard_indexes.iter().map(Vec::len).max().unwrap_or(0);
    let merged = Mutex::new(vec![VecDeque::new(); procs]);

    let (tx, rx) = crossbeam::channel::unbounded::<usize>();
    for pid in 0..procs {
        tx.send(pid).expect("work channel closed early");
    }
    drop(tx);

    thread::scope(|scope| {
        for _ in 0..shards.min(procs.max(1)) {
            let rx = rx.clone();
            let merged = &merged;
            scope.spawn(move || {
                while let Ok(pid) = rx.recv() {
                    let mut cursors = vec![0usize; shard_indexes.len()];
                    let mut out = VecDeque::new();
                    loop {
                        let mut min_shard = None;
                        let mut min_ticks = u64::MAX;
                        for (si, shard) in shard_indexes.iter().enumerate() {
                            let head = shard.get(pid).and_then(|list| list.get(cursors[si]));
                            if let Some(bo) = head {
                                if bo.start_ticks < min_ticks {
                                    min_ticks = bo.start_ticks;
                                    min_shard = Some(si);
                                }
                            }
                        }
                        let Some(si) = min_shard else { break };
                        out.push_back(shard_indexes[si][pid][cursors[si]]);
                        cursors[si] += 1;
                    }
                    merged.lock()[pid] = out;
                }
            });
        }
    });

    merged.into_inner()
}
