//! End-to-end parser tests over synthesized traces.

use heaptrace::wire::{tag, BATCH_BYTES, SUPPORTED_VERSION};
use heaptrace::{varint, Event, EventKind, ParseError, Parser, ProcId};

/// Builder for one trace batch.
struct Batch {
    buf: Vec<u8>,
}

impl Batch {
    fn new(pid: u64, start_ticks: u64) -> Self {
        let mut buf = vec![tag::BATCH_START];
        varint::encode(pid, &mut buf);
        buf.push(tag::SYNC);
        varint::encode(start_ticks, &mut buf);
        Self { buf }
    }

    fn record(mut self, record_tag: u8, fields: &[u64]) -> Self {
        self.buf.push(record_tag);
        for &f in fields {
            varint::encode(f, &mut self.buf);
        }
        self
    }

    fn span_acquire(mut self, class: u8, base: u64) -> Self {
        self.buf.extend_from_slice(&[tag::SPAN_ACQUIRE, class]);
        varint::encode(base, &mut self.buf);
        self
    }

    fn alloc(mut self, class: u8, offset: u64, size_diff: u64, tick_delta: u64) -> Self {
        self.buf.extend_from_slice(&[tag::ALLOC, class]);
        for f in [offset, size_diff, tick_delta] {
            varint::encode(f, &mut self.buf);
        }
        self
    }

    fn span_release(mut self, class: u8) -> Self {
        self.buf.extend_from_slice(&[tag::SPAN_RELEASE, class]);
        self
    }

    fn sweep(self, tick_delta: u64, base: u64) -> Self {
        self.record(tag::SWEEP, &[tick_delta, base])
    }

    fn free(self, offset: u64) -> Self {
        self.record(tag::FREE, &[offset])
    }

    fn stack_alloc(mut self, order: u8, base: u64, tick_delta: u64) -> Self {
        self.buf.extend_from_slice(&[tag::STACK_ALLOC, order]);
        for f in [base, tick_delta] {
            varint::encode(f, &mut self.buf);
        }
        self
    }

    fn finish(mut self) -> Vec<u8> {
        self.buf.push(tag::BATCH_END);
        assert!(self.buf.len() <= BATCH_BYTES, "batch overflowed");
        self.buf.resize(BATCH_BYTES, 0);
        self.buf
    }
}

fn trace(batches: impl IntoIterator<Item = Vec<u8>>) -> Vec<u8> {
    let mut out = vec![0, 0, (SUPPORTED_VERSION >> 8) as u8, SUPPORTED_VERSION as u8];
    for batch in batches {
        assert_eq!(batch.len(), BATCH_BYTES);
        out.extend_from_slice(&batch);
    }
    out
}

fn drain(parser: &mut Parser<Vec<u8>>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(ev) = parser.next().expect("parse failed") {
        events.push(ev);
    }
    events
}

#[test]
fn empty_trace_ends_immediately() {
    let mut parser = Parser::new(trace([])).unwrap();
    assert_eq!(parser.next().unwrap(), None);
    assert!((parser.progress() - 1.0).abs() < f64::EPSILON);
}

#[test]
fn bad_lengths_are_rejected() {
    for len in [0usize, 3, 5, BATCH_BYTES, BATCH_BYTES + 3, 2 * BATCH_BYTES + 5] {
        let data = vec![0u8; len];
        assert!(
            matches!(Parser::new(data), Err(ParseError::BadFileLength(l)) if l == len as u64),
            "length {len} accepted"
        );
    }
}

#[test]
fn unsupported_versions_are_rejected() {
    for version in [0u16, 0x0100, 0x010E, 0x0110, 0x0200, 0xffff] {
        let data = vec![0, 0, (version >> 8) as u8, version as u8];
        assert!(
            matches!(
                Parser::new(data),
                Err(ParseError::UnsupportedVersion(v)) if v == version
            ),
            "version {version:#06x} accepted"
        );
    }
}

#[test]
fn single_batch_single_alloc() {
    // One allocation from span class 3 at offset 0x40, five ticks into a
    // batch starting at tick 100.
    let data = trace([Batch::new(1, 100)
        .span_acquire(3, 0x1000)
        .alloc(3, 0x40, 0, 5)
        .finish()]);
    let mut parser = Parser::new(data).unwrap();
    let events = drain(&mut parser);
    assert_eq!(events.len(), 1);
    let ev = events[0];
    assert_eq!(ev.kind, EventKind::Alloc);
    assert_eq!(ev.address, 0x1040);
    assert_eq!(ev.size, heaptrace::sizeclass::CLASS_TO_SIZE[1]);
    assert_eq!(ev.timestamp, 105);
    assert_eq!(ev.proc, ProcId(0));
    assert!((parser.progress() - 1.0).abs() < f64::EPSILON);
}

#[test]
fn two_processors_interleave() {
    let data = trace([
        Batch::new(1, 10)
            .stack_alloc(11, 0x10_000, 0)
            .stack_alloc(11, 0x20_000, 20)
            .finish(),
        Batch::new(2, 20)
            .stack_alloc(11, 0x30_000, 0)
            .stack_alloc(11, 0x40_000, 20)
            .finish(),
    ]);
    let mut parser = Parser::new(data).unwrap();
    let events = drain(&mut parser);
    let order: Vec<(u64, i32)> = events.iter().map(|e| (e.timestamp, e.proc.0)).collect();
    assert_eq!(order, [(10, 0), (20, 1), (30, 0), (40, 1)]);
}

#[test]
fn sweep_relative_frees() {
    let data = trace([Batch::new(1, 100)
        .sweep(3, 0x2000)
        .free(0x80)
        .free(0x100)
        .finish()]);
    let events = drain(&mut Parser::new(data).unwrap());
    assert_eq!(events.len(), 2);
    for ev in &events {
        assert_eq!(ev.kind, EventKind::Free);
        assert_eq!(ev.timestamp, 103);
    }
    assert_eq!(events[0].address, 0x2080);
    assert_eq!(events[1].address, 0x2100);
}

#[test]
fn span_base_persists_across_batches() {
    // The base acquired in the first batch still resolves class allocs in
    // the second batch of the same processor.
    let data = trace([
        Batch::new(1, 100)
            .span_acquire(4, 0x9000)
            .alloc(4, 0, 0, 1)
            .finish(),
        Batch::new(1, 200).alloc(4, 0x10, 0, 1).finish(),
    ]);
    let events = drain(&mut Parser::new(data).unwrap());
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].address, 0x9000);
    assert_eq!(events[1].address, 0x9010);
    assert_eq!(events[1].timestamp, 201);
}

#[test]
fn release_then_alloc_fails() {
    let data = trace([Batch::new(1, 10)
        .span_acquire(4, 0x9000)
        .span_release(4)
        .alloc(4, 0, 0, 1)
        .finish()]);
    let mut parser = Parser::new(data).unwrap();
    assert!(matches!(
        parser.next(),
        Err(ParseError::UnacquiredSpan { class: 4, op: "alloc" })
    ));
}

#[test]
fn no_processor_batches_map_to_none() {
    let data = trace([Batch::new(0, 10).stack_alloc(11, 0x1000, 0).finish()]);
    let events = drain(&mut Parser::new(data).unwrap());
    assert_eq!(events[0].proc, ProcId::NONE);
}

#[test]
fn timestamps_are_globally_ordered() {
    // Three processors, eight batches each, events at pseudo-random strides;
    // four shards force a real phase-2 merge.
    let mut batches = Vec::new();
    let mut seed = 0x9e37_79b9u64;
    let mut next = move || {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        seed >> 33
    };
    let mut expected_per_proc = [0usize; 3];
    for pid in 1..=3u64 {
        let mut ticks = 1 + next() % 1000;
        for _ in 0..8 {
            let mut batch = Batch::new(pid, ticks);
            let mut delta = 0;
            for _ in 0..5 {
                delta += next() % 512;
                batch = batch.stack_alloc(11, 0x1000 * pid, delta);
                expected_per_proc[(pid - 1) as usize] += 1;
            }
            batches.push(batch.finish());
            ticks += delta + 1 + next() % 1000;
        }
    }
    // Interleave processors' batches in file order.
    let mut shuffled = Vec::new();
    for i in 0..8 {
        for p in 0..3 {
            shuffled.push(batches[p * 8 + i].clone());
        }
    }

    let mut parser = Parser::with_parallelism(trace(shuffled), 4).unwrap();
    let mut last = 0u64;
    let mut seen_per_proc = [0usize; 3];
    let mut last_progress = parser.progress();
    while let Some(ev) = parser.next().unwrap() {
        assert!(ev.timestamp >= last, "timestamps regressed");
        last = ev.timestamp;
        seen_per_proc[ev.proc.0 as usize] += 1;
        let progress = parser.progress();
        assert!(progress >= last_progress - f64::EPSILON);
        last_progress = progress;
    }
    assert_eq!(seen_per_proc, expected_per_proc);
    assert!((parser.progress() - 1.0).abs() < f64::EPSILON);
}

#[test]
fn batch_timestamps_stay_in_their_window() {
    // Two batches per processor: every event from the first batch must
    // carry a timestamp below the second batch's starting tick.
    let data = trace([
        Batch::new(1, 100)
            .stack_alloc(11, 0x1000, 0)
            .stack_alloc(11, 0x2000, 50)
            .finish(),
        Batch::new(1, 500)
            .stack_alloc(11, 0x3000, 0)
            .stack_alloc(11, 0x4000, 50)
            .finish(),
    ]);
    let events = drain(&mut Parser::new(data).unwrap());
    let stamps: Vec<u64> = events.iter().map(|e| e.timestamp).collect();
    assert_eq!(stamps, [100, 150, 500, 550]);
    assert!(stamps[..2].iter().all(|&t| (100..500).contains(&t)));
}
