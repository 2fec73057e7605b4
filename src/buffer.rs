//! Scatter-gather buffer chains.
//!
//! A [`BufferChain`] is a sequence of fixed-capacity segments produced and consumed by the
//! cipher engines. Segments are never assumed contiguous with each other; only the first
//! `header_length` bytes of the first segment are required to be contiguous (the MAC header
//! precondition used by [`crate::header`]).

use bytes::BytesMut;
use std::collections::VecDeque;

/// External collaborator: supplies fresh, fixed-capacity segments and is the sole point of
/// allocation failure in this crate. A real driver backs this with a pool of pre-sized
/// buffers; tests back it with a `Vec`-backed allocator that can be told to fail after N
/// calls.
pub trait SegmentAllocator {
    /// Return a new, empty segment, or `None` if the pool is exhausted.
    fn allocate(&self) -> Option<BytesMut>;
}

/// A linked sequence of segments with a running total length.
#[derive(Debug, Default)]
pub struct BufferChain {
    segments: VecDeque<BytesMut>,
    total_len: usize,
}

impl BufferChain {
    pub fn new() -> Self {
        BufferChain { segments: VecDeque::new(), total_len: 0 }
    }

    pub fn from_segment(segment: BytesMut) -> Self {
        let total_len = segment.len();
        let mut segments = VecDeque::new();
        segments.push_back(segment);
        BufferChain { segments, total_len }
    }

    pub fn from_segments(segments: VecDeque<BytesMut>) -> Self {
        let total_len = segments.iter().map(|s| s.len()).sum();
        BufferChain { segments, total_len }
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    /// The crate's single contiguity assumption: the MAC header lives entirely in the
    /// first segment.
    pub fn first_segment(&self) -> Option<&BytesMut> {
        self.segments.front()
    }

    pub fn first_segment_mut(&mut self) -> Option<&mut BytesMut> {
        self.segments.front_mut()
    }

    pub fn segments(&self) -> impl Iterator<Item = &BytesMut> {
        self.segments.iter()
    }

    pub fn into_segments(self) -> VecDeque<BytesMut> {
        self.segments
    }

    /// Copy `len` bytes starting `offset` bytes into the chain out to a flat buffer.
    /// Panics if the chain does not hold that many bytes; callers are expected to have
    /// already length-checked via `total_len`.
    pub fn copy_out(&self, offset: usize, len: usize, dst: &mut [u8]) {
        assert!(dst.len() >= len);
        let mut remaining_skip = offset;
        let mut written = 0;
        for seg in &self.segments {
            if written == len {
                break;
            }
            if remaining_skip >= seg.len() {
                remaining_skip -= seg.len();
                continue;
            }
            let start = remaining_skip;
            let take = (seg.len() - start).min(len - written);
            dst[written..written + take].copy_from_slice(&seg[start..start + take]);
            written += take;
            remaining_skip = 0;
        }
        assert_eq!(written, len, "buffer chain shorter than requested copy_out range");
    }

    /// Build a reader cursor positioned at the start of this chain.
    pub fn reader(&self) -> Reader<'_> {
        Reader { segments: &self.segments, index: 0, offset: 0 }
    }
}

/// Read-only cursor over a chain, bounded to one segment's remaining bytes per call.
pub struct Reader<'a> {
    segments: &'a VecDeque<BytesMut>,
    index: usize,
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Skip forward past any fully-consumed segments without copying.
    pub fn seek(&mut self, mut skip: usize) {
        while skip > 0 {
            let seg = match self.segments.get(self.index) {
                Some(s) => s,
                None => return,
            };
            let remaining = seg.len() - self.offset;
            if skip < remaining {
                self.offset += skip;
                return;
            }
            skip -= remaining;
            self.index += 1;
            self.offset = 0;
        }
    }

    /// The longest contiguous run available right now without crossing a segment boundary,
    /// capped at `max`.
    pub fn run(&self, max: usize) -> &'a [u8] {
        match self.segments.get(self.index) {
            Some(seg) => {
                let avail = seg.len() - self.offset;
                let take = avail.min(max);
                &seg[self.offset..self.offset + take]
            }
            None => &[],
        }
    }

    /// Advance the cursor past `n` bytes of the current segment, moving to the next
    /// segment if it is now exhausted. `n` must not exceed what `run` last reported.
    pub fn advance(&mut self, n: usize) {
        self.offset += n;
        if let Some(seg) = self.segments.get(self.index) {
            if self.offset == seg.len() {
                self.index += 1;
                self.offset = 0;
            }
        }
    }

    pub fn at_end(&self) -> bool {
        self.index >= self.segments.len()
    }
}

/// Append-only cursor that lazily pulls fresh segments from a [`SegmentAllocator`] as the
/// current one fills up. Used to build an output chain alongside an input [`Reader`].
pub struct Writer<'a> {
    allocator: &'a dyn SegmentAllocator,
    segments: VecDeque<BytesMut>,
    failed: bool,
}

impl<'a> Writer<'a> {
    pub fn new(allocator: &'a dyn SegmentAllocator) -> Self {
        Writer { allocator, segments: VecDeque::new(), failed: false }
    }

    fn ensure_room(&mut self) -> bool {
        if self.failed {
            return false;
        }
        let needs_new = match self.segments.back() {
            Some(seg) => seg.len() >= seg.capacity(),
            None => true,
        };
        if needs_new {
            match self.allocator.allocate() {
                Some(seg) => self.segments.push_back(seg),
                None => {
                    self.failed = true;
                    return false;
                }
            }
        }
        true
    }

    /// Room left in the current (tail) segment, after ensuring one exists.
    pub fn run_capacity(&mut self) -> usize {
        if !self.ensure_room() {
            return 0;
        }
        let seg = self.segments.back().unwrap();
        seg.capacity() - seg.len()
    }

    /// Append up to `src.len()` bytes, splitting across a new segment if needed. Returns
    /// the number of bytes actually written (less than `src.len()` only on allocation
    /// failure, which also marks this writer permanently failed).
    pub fn write(&mut self, mut src: &[u8]) -> usize {
        let mut total = 0;
        while !src.is_empty() {
            let room = self.run_capacity();
            if room == 0 {
                break;
            }
            let take = room.min(src.len());
            self.segments.back_mut().unwrap().extend_from_slice(&src[..take]);
            src = &src[take..];
            total += take;
        }
        total
    }

    /// Append a single byte. Returns `false` (and marks the writer failed) only if a new
    /// segment was needed and the allocator was exhausted.
    pub fn push_byte(&mut self, byte: u8) -> bool {
        if self.run_capacity() == 0 {
            return false;
        }
        self.segments.back_mut().unwrap().extend_from_slice(&[byte]);
        true
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn into_chain(self) -> Option<BufferChain> {
        if self.failed {
            None
        } else {
            Some(BufferChain::from_segments(self.segments))
        }
    }
}

/// Simple fixed-capacity, optionally fault-injecting allocator used by tests and by any
/// caller that does not need a real pool.
pub struct VecAllocator {
    capacity: usize,
    fail_after: std::cell::Cell<Option<usize>>,
}

impl VecAllocator {
    pub fn new(capacity: usize) -> Self {
        VecAllocator { capacity, fail_after: std::cell::Cell::new(None) }
    }

    /// Make the `n`-th call to `allocate` (0-indexed) and every call after it return `None`.
    pub fn fail_after(capacity: usize, n: usize) -> Self {
        VecAllocator { capacity, fail_after: std::cell::Cell::new(Some(n)) }
    }
}

impl SegmentAllocator for VecAllocator {
    fn allocate(&self) -> Option<BytesMut> {
        match self.fail_after.get() {
            Some(0) => None,
            Some(n) => {
                self.fail_after.set(Some(n - 1));
                Some(BytesMut::with_capacity(self.capacity))
            }
            None => Some(BytesMut::with_capacity(self.capacity)),
        }
    }
}
