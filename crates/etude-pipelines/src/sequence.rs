use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::segment::SegmentChain;

/// An absolute offset into the stream a reader is consuming.
///
/// Positions are only meaningful for the reader that handed them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequencePosition(u64);

impl SequencePosition {
    #[inline]
    pub fn offset(self) -> u64 {
        self.0
    }

    pub(crate) fn new(offset: u64) -> Self {
        SequencePosition(offset)
    }
}

/// A read-only view over the buffered bytes of a reader, possibly spanning
/// several segments. Nothing is copied until the caller asks for it.
#[derive(Clone, Copy)]
pub struct ReadOnlySequence<'a> {
    chain: Option<&'a SegmentChain>,
    start: u64,
    end: u64,
}

impl<'a> ReadOnlySequence<'a> {
    pub(crate) fn new(chain: &'a SegmentChain) -> Self {
        ReadOnlySequence {
            chain: Some(chain),
            start: chain.start_index(),
            end: chain.end_index(),
        }
    }

    /// An empty sequence at `offset`.
    pub(crate) fn empty(offset: u64) -> Self {
        ReadOnlySequence {
            chain: None,
            start: offset,
            end: offset,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    pub fn start(&self) -> SequencePosition {
        SequencePosition(self.start)
    }

    #[inline]
    pub fn end(&self) -> SequencePosition {
        SequencePosition(self.end)
    }

    /// The position `offset` bytes into this sequence.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is past the end of the sequence.
    pub fn position(&self, offset: usize) -> SequencePosition {
        assert!(offset <= self.len(), "offset {offset} outside sequence of {}", self.len());
        SequencePosition(self.start + offset as u64)
    }

    /// The sub-sequence from `offset` to the end.
    pub fn slice(&self, offset: usize) -> ReadOnlySequence<'a> {
        let start = self.position(offset).0;
        ReadOnlySequence {
            chain: self.chain,
            start,
            end: self.end,
        }
    }

    /// Contiguous chunks in stream order.
    pub fn chunks(&self) -> impl Iterator<Item = &'a [u8]> + 'a {
        let (start, end) = (self.start, self.end);
        self.chain
            .into_iter()
            .flat_map(|chain| chain.iter())
            .filter_map(move |segment| {
                let seg_start = segment.running_index();
                let seg_end = seg_start + segment.len() as u64;
                let lo = start.max(seg_start);
                let hi = end.min(seg_end);
                if lo >= hi {
                    return None;
                }
                let memory = segment.memory();
                Some(&memory[(lo - seg_start) as usize..(hi - seg_start) as usize])
            })
    }

    /// The first contiguous chunk, or an empty slice.
    pub fn first(&self) -> &'a [u8] {
        self.chunks().next().unwrap_or(&[])
    }

    /// Position of the first occurrence of `byte`.
    pub fn find(&self, byte: u8) -> Option<SequencePosition> {
        let mut offset = self.start;
        for chunk in self.chunks() {
            if let Some(i) = memchr::memchr(byte, chunk) {
                return Some(SequencePosition(offset + i as u64));
            }
            offset += chunk.len() as u64;
        }
        None
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len());
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }
}

impl fmt::Debug for ReadOnlySequence<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOnlySequence")
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BlockPool;
    use crate::segment::BufferSegment;

    fn chain_of(pool: &mut BlockPool, parts: &[&[u8]]) -> SegmentChain {
        let mut chain = SegmentChain::new();
        for part in parts {
            let mut seg = BufferSegment::new();
            seg.set_memory(pool.rent(0), 0, 0);
            seg.available_memory()[..part.len()].copy_from_slice(part);
            seg.set_end(part.len());
            chain.append(seg);
        }
        chain
    }

    #[test]
    fn test_sequence_spans_segments() {
        let mut pool = BlockPool::new(8);
        let chain = chain_of(&mut pool, &[b"GET /", b"index", b"\r\n"]);
        let seq = ReadOnlySequence::new(&chain);

        assert_eq!(seq.len(), 12);
        assert_eq!(seq.first(), b"GET /");
        assert_eq!(seq.to_vec(), b"GET /index\r\n");
        assert_eq!(seq.find(b'\r'), Some(seq.position(10)));
        assert_eq!(seq.find(b'?'), None);
    }

    #[test]
    fn test_slice_skips_prefix() {
        let mut pool = BlockPool::new(8);
        let chain = chain_of(&mut pool, &[b"abc", b"def"]);
        let seq = ReadOnlySequence::new(&chain).slice(2);

        assert_eq!(seq.to_vec(), b"cdef");
        assert_eq!(seq.chunks().count(), 2);
        assert_eq!(seq.to_bytes(), Bytes::from_static(b"cdef"));
    }
}
