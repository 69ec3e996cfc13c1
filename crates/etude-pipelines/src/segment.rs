//! Pooled buffer segments and the chain that strings them together.
//!
//! A segment owns one rented block and exposes the window `[start, end)` of
//! it that holds live bytes. Writers grow `end` at the tail of the chain,
//! readers (or flushes) move `start` forward at the head. Every segment
//! carries a running index, the absolute stream offset of its first live
//! byte, so any position in the chain maps to an offset in O(1).
//!
//! ```text
//!  head                                         tail
//!  ┌──────────────┐   ┌──────────────┐   ┌──────────────┬─────────┐
//!  │ ░░░░ live    │ → │ live         │ → │ live         │ free    │
//!  └──────────────┘   └──────────────┘   └──────────────┴─────────┘
//!   ^start     end^                       ^start     end^ capacity^
//! ```

use std::collections::VecDeque;

use crate::pool::BlockPool;

/// One rented block plus its live window.
///
/// Offsets always satisfy `0 <= start <= end <= capacity`. Breaking that is
/// a bug in the calling adapter, so every mutation asserts it.
#[derive(Debug, Default)]
pub struct BufferSegment {
    memory: Option<Box<[u8]>>,
    start: usize,
    end: usize,
    running_index: u64,
}

impl BufferSegment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a rented block and set the live window.
    pub fn set_memory(&mut self, block: Box<[u8]>, start: usize, end: usize) {
        assert!(
            start <= end && end <= block.len(),
            "segment window {start}..{end} does not fit a block of {} bytes",
            block.len()
        );
        self.memory = Some(block);
        self.start = start;
        self.end = end;
    }

    /// Move the end of the live window.
    pub fn set_end(&mut self, end: usize) {
        assert!(
            end >= self.start && end <= self.capacity(),
            "segment end {end} outside {}..={}",
            self.start,
            self.capacity()
        );
        self.end = end;
    }

    /// Drop `count` bytes from the front of the live window.
    pub fn advance_start(&mut self, count: usize) {
        assert!(
            count <= self.end - self.start,
            "cannot consume {count} bytes from a window of {}",
            self.end - self.start
        );
        self.start += count;
        self.running_index += count as u64;
    }

    /// Rewind an empty window to the beginning of the block so the whole
    /// block becomes writable again.
    pub fn rewind(&mut self) {
        assert!(self.is_empty(), "cannot rewind a segment holding live bytes");
        self.start = 0;
        self.end = 0;
    }

    /// Release the block. Only legal once the window is empty.
    pub fn reset_memory(&mut self) -> Option<Box<[u8]>> {
        assert!(self.is_empty(), "released a segment that still holds live bytes");
        self.start = 0;
        self.end = 0;
        self.memory.take()
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.memory.as_ref().map_or(0, |m| m.len())
    }

    /// Bytes that can still be written after `end`.
    #[inline]
    pub fn writable(&self) -> usize {
        self.capacity() - self.end
    }

    #[inline]
    pub fn running_index(&self) -> u64 {
        self.running_index
    }

    /// The live window.
    pub fn memory(&self) -> &[u8] {
        match &self.memory {
            Some(block) => &block[self.start..self.end],
            None => &[],
        }
    }

    /// The writable region after the live window.
    pub fn available_memory(&mut self) -> &mut [u8] {
        let end = self.end;
        match &mut self.memory {
            Some(block) => &mut block[end..],
            None => &mut [],
        }
    }
}

/// The singly linked segment chain of one reader or writer.
///
/// Stored as a deque: appending at the tail is the linked-list `next`
/// assignment, and only fully consumed head segments are ever released.
#[derive(Debug, Default)]
pub struct SegmentChain {
    segments: VecDeque<BufferSegment>,
    /// Absolute offset where the chain begins once every segment is released.
    base_index: u64,
}

impl SegmentChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `segment` as the new tail and recompute running indices
    /// forward from the head.
    pub fn append(&mut self, mut segment: BufferSegment) {
        if self.segments.is_empty() {
            segment.running_index = self.base_index;
        }
        self.segments.push_back(segment);
        self.recompute_running_indices();
    }

    fn recompute_running_indices(&mut self) {
        let mut segments = self.segments.iter_mut();
        let Some(first) = segments.next() else {
            return;
        };
        let mut next_index = first.running_index + first.len() as u64;
        for segment in segments {
            segment.running_index = next_index;
            next_index += segment.len() as u64;
        }
    }

    /// Consume `count` bytes from the head, handing every fully consumed
    /// segment except the tail back to `pool`. The tail is released too when
    /// `release_tail` is set and it ends up empty.
    pub fn consume(&mut self, mut count: usize, pool: &mut BlockPool, release_tail: bool) {
        while count > 0 {
            let Some(head) = self.segments.front_mut() else {
                panic!("consumed {count} bytes past the end of the chain");
            };
            let take = count.min(head.len());
            head.advance_start(take);
            count -= take;
            if head.is_empty() && self.segments.len() > 1 {
                self.release_head(pool);
            } else if count > 0 {
                panic!("consumed {count} bytes past the end of the chain");
            }
        }
        if release_tail && self.segments.len() == 1 && self.segments[0].is_empty() {
            self.release_head(pool);
        }
    }

    /// Pop the head segment and give its block back.
    pub fn release_head(&mut self, pool: &mut BlockPool) {
        if let Some(mut head) = self.segments.pop_front() {
            self.base_index = head.running_index + head.len() as u64;
            if let Some(block) = head.reset_memory() {
                pool.give_back(block);
            }
        }
    }

    /// Release every segment regardless of content.
    pub fn release_all(&mut self, pool: &mut BlockPool) {
        while let Some(mut segment) = self.segments.pop_front() {
            self.base_index = segment.running_index + segment.len() as u64;
            segment.start = segment.end;
            if let Some(block) = segment.reset_memory() {
                pool.give_back(block);
            }
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments in the chain.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Live bytes across the chain.
    pub fn buffered(&self) -> usize {
        self.segments.iter().map(BufferSegment::len).sum()
    }

    /// Absolute offset of the first live byte.
    pub fn start_index(&self) -> u64 {
        self.segments
            .front()
            .map_or(self.base_index, BufferSegment::running_index)
    }

    /// Absolute offset one past the last live byte.
    pub fn end_index(&self) -> u64 {
        self.segments
            .back()
            .map_or(self.base_index, |tail| tail.running_index + tail.len() as u64)
    }

    pub fn front(&self) -> Option<&BufferSegment> {
        self.segments.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut BufferSegment> {
        self.segments.front_mut()
    }

    pub fn tail(&self) -> Option<&BufferSegment> {
        self.segments.back()
    }

    pub fn tail_mut(&mut self) -> Option<&mut BufferSegment> {
        self.segments.back_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferSegment> {
        self.segments.iter()
    }
}
