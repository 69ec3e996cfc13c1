// src/pool.rs

/// Default size of a pooled block.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// How many idle blocks a pool keeps before letting returned blocks drop.
pub const DEFAULT_MAX_RETAINED: usize = 16;

/// A free list of fixed-size byte blocks.
///
/// Each reader or writer owns its own pool, so no locking is involved.
/// Requests larger than `block_size` get a one-off block of exactly the
/// requested size which is never retained.
#[derive(Debug)]
pub struct BlockPool {
    block_size: usize,
    max_retained: usize,
    retained: Vec<Box<[u8]>>,
    outstanding: usize,
}

impl BlockPool {
    pub fn new(block_size: usize) -> Self {
        Self::with_retention(block_size, DEFAULT_MAX_RETAINED)
    }

    pub fn with_retention(block_size: usize, max_retained: usize) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        Self {
            block_size,
            max_retained,
            retained: Vec::new(),
            outstanding: 0,
        }
    }

    /// Rent a block with at least `min_size` bytes (and never less than one block).
    pub fn rent(&mut self, min_size: usize) -> Box<[u8]> {
        self.outstanding += 1;
        if min_size > self.block_size {
            return vec![0u8; min_size].into_boxed_slice();
        }
        match self.retained.pop() {
            Some(block) => block,
            None => vec![0u8; self.block_size].into_boxed_slice(),
        }
    }

    /// Give a rented block back.
    pub fn give_back(&mut self, block: Box<[u8]>) {
        debug_assert!(self.outstanding > 0, "returned more blocks than were rented");
        self.outstanding = self.outstanding.saturating_sub(1);
        if block.len() == self.block_size && self.retained.len() < self.max_retained {
            self.retained.push(block);
        }
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks currently rented and not yet given back.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Idle blocks waiting to be rented again.
    #[inline]
    pub fn retained(&self) -> usize {
        self.retained.len()
    }
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}
