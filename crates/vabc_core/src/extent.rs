//! Block extents and the interval arithmetic the writers need.

use std::fmt;

/// A contiguous run of blocks.
///
/// `start_block` and `num_blocks` are in units of the partition block size.
/// The end block is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Extent {
    /// First block of the run.
    pub start_block: u64,
    /// Number of blocks in the run.
    pub num_blocks: u64,
}

impl Extent {
    /// Creates an extent covering `num_blocks` blocks starting at `start_block`.
    #[must_use]
    pub const fn new(start_block: u64, num_blocks: u64) -> Self {
        Self {
            start_block,
            num_blocks,
        }
    }

    /// Returns the block just past the end of the extent.
    ///
    /// Saturates at `u64::MAX`; use [`checked_end_block`](Self::checked_end_block)
    /// for extents that come from untrusted input.
    #[must_use]
    pub const fn end_block(&self) -> u64 {
        self.start_block.saturating_add(self.num_blocks)
    }

    /// Returns the block just past the end, or `None` if it is not addressable.
    #[must_use]
    pub const fn checked_end_block(&self) -> Option<u64> {
        self.start_block.checked_add(self.num_blocks)
    }

    /// Returns true if the extent covers no blocks.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.num_blocks == 0
    }

    /// Returns true if `block` lies inside the extent.
    #[must_use]
    pub const fn contains_block(&self, block: u64) -> bool {
        block >= self.start_block && block < self.end_block()
    }

    /// Returns true if `other` lies entirely inside this extent.
    #[must_use]
    pub const fn contains(&self, other: &Extent) -> bool {
        other.start_block >= self.start_block && other.end_block() <= self.end_block()
    }

    /// Returns true if the two extents share at least one block.
    #[must_use]
    pub const fn overlaps(&self, other: &Extent) -> bool {
        self.start_block < other.end_block() && other.start_block < self.end_block()
    }

    /// Returns the blocks common to both extents, if any.
    #[must_use]
    pub fn intersection(&self, other: &Extent) -> Option<Extent> {
        let start = self.start_block.max(other.start_block);
        let end = self.end_block().min(other.end_block());
        (start < end).then(|| Extent::new(start, end - start))
    }

    /// Byte length of the extent for the given block size, saturating.
    #[must_use]
    pub const fn byte_len(&self, block_size: u64) -> u64 {
        self.num_blocks.saturating_mul(block_size)
    }

    /// Byte length of the extent, or `None` on overflow.
    #[must_use]
    pub const fn checked_byte_len(&self, block_size: u64) -> Option<u64> {
        self.num_blocks.checked_mul(block_size)
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start_block, self.end_block())
    }
}

/// Total number of blocks covered by a list of extents, or `None` on overflow.
#[must_use]
pub fn checked_total_blocks(extents: &[Extent]) -> Option<u64> {
    extents
        .iter()
        .try_fold(0u64, |total, e| total.checked_add(e.num_blocks))
}
