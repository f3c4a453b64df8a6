//! Copy-on-write log: the sink that receives finished block operations.
//!
//! A COW log is an append-only sequence of block records layered over an
//! unmodified source partition. Records are never modified after write;
//! ordering and durability are the sink's responsibility.
//!
//! ## Record Format
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! | type | payload |
//! |------|---------|
//! | RAW (1) | dst_block u64, data |
//! | XOR (2) | dst_block u64, src_block u64, src_offset u32, data |
//! | COPY (3) | dst_block u64, src_block u64, num_blocks u64 |
//! | LABEL (4) | label u64 |
//! | ZERO (5) | dst_block u64, num_blocks u64 |
//!
//! All integers are little-endian. The CRC covers everything before it.
//!
//! ## Reading Back
//!
//! A record cut short at the end of the log ends iteration cleanly (a crash
//! mid-append). Bad magic, unknown type, unsupported version and CRC mismatch
//! are fatal.

mod iterator;
mod record;
mod recording;
mod writer;

pub use iterator::CowRecordIterator;
pub use record::{compute_crc32, CowRecord, CowRecordType};
pub use recording::RecordingSink;
pub use writer::CowLogWriter;

use crate::error::CowResult;

/// Append-only consumer of block operations.
///
/// `data` lengths passed to the block methods are whole multiples of the
/// block size. Implementations may reject anything else.
pub trait CowSink {
    /// Records `data` verbatim as the new content of the blocks starting at
    /// `dst_start_block`.
    fn add_raw_blocks(&mut self, dst_start_block: u64, data: &[u8]) -> CowResult<()>;

    /// Records `data` as the XOR of the new content of the blocks starting at
    /// `dst_start_block` with the source bytes at
    /// `src_block * block_size + src_sub_block_offset`.
    fn add_xor_blocks(
        &mut self,
        dst_start_block: u64,
        data: &[u8],
        src_block: u64,
        src_sub_block_offset: u32,
    ) -> CowResult<()>;

    /// Records that `num_blocks` destination blocks are copies of source blocks.
    fn add_copy_blocks(
        &mut self,
        dst_start_block: u64,
        src_start_block: u64,
        num_blocks: u64,
    ) -> CowResult<()>;

    /// Records that `num_blocks` destination blocks read back as zeroes.
    fn add_zero_blocks(&mut self, dst_start_block: u64, num_blocks: u64) -> CowResult<()>;

    /// Records a resume point.
    fn add_label(&mut self, label: u64) -> CowResult<()>;

    /// Flushes everything written so far.
    fn finalize(&mut self) -> CowResult<()>;
}
