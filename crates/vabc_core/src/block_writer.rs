//! Streaming writer that slices a byte stream into block-aligned extent writes.
//!
//! Install operation data arrives in chunks of arbitrary size. The
//! [`BlockExtentWriter`] walks the operation's destination extents and hands
//! each piece to a [`WriteExtent`] implementation once it is complete, never
//! forwarding more than the configured buffer size at a time.

use crate::config::WriterConfig;
use crate::error::{CowError, CowResult};
use crate::extent::Extent;
use tracing::error;

/// Consumer of whole-block extent writes.
pub trait WriteExtent {
    /// Writes `bytes` as the content of `extent`.
    ///
    /// `bytes.len()` equals `extent.num_blocks` times the block size.
    fn write_extent(&mut self, bytes: &[u8], extent: Extent) -> CowResult<()>;
}

impl<W: WriteExtent + ?Sized> WriteExtent for &mut W {
    fn write_extent(&mut self, bytes: &[u8], extent: Extent) -> CowResult<()> {
        (**self).write_extent(bytes, extent)
    }
}

/// Buffers a byte stream and forwards it extent by extent.
///
/// Bytes are consumed in extent order. A chunk that already covers the next
/// piece is forwarded directly; smaller chunks are staged in an internal
/// buffer until the piece is complete.
pub struct BlockExtentWriter<W> {
    inner: W,
    extents: Vec<Extent>,
    cur_extent_idx: usize,
    offset_in_extent: u64,
    buffer: Vec<u8>,
    block_size: u64,
    buffer_size: usize,
}

impl<W: WriteExtent> BlockExtentWriter<W> {
    /// Creates a writer over `extents`, skipping empty ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, no non-empty
    /// extent is given, or an extent is not addressable with the block size.
    pub fn new(inner: W, extents: &[Extent], config: &WriterConfig) -> CowResult<Self> {
        config.validate()?;
        let extents: Vec<Extent> = extents.iter().copied().filter(|e| !e.is_empty()).collect();
        if extents.is_empty() {
            return Err(CowError::invalid_argument("no destination extents to write"));
        }
        if let Some(bad) = extents.iter().find(|e| {
            e.checked_end_block().is_none() || e.checked_byte_len(config.block_bytes()).is_none()
        }) {
            return Err(CowError::invalid_argument(format!(
                "destination extent starting at block {} with {} blocks is not addressable",
                bad.start_block, bad.num_blocks
            )));
        }
        Ok(Self {
            inner,
            extents,
            cur_extent_idx: 0,
            offset_in_extent: 0,
            buffer: Vec::with_capacity(config.block_size as usize),
            block_size: config.block_bytes(),
            buffer_size: config.buffer_size,
        })
    }

    /// Consumes `data`, forwarding every piece it completes.
    ///
    /// # Errors
    ///
    /// Returns [`CowError::ExtentsExhausted`] if `data` runs past the last
    /// extent, or the inner writer's error.
    pub fn write(&mut self, mut data: &[u8]) -> CowResult<()> {
        while !data.is_empty() {
            let consumed = self.consume_with_buffer(data)?;
            data = &data[consumed..];
        }
        Ok(())
    }

    /// Returns true once every extent has been written in full.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.cur_extent_idx >= self.extents.len()
    }

    /// Returns the inner writer.
    pub fn inner(&self) -> &W {
        &self.inner
    }

    /// Consumes the writer and returns the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }

    fn consume_with_buffer(&mut self, data: &[u8]) -> CowResult<usize> {
        let Some(cur_extent) = self.extents.get(self.cur_extent_idx).copied() else {
            error!(pending = data.len(), "exhausted all blocks, but bytes are still pending");
            return Err(CowError::ExtentsExhausted {
                pending: data.len(),
            });
        };
        let remaining = cur_extent.byte_len(self.block_size) - self.offset_in_extent;
        let write_size = usize::try_from(remaining).map_or(self.buffer_size, |r| r.min(self.buffer_size));

        if self.buffer.is_empty() && data.len() >= write_size {
            let piece = self.advance(write_size);
            self.inner.write_extent(&data[..write_size], piece)?;
            return Ok(write_size);
        }

        let bytes_to_copy = data.len().min(write_size - self.buffer.len());
        self.buffer.extend_from_slice(&data[..bytes_to_copy]);
        if self.buffer.len() == write_size {
            let piece = self.advance(write_size);
            self.inner.write_extent(&self.buffer, piece)?;
            self.buffer.clear();
        }
        Ok(bytes_to_copy)
    }

    /// Claims the next `count` bytes of the current extent.
    fn advance(&mut self, count: usize) -> Extent {
        let cur_extent = self.extents[self.cur_extent_idx];
        let piece = Extent::new(
            cur_extent.start_block + self.offset_in_extent / self.block_size,
            count as u64 / self.block_size,
        );
        self.offset_in_extent += count as u64;
        if self.offset_in_extent == cur_extent.byte_len(self.block_size) {
            self.cur_extent_idx += 1;
            self.offset_in_extent = 0;
        }
        piece
    }
}
