//! XOR-aware extent writer.
//!
//! Turns the new content of one install extent into COW operations. Blocks
//! that have an XOR merge operation are stored as a delta against the source
//! partition; every other block is stored verbatim.
//!
//! ## Source Boundary
//!
//! A merge operation's source read is shifted by `src_offset` bytes, so the
//! read for the partition's last block can run past the end of a partition
//! whose size is not block-aligned. When that overrun is less than one
//! block, the last block is split off and read unshifted from its own block
//! boundary. An overrun of a full block or more is rejected.

use crate::block_writer::WriteExtent;
use crate::config::WriterConfig;
use crate::cow::CowSink;
use crate::error::{CowError, CowResult};
use crate::extent::Extent;
use crate::extent_map::MergeOpLookup;
use crate::merge_op::MergeOperation;
use tracing::{debug, error};
use vabc_storage::StorageBackend;

/// Writes install extents to a [`CowSink`], XOR-ing against the source where
/// a merge operation allows it.
///
/// The writer borrows its collaborators for its own lifetime and owns only a
/// scratch buffer for source reads, reused across calls. It is not meant to
/// be shared between threads.
pub struct XorExtentWriter<'a, L: ?Sized, R: ?Sized, S: ?Sized> {
    lookup: &'a L,
    source: &'a R,
    sink: &'a mut S,
    block_size: u64,
    partition_size: u64,
    xor_block_data: Vec<u8>,
}

impl<'a, L, R, S> XorExtentWriter<'a, L, R, S>
where
    L: MergeOpLookup + ?Sized,
    R: StorageBackend + ?Sized,
    S: CowSink + ?Sized,
{
    /// Creates a writer using `config.block_size` and `config.partition_size`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        lookup: &'a L,
        source: &'a R,
        sink: &'a mut S,
        config: &WriterConfig,
    ) -> CowResult<Self> {
        config.validate()?;
        Ok(Self {
            lookup,
            source,
            sink,
            block_size: config.block_bytes(),
            partition_size: config.partition_size,
            xor_block_data: Vec::new(),
        })
    }

    /// Writes `bytes` as the new content of `extent`.
    ///
    /// Every block of `extent` reaches the sink exactly once, XOR sub-extents
    /// first, then replace sub-extents, each in lookup order. The lookup's two
    /// lists must tile `extent` exactly; that is checked before anything is
    /// forwarded. Any later failure aborts the write and leaves operations
    /// already forwarded in the sink.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not exactly `extent`'s length, if the
    /// lookup's sub-extents do not tile `extent`, if the lookup contradicts
    /// itself or returns a malformed merge operation, if a
    /// source read fails or comes up short, if an XOR read overruns the source
    /// partition by a block or more, or if the sink fails.
    pub fn write_extent(&mut self, bytes: &[u8], extent: Extent) -> CowResult<()> {
        if extent.is_empty() {
            return Ok(());
        }
        let Some(expected) = extent.checked_byte_len(self.block_size) else {
            return Err(CowError::invalid_argument(format!(
                "extent {extent} exceeds the addressable byte range"
            )));
        };
        if bytes.len() as u64 != expected {
            return Err(CowError::invalid_argument(format!(
                "{} bytes supplied for extent {} of {} bytes",
                bytes.len(),
                extent,
                expected
            )));
        }

        let lookup = self.lookup;
        let xor_extents = lookup.intersecting_extents(extent);
        let replace_extents = lookup.non_intersecting_extents(extent);
        check_tiling(extent, &xor_extents, &replace_extents)?;

        for &xor_ext in xor_extents.iter().filter(|e| !e.is_empty()) {
            let Some(merge_op) = lookup.get(xor_ext) else {
                // Either a lookup bug or duplicate blocks in the target build.
                error!(
                    %xor_ext,
                    install_extent = %extent,
                    "XOR extent returned by intersecting_extents has no merge operation"
                );
                return Err(CowError::MissingMergeOperation {
                    extent: xor_ext,
                    install_extent: extent,
                });
            };
            let dst_extent = check_merge_op(merge_op, xor_ext)?;

            let offset = self.byte_offset(xor_ext.start_block - extent.start_block)?;
            let len = self.byte_offset(xor_ext.num_blocks)?;
            let dst_block_data = &bytes[offset..offset + len];
            if let Err(e) = self.write_xor_extent(dst_block_data, xor_ext, merge_op, dst_extent) {
                error!(%xor_ext, error = %e, "failed to write XOR extent");
                return Err(e);
            }
        }

        self.write_replace_extents(&replace_extents, extent, bytes)
    }

    /// Writes one XOR sub-extent, splitting off the last block when the
    /// shifted source read would run past the end of the partition.
    fn write_xor_extent(
        &mut self,
        bytes: &[u8],
        xor_ext: Extent,
        merge_op: &MergeOperation,
        dst_extent: Extent,
    ) -> CowResult<()> {
        let src_start = merge_op.src_extent.map_or(0, |e| e.start_block);
        let src_offset = u64::from(merge_op.src_offset);
        // `xor_ext` lies inside `dst_extent`, checked by `check_merge_op`.
        let delta = xor_ext.start_block - dst_extent.start_block;
        let Some((read_start, read_end_offset)) =
            self.source_range(src_start, delta, xor_ext.num_blocks, src_offset)
        else {
            error!(
                %xor_ext,
                %merge_op,
                "XOR source range is past the last addressable byte"
            );
            if self.partition_size == 0 {
                return Err(CowError::invalid_argument(format!(
                    "source range for XOR extent {xor_ext} is not addressable"
                )));
            }
            return Err(CowError::SourceOverrun {
                extent: xor_ext,
                oob_bytes: u64::MAX,
                partition_size: self.partition_size,
            });
        };

        if self.partition_size == 0 || read_end_offset <= self.partition_size {
            return self.write_xor_cow_op(bytes, xor_ext, read_start);
        }

        let oob_bytes = read_end_offset - self.partition_size;
        if oob_bytes >= self.block_size {
            error!(
                %xor_ext,
                %merge_op,
                oob_bytes,
                partition_size = self.partition_size,
                "XOR read overflows source partition by a block or more"
            );
            return Err(CowError::SourceOverrun {
                extent: xor_ext,
                oob_bytes,
                partition_size: self.partition_size,
            });
        }
        if oob_bytes > src_offset {
            // Tolerated: the last block's unshifted read may still fit.
            error!(
                %xor_ext,
                oob_bytes,
                src_offset,
                "XOR read overflows source offset"
            );
        }

        let last = xor_ext.num_blocks - 1;
        let split = self.byte_offset(last)?;
        if last > 0 {
            let head = Extent::new(xor_ext.start_block, last);
            self.write_xor_cow_op(&bytes[..split], head, read_start)?;
        }
        let last_block = Extent::new(xor_ext.start_block + last, 1);
        debug!(%last_block, "reading last XOR block without source offset");
        // Below `read_end_offset`, so it cannot overflow.
        let last_start = read_start - src_offset + split as u64;
        self.write_xor_cow_op(&bytes[split..], last_block, last_start)
    }

    /// Byte range `[start, end)` of the shifted source read for `num_blocks`
    /// blocks, `delta` blocks into the merge operation. `None` if any bound
    /// is past `u64::MAX`.
    fn source_range(
        &self,
        src_start: u64,
        delta: u64,
        num_blocks: u64,
        src_offset: u64,
    ) -> Option<(u64, u64)> {
        let start = src_start
            .checked_add(delta)?
            .checked_mul(self.block_size)?
            .checked_add(src_offset)?;
        let end = start.checked_add(num_blocks.checked_mul(self.block_size)?)?;
        Some((start, end))
    }

    /// Forwards each replace extent's bytes verbatim.
    ///
    /// Containment in `extent` has already been checked by [`check_tiling`].
    fn write_replace_extents(
        &mut self,
        replace_extents: &[Extent],
        extent: Extent,
        bytes: &[u8],
    ) -> CowResult<()> {
        for ext in replace_extents.iter().filter(|e| !e.is_empty()) {
            let offset = self.byte_offset(ext.start_block - extent.start_block)?;
            let len = self.byte_offset(ext.num_blocks)?;
            self.sink
                .add_raw_blocks(ext.start_block, &bytes[offset..offset + len])?;
        }
        Ok(())
    }

    /// Reads the source range for `xor_ext`, XORs it with `bytes` and
    /// forwards the result.
    fn write_xor_cow_op(
        &mut self,
        bytes: &[u8],
        xor_ext: Extent,
        src_offset: u64,
    ) -> CowResult<()> {
        let len = self.byte_offset(xor_ext.num_blocks)?;
        if bytes.len() != len {
            return Err(CowError::invalid_argument(format!(
                "{} bytes supplied for XOR extent {} of {} bytes",
                bytes.len(),
                xor_ext,
                len
            )));
        }
        self.xor_block_data.resize(len, 0);

        let src_block = src_offset / self.block_size;
        let sub_block_offset = src_offset % self.block_size;
        let read = self.source.read_into(src_offset, &mut self.xor_block_data)?;
        if read != len {
            error!(
                bytes_read = read,
                expected = len,
                src_block,
                offset = sub_block_offset,
                "short read from source partition"
            );
            return Err(CowError::ShortRead {
                offset: src_offset,
                expected: len,
                read,
            });
        }

        for (out, new) in self.xor_block_data.iter_mut().zip(bytes) {
            *out ^= new;
        }
        self.sink.add_xor_blocks(
            xor_ext.start_block,
            &self.xor_block_data,
            src_block,
            // Always below the block size, which fits in u32.
            sub_block_offset as u32,
        )
    }

    fn byte_offset(&self, blocks: u64) -> CowResult<usize> {
        blocks
            .checked_mul(self.block_size)
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or_else(|| {
                CowError::invalid_argument(format!("{blocks} blocks exceed the addressable byte range"))
            })
    }
}

/// Checks that the XOR and replace sub-extents cover `extent` exactly once.
fn check_tiling(extent: Extent, xor_extents: &[Extent], replace_extents: &[Extent]) -> CowResult<()> {
    let mut pieces = Vec::with_capacity(xor_extents.len() + replace_extents.len());
    for (kind, list) in [("xor", xor_extents), ("replace", replace_extents)] {
        for ext in list.iter().filter(|e| !e.is_empty()) {
            if !extent.contains(ext) {
                error!(
                    kind,
                    sub_extent = %ext,
                    install_extent = %extent,
                    "sub-extent should be completely inside the install extent"
                );
                return Err(CowError::ExtentNotContained {
                    kind,
                    inner: *ext,
                    outer: extent,
                });
            }
            pieces.push(*ext);
        }
    }
    pieces.sort_unstable();

    let mut cursor = extent.start_block;
    for piece in &pieces {
        if piece.start_block != cursor {
            let (block, reason) = if piece.start_block > cursor {
                (cursor, "not covered")
            } else {
                (piece.start_block, "covered twice")
            };
            error!(install_extent = %extent, block, reason, "lookup does not tile install extent");
            return Err(CowError::TilingMismatch {
                extent,
                block,
                reason,
            });
        }
        cursor = piece.end_block();
    }
    if cursor != extent.end_block() {
        error!(install_extent = %extent, block = cursor, "lookup does not tile install extent");
        return Err(CowError::TilingMismatch {
            extent,
            block: cursor,
            reason: "not covered",
        });
    }
    Ok(())
}

/// Validates a merge operation for `xor_ext` and returns its destination.
fn check_merge_op(merge_op: &MergeOperation, xor_ext: Extent) -> CowResult<Extent> {
    if merge_op.src_extent.is_none() {
        error!(%xor_ext, %merge_op, "merge operation has no source extent");
        return Err(CowError::IncompleteMergeOperation {
            extent: xor_ext,
            missing: "source",
        });
    }
    let Some(dst_extent) = merge_op.dst_extent else {
        error!(%xor_ext, %merge_op, "merge operation has no destination extent");
        return Err(CowError::IncompleteMergeOperation {
            extent: xor_ext,
            missing: "destination",
        });
    };
    if !dst_extent.contains(&xor_ext) {
        error!(
            %xor_ext,
            merge_dst = %dst_extent,
            "XOR extent should be completely inside its merge operation's destination"
        );
        return Err(CowError::ExtentNotContained {
            kind: "xor",
            inner: xor_ext,
            outer: dst_extent,
        });
    }
    Ok(dst_extent)
}

impl<L, R, S> WriteExtent for XorExtentWriter<'_, L, R, S>
where
    L: MergeOpLookup + ?Sized,
    R: StorageBackend + ?Sized,
    S: CowSink + ?Sized,
{
    fn write_extent(&mut self, bytes: &[u8], extent: Extent) -> CowResult<()> {
        XorExtentWriter::write_extent(self, bytes, extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cow::{CowRecord, RecordingSink};
    use crate::extent_map::ExtentMap;
    use vabc_storage::InMemoryBackend;

    const BS: usize = 16;

    fn source(blocks: usize) -> InMemoryBackend {
        InMemoryBackend::with_data((0..blocks * BS).map(|i| (i * 7 + 3) as u8).collect())
    }

    fn config(partition_size: u64) -> WriterConfig {
        WriterConfig::new()
            .block_size(BS as u32)
            .buffer_size(BS * 4)
            .partition_size(partition_size)
    }

    #[test]
    fn xor_writer_empty_map_writes_raw() {
        let map = ExtentMap::new();
        let src = source(4);
        let mut sink = RecordingSink::new();
        let data = vec![0x5Au8; 2 * BS];
        {
            let mut writer = XorExtentWriter::new(&map, &src, &mut sink, &config(0)).unwrap();
            writer.write_extent(&data, Extent::new(10, 2)).unwrap();
        }
        assert_eq!(
            sink.records(),
            &[CowRecord::Raw {
                dst_block: 10,
                data
            }]
        );
    }

    #[test]
    fn xor_writer_empty_extent_is_noop() {
        let map = ExtentMap::new();
        let src = source(1);
        let mut sink = RecordingSink::new();
        {
            let mut writer = XorExtentWriter::new(&map, &src, &mut sink, &config(0)).unwrap();
            writer.write_extent(&[], Extent::new(3, 0)).unwrap();
        }
        assert!(sink.records().is_empty());
    }

    #[test]
    fn xor_writer_rejects_wrong_length() {
        let map = ExtentMap::new();
        let src = source(1);
        let mut sink = RecordingSink::new();
        let mut writer = XorExtentWriter::new(&map, &src, &mut sink, &config(0)).unwrap();
        let result = writer.write_extent(&[0u8; BS + 1], Extent::new(0, 1));
        assert!(matches!(result, Err(CowError::InvalidArgument { .. })));
    }

    #[test]
    fn xor_writer_rejects_invalid_config() {
        let map = ExtentMap::new();
        let src = source(1);
        let mut sink = RecordingSink::new();
        let bad = WriterConfig::new().block_size(24);
        assert!(XorExtentWriter::new(&map, &src, &mut sink, &bad).is_err());
    }

    #[test]
    fn xor_writer_source_range_past_address_space() {
        let mut map = ExtentMap::new();
        map.add_extent(
            Extent::new(0, 2),
            MergeOperation::xor(Extent::new(u64::MAX / BS as u64, 2), Extent::new(0, 2), 0),
        );
        let src = source(4);

        let mut sink = RecordingSink::new();
        {
            let mut writer = XorExtentWriter::new(&map, &src, &mut sink, &config(64)).unwrap();
            let result = writer.write_extent(&[0u8; 2 * BS], Extent::new(0, 2));
            assert!(matches!(
                result,
                Err(CowError::SourceOverrun {
                    partition_size: 64,
                    ..
                })
            ));
        }
        assert!(sink.records().is_empty());

        let mut sink = RecordingSink::new();
        {
            let mut writer = XorExtentWriter::new(&map, &src, &mut sink, &config(0)).unwrap();
            let result = writer.write_extent(&[0u8; 2 * BS], Extent::new(0, 2));
            assert!(matches!(result, Err(CowError::InvalidArgument { .. })));
        }
        assert!(sink.records().is_empty());
    }

    #[test]
    fn xor_writer_rejects_unaddressable_extent() {
        let map = ExtentMap::new();
        let src = source(1);
        let mut sink = RecordingSink::new();
        let mut writer = XorExtentWriter::new(&map, &src, &mut sink, &config(0)).unwrap();
        let result = writer.write_extent(&[0u8; BS], Extent::new(0, u64::MAX));
        assert!(matches!(result, Err(CowError::InvalidArgument { .. })));
    }

    #[test]
    fn xor_writer_xors_against_shifted_source() {
        let mut map = ExtentMap::new();
        map.add_extent(
            Extent::new(100, 2),
            MergeOperation::xor(Extent::new(1, 2), Extent::new(100, 2), 5),
        );
        let src = source(8);
        let src_bytes = src.data();
        let mut sink = RecordingSink::new();
        let data: Vec<u8> = (0..2 * BS).map(|i| i as u8).collect();
        {
            let mut writer = XorExtentWriter::new(&map, &src, &mut sink, &config(0)).unwrap();
            writer.write_extent(&data, Extent::new(100, 2)).unwrap();
        }

        let expected: Vec<u8> = data
            .iter()
            .zip(&src_bytes[BS + 5..3 * BS + 5])
            .map(|(a, b)| a ^ b)
            .collect();
        assert_eq!(
            sink.records(),
            &[CowRecord::Xor {
                dst_block: 100,
                src_block: 1,
                src_offset: 5,
                data: expected
            }]
        );
    }
}
