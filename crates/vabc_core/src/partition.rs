//! Per-partition driver: merge operations in, COW log out.

use crate::block_writer::BlockExtentWriter;
use crate::config::WriterConfig;
use crate::cow::CowSink;
use crate::error::{CowError, CowResult};
use crate::extent::{checked_total_blocks, Extent};
use crate::extent_map::ExtentMap;
use crate::merge_op::{MergeOpType, MergeOperation};
use crate::xor_writer::XorExtentWriter;
use tracing::{debug, error, info};
use vabc_storage::StorageBackend;

/// Label written once every install operation is in the log.
pub const END_OF_INSTALL_LABEL: u64 = u64::MAX;

/// Writes one partition's update into a COW sink.
///
/// The expected log layout is: all COPY operations, label 0, then the records
/// of install operation 0, label 1, install operation 1, label 2, and so on,
/// closed by [`END_OF_INSTALL_LABEL`].
/// Label `n` therefore marks the point where operation `n` starts.
pub struct PartitionWriter<R, S> {
    name: String,
    config: WriterConfig,
    xor_map: ExtentMap,
    copy_blocks: ExtentMap,
    copy_ops: Vec<MergeOperation>,
    source: R,
    sink: S,
    next_op_index: u64,
}

impl<R: StorageBackend, S: CowSink> PartitionWriter<R, S> {
    /// Creates a writer for partition `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        name: impl Into<String>,
        config: WriterConfig,
        merge_ops: &[MergeOperation],
        source: R,
        sink: S,
    ) -> CowResult<Self> {
        config.validate()?;
        let name = name.into();
        let xor_map = ExtentMap::xor_map(merge_ops);
        let copy_blocks = ExtentMap::copy_map(merge_ops);
        let copy_ops: Vec<MergeOperation> = merge_ops
            .iter()
            .filter(|op| op.op_type == MergeOpType::Copy)
            .cloned()
            .collect();
        info!(
            partition = %name,
            copy_ops = copy_ops.len(),
            xor_extents = xor_map.len(),
            partition_size = config.partition_size,
            "partition writer ready"
        );
        Ok(Self {
            name,
            config,
            xor_map,
            copy_blocks,
            copy_ops,
            source,
            sink,
            next_op_index: 0,
        })
    }

    /// Creates a writer that continues an interrupted update at operation
    /// `next_op_index`.
    ///
    /// `sink` must already be positioned after label `next_op_index`, see
    /// [`CowLogWriter::resume_at_label`](crate::CowLogWriter::resume_at_label).
    /// The COPY operations are part of what was written before, so
    /// [`write_copy_operations`](Self::write_copy_operations) is refused.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or `next_op_index`
    /// is zero, in which case nothing worth keeping was written.
    pub fn resume(
        name: impl Into<String>,
        config: WriterConfig,
        merge_ops: &[MergeOperation],
        source: R,
        sink: S,
        next_op_index: u64,
    ) -> CowResult<Self> {
        if next_op_index == 0 {
            return Err(CowError::invalid_argument(
                "cannot resume before the first install operation",
            ));
        }
        let mut writer = Self::new(name, config, merge_ops, source, sink)?;
        writer.next_op_index = next_op_index;
        info!(partition = %writer.name, next_op_index, "resuming partition update");
        Ok(writer)
    }

    /// Emits every COPY merge operation, then label 0.
    ///
    /// In-place copies (source equals destination) need no merging and are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a COPY operation lacks an extent, the writer was
    /// resumed, or the sink fails.
    pub fn write_copy_operations(&mut self) -> CowResult<()> {
        if self.next_op_index > 0 {
            return Err(CowError::invalid_argument(format!(
                "copy operations already written, next operation is {}",
                self.next_op_index
            )));
        }
        let mut written = 0usize;
        for op in &self.copy_ops {
            let (Some(src), Some(dst)) = (op.src_extent, op.dst_extent) else {
                let missing = if op.src_extent.is_none() {
                    "source"
                } else {
                    "destination"
                };
                return Err(CowError::IncompleteMergeOperation {
                    extent: op.dst_extent.or(op.src_extent).unwrap_or_default(),
                    missing,
                });
            };
            if src == dst {
                continue;
            }
            self.sink
                .add_copy_blocks(dst.start_block, src.start_block, src.num_blocks)?;
            written += 1;
        }
        debug!(partition = %self.name, written, "copy operations written");
        self.sink.add_label(0)
    }

    /// Writes one install operation's new content for `dst_extents`, then
    /// the label of the following operation.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` does not cover `dst_extents` exactly, or
    /// if the extent writer fails.
    pub fn write_operation(&mut self, dst_extents: &[Extent], data: &[u8]) -> CowResult<()> {
        let expected = self.operation_bytes(dst_extents)?;
        if data.len() as u64 != expected {
            return Err(CowError::invalid_argument(format!(
                "operation {} supplies {} bytes for {} bytes of extents",
                self.next_op_index,
                data.len(),
                expected
            )));
        }

        let xor_writer =
            XorExtentWriter::new(&self.xor_map, &self.source, &mut self.sink, &self.config)?;
        let mut writer = BlockExtentWriter::new(xor_writer, dst_extents, &self.config)?;
        writer.write(data)?;
        debug_assert!(writer.is_complete());
        drop(writer);

        self.end_operation()
    }

    /// Writes an operation whose destination blocks become all zeroes, then
    /// the label of the following operation. Discards are written the same
    /// way.
    ///
    /// # Errors
    ///
    /// Returns an error if the extents are not addressable or the sink fails.
    pub fn write_zero_operation(&mut self, dst_extents: &[Extent]) -> CowResult<()> {
        self.operation_bytes(dst_extents)?;
        for ext in dst_extents.iter().filter(|e| !e.is_empty()) {
            self.sink.add_zero_blocks(ext.start_block, ext.num_blocks)?;
        }
        self.end_operation()
    }

    /// Writes an operation that moves source blocks to new destinations,
    /// then the label of the following operation.
    ///
    /// Blocks pair up in order across `src_extents` and `dst_extents`.
    /// Blocks that do not move are skipped. Destinations already covered by
    /// a COPY merge operation were written by
    /// [`write_copy_operations`](Self::write_copy_operations); the rest are
    /// read from the source and recorded verbatim, one record per run of
    /// consecutive blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the two extent lists cover different numbers of
    /// blocks, a source read fails or comes up short, or the sink fails.
    pub fn write_source_copy_operation(
        &mut self,
        src_extents: &[Extent],
        dst_extents: &[Extent],
    ) -> CowResult<()> {
        let src_blocks = self.operation_bytes(src_extents)? / self.config.block_bytes();
        let dst_blocks = self.operation_bytes(dst_extents)? / self.config.block_bytes();
        if src_blocks != dst_blocks {
            return Err(CowError::invalid_argument(format!(
                "operation {} copies {} source blocks into {} destination blocks",
                self.next_op_index, src_blocks, dst_blocks
            )));
        }

        // (src, dst, len) runs of blocks to read from the source.
        let mut runs: Vec<(u64, u64, u64)> = Vec::new();
        let pairs = blocks(src_extents).zip(blocks(dst_extents));
        for (src, dst) in pairs {
            if src == dst || self.copy_blocks.contains_block(dst) {
                continue;
            }
            match runs.last_mut() {
                Some((run_src, run_dst, len)) if *run_src + *len == src && *run_dst + *len == dst => {
                    *len += 1;
                }
                _ => runs.push((src, dst, 1)),
            }
        }

        let block_bytes = self.config.block_bytes();
        let mut buffer = Vec::new();
        for (src, dst, len) in runs {
            // Both bounded by the extents' byte lengths checked above.
            let offset = src * block_bytes;
            let size = usize::try_from(len * block_bytes)
                .map_err(|_| CowError::invalid_argument("source copy run too large"))?;
            buffer.resize(size, 0);
            let read = self.source.read_into(offset, &mut buffer)?;
            if read != size {
                error!(
                    partition = %self.name,
                    bytes_read = read,
                    expected = size,
                    src_block = src,
                    "short read from source partition"
                );
                return Err(CowError::ShortRead {
                    offset,
                    expected: size,
                    read,
                });
            }
            self.sink.add_raw_blocks(dst, &buffer)?;
        }
        self.end_operation()
    }

    /// Byte length of an operation's extents, rejecting extents past the
    /// addressable range.
    fn operation_bytes(&self, extents: &[Extent]) -> CowResult<u64> {
        let addressable = extents.iter().all(|e| {
            e.checked_end_block()
                .and_then(|end| end.checked_mul(self.config.block_bytes()))
                .is_some()
        });
        checked_total_blocks(extents)
            .and_then(|blocks| blocks.checked_mul(self.config.block_bytes()))
            .filter(|_| addressable)
            .ok_or_else(|| {
                CowError::invalid_argument(format!(
                    "operation {} has extents past the addressable range",
                    self.next_op_index
                ))
            })
    }

    fn end_operation(&mut self) -> CowResult<()> {
        self.next_op_index += 1;
        self.sink.add_label(self.next_op_index)
    }

    /// Index of the next install operation.
    #[must_use]
    pub fn next_op_index(&self) -> u64 {
        self.next_op_index
    }

    /// The XOR extent map built from the merge operations.
    #[must_use]
    pub fn xor_map(&self) -> &ExtentMap {
        &self.xor_map
    }

    /// Returns the sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Marks the end of the install operations with
    /// [`END_OF_INSTALL_LABEL`], finalizes the sink and returns it.
    ///
    /// # Errors
    ///
    /// Returns an error if the label cannot be written or the sink cannot be
    /// finalized.
    pub fn finish(mut self) -> CowResult<S> {
        self.sink.add_label(END_OF_INSTALL_LABEL)?;
        self.sink.finalize()?;
        info!(
            partition = %self.name,
            operations = self.next_op_index,
            "partition COW written"
        );
        Ok(self.sink)
    }

    /// Finalizes the sink without ending the install, leaving the log
    /// resumable from label [`next_op_index`](Self::next_op_index).
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot be finalized.
    pub fn close(mut self) -> CowResult<S> {
        self.sink.finalize()?;
        info!(
            partition = %self.name,
            next_op_index = self.next_op_index,
            "partition COW checkpointed"
        );
        Ok(self.sink)
    }
}

/// Every block of `extents`, in order.
fn blocks(extents: &[Extent]) -> impl Iterator<Item = u64> + '_ {
    extents
        .iter()
        .flat_map(|e| e.start_block..e.end_block())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cow::{CowRecord, RecordingSink};
    use vabc_storage::InMemoryBackend;

    const BS: usize = 16;

    fn config() -> WriterConfig {
        WriterConfig::new()
            .block_size(BS as u32)
            .buffer_size(BS * 2)
    }

    #[test]
    fn partition_copy_ops_skip_in_place() {
        let ops = [
            MergeOperation::copy(Extent::new(1, 2), Extent::new(1, 2)),
            MergeOperation::copy(Extent::new(4, 3), Extent::new(10, 3)),
            MergeOperation::xor(Extent::new(0, 1), Extent::new(20, 1), 0),
        ];
        let mut writer = PartitionWriter::new(
            "system",
            config(),
            &ops,
            InMemoryBackend::new(),
            RecordingSink::new(),
        )
        .unwrap();
        writer.write_copy_operations().unwrap();
        assert_eq!(writer.xor_map().len(), 1);

        let sink = writer.finish().unwrap();
        assert!(sink.is_finalized());
        assert_eq!(
            sink.records(),
            &[
                CowRecord::Copy {
                    dst_block: 10,
                    src_block: 4,
                    num_blocks: 3
                },
                CowRecord::Label { label: 0 },
                CowRecord::Label {
                    label: END_OF_INSTALL_LABEL
                },
            ]
        );
    }

    #[test]
    fn partition_copy_op_without_extent_fails() {
        let mut op = MergeOperation::copy(Extent::new(4, 3), Extent::new(10, 3));
        op.src_extent = None;
        let mut writer = PartitionWriter::new(
            "vendor",
            config(),
            &[op],
            InMemoryBackend::new(),
            RecordingSink::new(),
        )
        .unwrap();
        assert!(matches!(
            writer.write_copy_operations(),
            Err(CowError::IncompleteMergeOperation {
                missing: "source",
                ..
            })
        ));
    }

    #[test]
    fn partition_operations_are_labelled() {
        let mut writer = PartitionWriter::new(
            "product",
            config(),
            &[],
            InMemoryBackend::new(),
            RecordingSink::new(),
        )
        .unwrap();
        writer
            .write_operation(&[Extent::new(0, 1), Extent::new(5, 3)], &[1u8; BS * 4])
            .unwrap();
        writer
            .write_operation(&[Extent::new(9, 1)], &[2u8; BS])
            .unwrap();
        assert_eq!(writer.next_op_index(), 2);

        let records = writer.finish().unwrap().into_records();
        assert_eq!(
            records,
            vec![
                CowRecord::Raw {
                    dst_block: 0,
                    data: vec![1u8; BS]
                },
                CowRecord::Raw {
                    dst_block: 5,
                    data: vec![1u8; BS * 2]
                },
                CowRecord::Raw {
                    dst_block: 7,
                    data: vec![1u8; BS]
                },
                CowRecord::Label { label: 1 },
                CowRecord::Raw {
                    dst_block: 9,
                    data: vec![2u8; BS]
                },
                CowRecord::Label { label: 2 },
                CowRecord::Label {
                    label: END_OF_INSTALL_LABEL
                },
            ]
        );
    }

    #[test]
    fn partition_operation_length_mismatch_fails() {
        let mut writer = PartitionWriter::new(
            "odm",
            config(),
            &[],
            InMemoryBackend::new(),
            RecordingSink::new(),
        )
        .unwrap();
        let result = writer.write_operation(&[Extent::new(0, 2)], &[0u8; BS]);
        assert!(matches!(result, Err(CowError::InvalidArgument { .. })));
        assert!(writer.sink().records().is_empty());
        assert_eq!(writer.next_op_index(), 0);
    }

    #[test]
    fn partition_operation_past_address_space_fails() {
        let mut writer = PartitionWriter::new(
            "odm",
            config(),
            &[],
            InMemoryBackend::new(),
            RecordingSink::new(),
        )
        .unwrap();
        let huge = [Extent::new(0, u64::MAX / 2), Extent::new(0, u64::MAX / 2 + 2)];
        let result = writer.write_operation(&huge, &[0u8; BS]);
        assert!(matches!(result, Err(CowError::InvalidArgument { .. })));

        let far = [Extent::new(u64::MAX / BS as u64, 1)];
        let result = writer.write_operation(&far, &[0u8; BS]);
        assert!(matches!(result, Err(CowError::InvalidArgument { .. })));
        assert!(writer.write_zero_operation(&far).is_err());
        assert!(writer.sink().records().is_empty());
    }

    #[test]
    fn partition_zero_operation_per_extent() {
        let mut writer = PartitionWriter::new(
            "system",
            config(),
            &[],
            InMemoryBackend::new(),
            RecordingSink::new(),
        )
        .unwrap();
        writer
            .write_zero_operation(&[Extent::new(4, 2), Extent::new(9, 0), Extent::new(30, 5)])
            .unwrap();
        assert_eq!(writer.next_op_index(), 1);
        assert_eq!(
            writer.sink().records(),
            &[
                CowRecord::Zero {
                    dst_block: 4,
                    num_blocks: 2
                },
                CowRecord::Zero {
                    dst_block: 30,
                    num_blocks: 5
                },
                CowRecord::Label { label: 1 },
            ]
        );
    }

    #[test]
    fn partition_source_copy_reads_moved_blocks() {
        let source_bytes: Vec<u8> = (0..BS * 8).map(|i| (i / BS) as u8).collect();
        let ops = [MergeOperation::copy(Extent::new(0, 1), Extent::new(12, 1))];
        let mut writer = PartitionWriter::new(
            "vendor",
            config(),
            &ops,
            InMemoryBackend::with_data(source_bytes),
            RecordingSink::new(),
        )
        .unwrap();
        writer.write_copy_operations().unwrap();
        // 0 -> 12 is a COPY merge op, 3 -> 3 stays, 1,2 -> 10,11 and 5 -> 13 move.
        writer
            .write_source_copy_operation(
                &[Extent::new(0, 4), Extent::new(5, 1)],
                &[Extent::new(12, 1), Extent::new(10, 2), Extent::new(3, 1), Extent::new(13, 1)],
            )
            .unwrap();

        let mut moved = vec![1u8; BS];
        moved.extend_from_slice(&[2u8; BS]);
        assert_eq!(
            writer.sink().records(),
            &[
                CowRecord::Copy {
                    dst_block: 12,
                    src_block: 0,
                    num_blocks: 1
                },
                CowRecord::Label { label: 0 },
                CowRecord::Raw {
                    dst_block: 10,
                    data: moved
                },
                CowRecord::Raw {
                    dst_block: 13,
                    data: vec![5u8; BS]
                },
                CowRecord::Label { label: 1 },
            ]
        );
    }

    #[test]
    fn partition_source_copy_rejects_mismatch_and_short_source() {
        let mut writer = PartitionWriter::new(
            "vendor",
            config(),
            &[],
            InMemoryBackend::with_data(vec![0u8; BS * 2]),
            RecordingSink::new(),
        )
        .unwrap();
        let result = writer.write_source_copy_operation(&[Extent::new(0, 2)], &[Extent::new(4, 3)]);
        assert!(matches!(result, Err(CowError::InvalidArgument { .. })));

        let result = writer.write_source_copy_operation(&[Extent::new(1, 2)], &[Extent::new(4, 2)]);
        assert!(matches!(result, Err(CowError::ShortRead { .. })));
        assert!(writer.sink().records().is_empty());
        assert_eq!(writer.next_op_index(), 0);
    }

    #[test]
    fn partition_resume_continues_labels() {
        let ops = [MergeOperation::copy(Extent::new(4, 3), Extent::new(10, 3))];
        assert!(PartitionWriter::resume(
            "system",
            config(),
            &ops,
            InMemoryBackend::new(),
            RecordingSink::new(),
            0
        )
        .is_err());

        let mut writer = PartitionWriter::resume(
            "system",
            config(),
            &ops,
            InMemoryBackend::new(),
            RecordingSink::new(),
            3,
        )
        .unwrap();
        assert!(writer.write_copy_operations().is_err());
        writer.write_zero_operation(&[Extent::new(1, 1)]).unwrap();
        let records = writer.close().unwrap().into_records();
        assert_eq!(
            records,
            vec![
                CowRecord::Zero {
                    dst_block: 1,
                    num_blocks: 1
                },
                CowRecord::Label { label: 4 },
            ]
        );
    }
}
