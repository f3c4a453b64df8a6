//! Property tests for the XOR-aware extent writer.

use proptest::prelude::*;
use vabc_core::{
    CowRecord, Extent, ExtentMap, MergeOperation, RecordingSink, WriterConfig, XorExtentWriter,
};
use vabc_storage::{InMemoryBackend, StorageBackend};

const BLOCK_SIZE: usize = 512;
const BS: u64 = BLOCK_SIZE as u64;
const SOURCE_BLOCKS: u64 = 64;
const TARGET_BLOCKS: u64 = 96;

/// Strategy for an XOR merge operation whose shifted source read stays
/// inside the source partition.
fn xor_op_strategy() -> impl Strategy<Value = MergeOperation> {
    (0..TARGET_BLOCKS, 1..6u64, 0..BLOCK_SIZE as u32).prop_flat_map(|(dst, len, offset)| {
        (0..SOURCE_BLOCKS - len).prop_map(move |src| {
            MergeOperation::xor(Extent::new(src, len), Extent::new(dst, len), offset)
        })
    })
}

/// Strategy for an install extent together with its new contents.
fn install_strategy() -> impl Strategy<Value = (Extent, Vec<u8>)> {
    (0..TARGET_BLOCKS, 1..24u64).prop_flat_map(|(start, len)| {
        prop::collection::vec(any::<u8>(), (len * BS) as usize)
            .prop_map(move |data| (Extent::new(start, len), data))
    })
}

/// Deterministic source contents derived from `seed`.
fn source_from_seed(seed: u64) -> InMemoryBackend {
    let mut state = seed | 1;
    let data = (0..SOURCE_BLOCKS * BS)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect();
    InMemoryBackend::with_data(data)
}

fn write(
    map: &ExtentMap,
    source: &InMemoryBackend,
    config: &WriterConfig,
    extent: Extent,
    data: &[u8],
) -> Vec<CowRecord> {
    let mut sink = RecordingSink::new();
    let mut writer = XorExtentWriter::new(map, source, &mut sink, config).unwrap();
    writer.write_extent(data, extent).unwrap();
    sink.into_records()
}

proptest! {
    #[test]
    fn records_tile_extent_and_restore_data(
        seed in any::<u64>(),
        ops in prop::collection::vec(xor_op_strategy(), 0..12),
        (extent, data) in install_strategy(),
        bounded in any::<bool>(),
    ) {
        let source = source_from_seed(seed);
        let mut map = ExtentMap::new();
        for op in ops {
            map.add_extent(op.dst_extent.unwrap(), op);
        }
        let partition_size = if bounded { SOURCE_BLOCKS * BS } else { 0 };
        let config = WriterConfig::new()
            .block_size(BLOCK_SIZE as u32)
            .partition_size(partition_size);

        let records = write(&map, &source, &config, extent, &data);

        let mut covered = Vec::new();
        for record in &records {
            let (dst_block, restored) = match record {
                CowRecord::Raw { dst_block, data } => (*dst_block, data.clone()),
                CowRecord::Xor { dst_block, src_block, src_offset, data } => {
                    let old = source
                        .read_at(src_block * BS + u64::from(*src_offset), data.len())
                        .unwrap();
                    let restored: Vec<u8> = old.iter().zip(data).map(|(a, b)| a ^ b).collect();
                    (*dst_block, restored)
                }
                other => panic!("unexpected record {other:?}"),
            };
            prop_assert_eq!(restored.len() % BLOCK_SIZE, 0);
            let start = ((dst_block - extent.start_block) * BS) as usize;
            prop_assert_eq!(&restored[..], &data[start..start + restored.len()]);
            let blocks = restored.len() as u64 / BS;
            covered.extend(dst_block..dst_block + blocks);
        }

        covered.sort_unstable();
        let expected: Vec<u64> = (extent.start_block..extent.end_block()).collect();
        prop_assert_eq!(covered, expected);

        // Same inputs, same operations.
        prop_assert_eq!(write(&map, &source, &config, extent, &data), records);
    }

    #[test]
    fn xor_records_point_at_merge_source(
        op in xor_op_strategy(),
        seed in any::<u64>(),
    ) {
        let source = source_from_seed(seed);
        let dst = op.dst_extent.unwrap();
        let src = op.src_extent.unwrap();
        let mut map = ExtentMap::new();
        map.add_extent(dst, op.clone());
        let config = WriterConfig::new()
            .block_size(BLOCK_SIZE as u32)
            .partition_size(SOURCE_BLOCKS * BS);
        let data = vec![0u8; (dst.num_blocks * BS) as usize];

        let records = write(&map, &source, &config, dst, &data);

        prop_assert_eq!(records.len(), 1);
        match &records[0] {
            CowRecord::Xor { dst_block, src_block, src_offset, data } => {
                prop_assert_eq!(*dst_block, dst.start_block);
                prop_assert_eq!(*src_block, src.start_block);
                prop_assert_eq!(*src_offset, op.src_offset);
                let expected = source
                    .read_at(src.start_block * BS + u64::from(op.src_offset), data.len())
                    .unwrap();
                prop_assert_eq!(data, &expected);
            }
            other => panic!("expected XOR record, got {other:?}"),
        }
    }
}
