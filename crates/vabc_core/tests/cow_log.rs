//! End-to-end partition writes into an on-disk COW log.

use tempfile::tempdir;
use std::path::Path;
use vabc_core::{
    CowError, CowLogWriter, CowRecord, CowRecordIterator, Extent, MergeOperation, PartitionWriter,
    WriterConfig, END_OF_INSTALL_LABEL,
};
use vabc_storage::{FileBackend, InMemoryBackend, StorageBackend};

const BLOCK_SIZE: usize = 512;
const BS: u64 = BLOCK_SIZE as u64;

fn source() -> InMemoryBackend {
    InMemoryBackend::with_data((0..BLOCK_SIZE * 16).map(|i| (i / 7) as u8).collect())
}

fn config() -> WriterConfig {
    WriterConfig::new()
        .block_size(BLOCK_SIZE as u32)
        .partition_size(16 * BS)
        .buffer_size(BLOCK_SIZE * 2)
        .sync_on_write(true)
}

fn merge_ops() -> Vec<MergeOperation> {
    vec![
        MergeOperation::copy(Extent::new(0, 2), Extent::new(8, 2)),
        MergeOperation::copy(Extent::new(4, 1), Extent::new(4, 1)),
        MergeOperation::xor(Extent::new(10, 2), Extent::new(2, 2), 100),
    ]
}

#[test]
fn partition_update_round_trips_through_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("system_b.cow");
    let new_data: Vec<u8> = (0..BLOCK_SIZE * 4).map(|i| (i % 251) as u8).collect();

    {
        let log = CowLogWriter::new(FileBackend::create(&path).unwrap(), &config());
        let mut writer =
            PartitionWriter::new("system_b", config(), &merge_ops(), source(), log).unwrap();
        writer.write_copy_operations().unwrap();
        writer
            .write_operation(&[Extent::new(1, 4)], &new_data)
            .unwrap();
        writer
            .write_operation(&[Extent::new(12, 1)], &new_data[..BLOCK_SIZE])
            .unwrap();
        let log = writer.finish().unwrap();
        assert_eq!(log.records_written(), 10);
    }

    let records = read_records(&path);

    assert_eq!(
        records[0],
        CowRecord::Copy {
            dst_block: 8,
            src_block: 0,
            num_blocks: 2
        }
    );
    assert_eq!(records[1], CowRecord::Label { label: 0 });
    // Extent [1, 5) arrives as two two-block pieces; each piece emits its
    // XOR part before its replace part.
    match &records[2] {
        CowRecord::Xor {
            dst_block,
            src_block,
            src_offset,
            data,
        } => {
            assert_eq!((*dst_block, *src_block, *src_offset), (2, 10, 100));
            let old = source().read_at(10 * BS + 100, data.len()).unwrap();
            let restored: Vec<u8> = old.iter().zip(data).map(|(a, b)| a ^ b).collect();
            assert_eq!(restored, &new_data[BLOCK_SIZE..BLOCK_SIZE * 2]);
        }
        other => panic!("expected XOR record, got {other:?}"),
    }
    assert_eq!(
        records[3],
        CowRecord::Raw {
            dst_block: 1,
            data: new_data[..BLOCK_SIZE].to_vec()
        }
    );
    assert!(matches!(
        records[4],
        CowRecord::Xor {
            dst_block: 3,
            src_block: 11,
            src_offset: 100,
            ..
        }
    ));
    assert_eq!(
        records[5],
        CowRecord::Raw {
            dst_block: 4,
            data: new_data[BLOCK_SIZE * 3..].to_vec()
        }
    );
    assert_eq!(records[6], CowRecord::Label { label: 1 });
    assert!(matches!(records[7], CowRecord::Raw { dst_block: 12, .. }));
    assert_eq!(records[8], CowRecord::Label { label: 2 });
    assert_eq!(
        records[9],
        CowRecord::Label {
            label: END_OF_INSTALL_LABEL
        }
    );
    assert_eq!(records.len(), 10);
}

fn read_records(path: &Path) -> Vec<CowRecord> {
    let backend = FileBackend::open_read_only(path).unwrap();
    CowRecordIterator::new(&backend)
        .unwrap()
        .map(|r| r.map(|(_, record)| record))
        .collect::<Result<_, _>>()
        .unwrap()
}

#[test]
fn interrupted_update_resumes_from_label() {
    let dir = tempdir().unwrap();
    let full_path = dir.path().join("full.cow");
    let resumed_path = dir.path().join("resumed.cow");
    let new_data: Vec<u8> = (0..BLOCK_SIZE * 4).map(|i| (i % 239) as u8).collect();

    {
        let log = CowLogWriter::new(FileBackend::create(&full_path).unwrap(), &config());
        let mut writer =
            PartitionWriter::new("system_b", config(), &merge_ops(), source(), log).unwrap();
        writer.write_copy_operations().unwrap();
        writer.write_operation(&[Extent::new(1, 4)], &new_data).unwrap();
        writer.write_zero_operation(&[Extent::new(13, 2)]).unwrap();
        writer.finish().unwrap();
    }

    {
        let log = CowLogWriter::new(FileBackend::create(&resumed_path).unwrap(), &config());
        let mut writer =
            PartitionWriter::new("system_b", config(), &merge_ops(), source(), log).unwrap();
        writer.write_copy_operations().unwrap();
        writer.write_operation(&[Extent::new(1, 4)], &new_data).unwrap();
        let mut log = writer.close().unwrap();
        // Interrupted while writing operation 1.
        log.append(&CowRecord::Zero {
            dst_block: 13,
            num_blocks: 1,
        })
        .unwrap();
    }

    {
        let backend = FileBackend::open(&resumed_path).unwrap();
        let log = CowLogWriter::resume_at_label(backend, &config(), 1).unwrap();
        assert_eq!(log.records_written(), 7);
        let mut writer =
            PartitionWriter::resume("system_b", config(), &merge_ops(), source(), log, 1).unwrap();
        writer.write_zero_operation(&[Extent::new(13, 2)]).unwrap();
        let log = writer.finish().unwrap();
        assert_eq!(log.records_written(), 10);
    }

    assert_eq!(read_records(&resumed_path), read_records(&full_path));
}

#[test]
fn corrupted_log_stops_iteration() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("vendor_b.cow");
    {
        let mut log = CowLogWriter::new(FileBackend::create(&path).unwrap(), &config());
        log.append(&CowRecord::Label { label: 0 }).unwrap();
        log.append(&CowRecord::Label { label: 1 }).unwrap();
        let mut backend = log.into_inner();
        backend.sync().unwrap();
    }

    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let backend = FileBackend::open_read_only(&path).unwrap();
    let results: Vec<_> = CowRecordIterator::new(&backend).unwrap().collect();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(matches!(
        results[1],
        Err(CowError::ChecksumMismatch { .. })
    ));
}

#[test]
fn failed_operation_leaves_no_trailing_label() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("product_b.cow");
    let log = CowLogWriter::new(FileBackend::create(&path).unwrap(), &config());
    let ops = [MergeOperation::xor(Extent::new(15, 2), Extent::new(0, 2), 0)];
    let mut writer = PartitionWriter::new("product_b", config(), &ops, source(), log).unwrap();
    writer.write_copy_operations().unwrap();

    let err = writer
        .write_operation(&[Extent::new(0, 2)], &vec![0u8; BLOCK_SIZE * 2])
        .unwrap_err();
    assert!(matches!(err, CowError::SourceOverrun { .. }));
    assert_eq!(writer.next_op_index(), 0);
    assert_eq!(writer.sink().records_written(), 1);
}
