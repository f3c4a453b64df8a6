//! Dump command implementation.

use serde::Serialize;
use std::path::Path;
use vabc_core::{CowRecord, CowRecordIterator, CowResult};
use vabc_storage::{FileBackend, StorageBackend};

/// COW record representation for output.
#[derive(Debug, Serialize)]
pub struct CowRecordInfo {
    /// Offset in the COW log.
    pub offset: u64,
    /// Record type.
    pub record_type: String,
    /// First destination block (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_block: Option<u64>,
    /// First source block (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_block: Option<u64>,
    /// Byte offset into the first source block (XOR only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_offset: Option<u32>,
    /// Block count (COPY and ZERO).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_blocks: Option<u64>,
    /// Label value (LABEL only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<u64>,
    /// Block data size in bytes (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_size: Option<usize>,
}

impl CowRecordInfo {
    fn new(offset: u64, record: &CowRecord) -> Self {
        let mut info = Self {
            offset,
            record_type: record.record_type().name().to_string(),
            dst_block: None,
            src_block: None,
            src_offset: None,
            num_blocks: None,
            label: None,
            data_size: None,
        };
        match record {
            CowRecord::Raw { dst_block, data } => {
                info.dst_block = Some(*dst_block);
                info.data_size = Some(data.len());
            }
            CowRecord::Xor {
                dst_block,
                src_block,
                src_offset,
                data,
            } => {
                info.dst_block = Some(*dst_block);
                info.src_block = Some(*src_block);
                info.src_offset = Some(*src_offset);
                info.data_size = Some(data.len());
            }
            CowRecord::Copy {
                dst_block,
                src_block,
                num_blocks,
            } => {
                info.dst_block = Some(*dst_block);
                info.src_block = Some(*src_block);
                info.num_blocks = Some(*num_blocks);
            }
            CowRecord::Label { label } => info.label = Some(*label),
            CowRecord::Zero {
                dst_block,
                num_blocks,
            } => {
                info.dst_block = Some(*dst_block);
                info.num_blocks = Some(*num_blocks);
            }
        }
        info
    }
}

/// Runs the dump command.
pub fn run(path: &Path, limit: Option<usize>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err("COW log not found".into());
    }

    let backend = FileBackend::open_read_only(path)?;
    let records = read_cow_records(&backend, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => {
            print_text_output(&records);
        }
    }

    Ok(())
}

fn read_cow_records(
    backend: &dyn StorageBackend,
    limit: Option<usize>,
) -> CowResult<Vec<CowRecordInfo>> {
    CowRecordIterator::new(backend)?
        .take(limit.unwrap_or(usize::MAX))
        .map(|result| result.map(|(offset, record)| CowRecordInfo::new(offset, &record)))
        .collect()
}

fn print_text_output(records: &[CowRecordInfo]) {
    println!("COW Records ({} total)", records.len());
    println!("================");
    println!();

    for record in records {
        print!("[{:08}] {:6}", record.offset, record.record_type);

        if let Some(label) = record.label {
            print!(" label={}", label);
        }
        if let Some(dst) = record.dst_block {
            print!(" dst={}", dst);
        }
        if let Some(src) = record.src_block {
            print!(" src={}", src);
        }
        if let Some(offset) = record.src_offset {
            print!(" +{}", offset);
        }
        if let Some(n) = record.num_blocks {
            print!(" blocks={}", n);
        }
        if let Some(size) = record.data_size {
            print!(" data={} bytes", size);
        }

        println!();
    }
}
