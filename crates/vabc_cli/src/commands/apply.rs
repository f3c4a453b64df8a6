//! Apply command implementation.

use crate::manifest::{Manifest, OperationKind};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use vabc_core::{
    CowError, CowLogWriter, CowResult, CowSink, PartitionWriter, RecordingSink, WriterConfig,
};
use vabc_storage::{FileBackend, StorageBackend};

/// What an apply run produced.
#[derive(Debug)]
pub struct ApplySummary {
    /// Partition name from the manifest.
    pub partition: String,
    /// Install operations written.
    pub operations: u64,
    /// COPY merge operations in the manifest.
    pub copy_operations: usize,
    /// XOR extents the writer could use.
    pub xor_extents: usize,
    /// Records emitted to the sink.
    pub records: u64,
    /// COW log written, `None` for a dry run.
    pub output: Option<PathBuf>,
    /// Size of the COW log in bytes.
    pub output_bytes: u64,
}

impl ApplySummary {
    /// Prints the summary to stdout.
    pub fn print(&self) {
        println!("Partition '{}'", self.partition);
        println!("================");
        println!("  Install operations: {}", self.operations);
        println!("  COPY operations:    {}", self.copy_operations);
        println!("  XOR extents:        {}", self.xor_extents);
        println!("  COW records:        {}", self.records);
        match &self.output {
            Some(path) => println!("  Output:             {:?} ({} bytes)", path, self.output_bytes),
            None => println!("  Output:             dry run, nothing written"),
        }
    }
}

struct Written<S> {
    sink: S,
    operations: u64,
    copy_operations: usize,
    xor_extents: usize,
}

/// Runs the apply command.
///
/// With `output` set to `None` the records are kept in memory only. With
/// `resume_from` set, `output` must hold the log of an interrupted run; it is
/// cut back to that label and the operations from that index on are written.
pub fn run(
    source_path: &Path,
    data_path: &Path,
    manifest_path: &Path,
    output: Option<&Path>,
    resume_from: Option<u64>,
) -> Result<ApplySummary, Box<dyn std::error::Error>> {
    let manifest = Manifest::load(manifest_path)?;
    let source = FileBackend::open_read_only(source_path)?;
    let partition_size = match manifest.partition_size {
        Some(size) => size,
        None => source.size()?,
    };
    let config = WriterConfig::new()
        .block_size(manifest.block_size)
        .partition_size(partition_size);
    config.validate()?;

    let data = FileBackend::open_read_only(data_path)?;
    let needed = manifest
        .data_len()
        .ok_or("operations need more data than fits in 64 bits")?;
    let available = data.size()?;
    if available < needed {
        return Err(format!(
            "data file holds {available} bytes but the operations need {needed}"
        )
        .into());
    }
    if available > needed {
        warn!(
            unused = available - needed,
            "data file is longer than the operations need"
        );
    }

    info!(
        partition = %manifest.partition_name,
        operations = manifest.operations.len(),
        partition_size,
        "applying update"
    );

    let summary = match output {
        Some(path) => {
            let log = match resume_from {
                Some(label) => {
                    CowLogWriter::resume_at_label(FileBackend::open(path)?, &config, label)?
                }
                None => CowLogWriter::new(FileBackend::create_with_dirs(path)?, &config),
            };
            let written = write_partition(&manifest, config, source, &data, log, resume_from)?;
            ApplySummary {
                partition: manifest.partition_name.clone(),
                operations: written.operations,
                copy_operations: written.copy_operations,
                xor_extents: written.xor_extents,
                records: written.sink.records_written(),
                output: Some(path.to_path_buf()),
                output_bytes: written.sink.backend().size()?,
            }
        }
        None => {
            if resume_from.is_some() {
                return Err("resuming needs an existing COW log to write to".into());
            }
            let sink = RecordingSink::new();
            let written = write_partition(&manifest, config, source, &data, sink, None)?;
            ApplySummary {
                partition: manifest.partition_name.clone(),
                operations: written.operations,
                copy_operations: written.copy_operations,
                xor_extents: written.xor_extents,
                records: written.sink.records().len() as u64,
                output: None,
                output_bytes: 0,
            }
        }
    };
    Ok(summary)
}

fn write_partition<S: CowSink>(
    manifest: &Manifest,
    config: WriterConfig,
    source: FileBackend,
    data: &FileBackend,
    sink: S,
    resume_from: Option<u64>,
) -> CowResult<Written<S>> {
    let merge_ops = manifest.merge_operations();
    let name = &manifest.partition_name;
    let mut writer = match resume_from {
        Some(next_op_index) => {
            PartitionWriter::resume(name, config, &merge_ops, source, sink, next_op_index)?
        }
        None => PartitionWriter::new(name, config, &merge_ops, source, sink)?,
    };
    let copy_operations = merge_ops.iter().filter(|op| !op.is_xor()).count();
    let xor_extents = writer.xor_map().len();

    if resume_from.is_none() {
        writer.write_copy_operations()?;
    }

    let skip = usize::try_from(writer.next_op_index()).unwrap_or(usize::MAX);
    if skip > manifest.operations.len() {
        return Err(CowError::invalid_argument(format!(
            "cannot resume at operation {skip} of {}",
            manifest.operations.len()
        )));
    }

    let mut offset = 0u64;
    for (index, op) in manifest.operations.iter().enumerate() {
        // Validated by Manifest::validate.
        let len = op.data_len(manifest.block_size).unwrap_or(0);
        if index < skip {
            offset += len;
            continue;
        }
        let extents = op.extents();
        let result = match op.kind {
            OperationKind::Replace => {
                let len = usize::try_from(len)
                    .map_err(|_| CowError::invalid_argument("operation data too large"))?;
                let bytes = data.read_at(offset, len)?;
                writer.write_operation(&extents, &bytes)
            }
            OperationKind::Zero | OperationKind::Discard => writer.write_zero_operation(&extents),
            OperationKind::SourceCopy => {
                writer.write_source_copy_operation(&op.src_extents(), &extents)
            }
        };
        if let Err(e) = result {
            error!(operation = index, error = %e, "install operation failed");
            return Err(e);
        }
        offset += len;
    }

    let operations = writer.next_op_index();
    let sink = writer.finish()?;
    Ok(Written {
        sink,
        operations,
        copy_operations,
        xor_extents,
    })
}
