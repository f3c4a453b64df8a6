//! Partition update manifest.
//!
//! A manifest is the JSON description of one partition's update:
//!
//! ```json
//! {
//!   "partition_name": "system",
//!   "block_size": 4096,
//!   "merge_operations": [
//!     { "type": "copy", "src_extent": { "start_block": 0, "num_blocks": 2 },
//!       "dst_extent": { "start_block": 8, "num_blocks": 2 } },
//!     { "type": "xor", "src_extent": { "start_block": 12, "num_blocks": 2 },
//!       "dst_extent": { "start_block": 321, "num_blocks": 2 }, "src_offset": 777 }
//!   ],
//!   "operations": [
//!     { "dst_extents": [{ "start_block": 320, "num_blocks": 4 }] },
//!     { "type": "zero", "dst_extents": [{ "start_block": 400, "num_blocks": 8 }] },
//!     { "type": "source_copy",
//!       "src_extents": [{ "start_block": 0, "num_blocks": 2 }],
//!       "dst_extents": [{ "start_block": 8, "num_blocks": 2 }] }
//!   ]
//! }
//! ```
//!
//! `partition_size` is optional; when absent the size of the source image is
//! used. An operation without a `type` is a replace: its new content is the
//! next stretch of the data file.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use vabc_core::{checked_total_blocks, Extent, MergeOpType, MergeOperation};

/// Errors from loading a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file could not be read.
    #[error("cannot read manifest: {0}")]
    Io(#[from] std::io::Error),

    /// The manifest is not valid JSON for this schema.
    #[error("malformed manifest: {0}")]
    Json(#[from] serde_json::Error),

    /// The manifest parsed but describes an impossible update.
    #[error("invalid manifest: {message}")]
    Invalid {
        /// What is wrong.
        message: String,
    },
}

/// A block range as written in the manifest.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtentEntry {
    /// First block.
    pub start_block: u64,
    /// Length in blocks.
    pub num_blocks: u64,
}

impl From<ExtentEntry> for Extent {
    fn from(entry: ExtentEntry) -> Self {
        Extent::new(entry.start_block, entry.num_blocks)
    }
}

/// Merge operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeOpKind {
    /// Plain block copy.
    Copy,
    /// XOR against a shifted source range.
    Xor,
}

/// A merge operation entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeOpEntry {
    /// Operation kind.
    #[serde(rename = "type")]
    pub kind: MergeOpKind,
    /// Source blocks.
    #[serde(default)]
    pub src_extent: Option<ExtentEntry>,
    /// Destination blocks.
    #[serde(default)]
    pub dst_extent: Option<ExtentEntry>,
    /// Byte shift of the source read, XOR only.
    #[serde(default)]
    pub src_offset: u32,
}

/// Install operation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// New content taken from the data file.
    #[default]
    Replace,
    /// Destination blocks become zeroes.
    Zero,
    /// Destination blocks are discarded, written as zeroes.
    Discard,
    /// Destination blocks are copied from source blocks.
    SourceCopy,
}

/// An install operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallOperation {
    /// Operation kind.
    #[serde(rename = "type", default)]
    pub kind: OperationKind,
    /// Source extents, `source_copy` only.
    #[serde(default)]
    pub src_extents: Vec<ExtentEntry>,
    /// Destination extents, in the order the data is laid out.
    pub dst_extents: Vec<ExtentEntry>,
}

impl InstallOperation {
    /// Destination extents as core extents.
    pub fn extents(&self) -> Vec<Extent> {
        self.dst_extents.iter().map(|&e| Extent::from(e)).collect()
    }

    /// Source extents as core extents.
    pub fn src_extents(&self) -> Vec<Extent> {
        self.src_extents.iter().map(|&e| Extent::from(e)).collect()
    }

    /// Bytes of the data file this operation consumes, `None` on overflow.
    pub fn data_len(&self, block_size: u32) -> Option<u64> {
        match self.kind {
            OperationKind::Replace => checked_total_blocks(&self.extents())?
                .checked_mul(u64::from(block_size)),
            OperationKind::Zero | OperationKind::Discard | OperationKind::SourceCopy => Some(0),
        }
    }
}

/// Returns true if every block of `extent` has a byte offset below `u64::MAX`.
fn addressable(extent: Extent, block_size: u32) -> bool {
    extent
        .checked_end_block()
        .and_then(|end| end.checked_mul(u64::from(block_size)))
        .is_some()
}

/// Update manifest for one partition.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Partition name, used in logs.
    #[serde(default = "default_partition_name")]
    pub partition_name: String,
    /// Block size in bytes.
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Source partition size in bytes.
    #[serde(default)]
    pub partition_size: Option<u64>,
    /// COPY and XOR merge operations.
    #[serde(default)]
    pub merge_operations: Vec<MergeOpEntry>,
    /// Install operations, in data order.
    pub operations: Vec<InstallOperation>,
}

fn default_partition_name() -> String {
    "partition".to_string()
}

fn default_block_size() -> u32 {
    vabc_core::DEFAULT_BLOCK_SIZE
}

impl Manifest {
    /// Reads and validates a manifest file.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parses and validates a manifest.
    pub fn from_json(text: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_str(text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        let invalid = |message: String| Err(ManifestError::Invalid { message });
        for (index, op) in self.operations.iter().enumerate() {
            let extents = op.extents();
            let src_extents = op.src_extents();
            if let Some(ext) = extents
                .iter()
                .chain(&src_extents)
                .find(|e| !addressable(**e, self.block_size))
            {
                return invalid(format!(
                    "operation {index} has extent {ext} past the addressable range"
                ));
            }
            let blocks = checked_total_blocks(&extents);
            if blocks == Some(0) {
                return invalid(format!("operation {index} has no destination blocks"));
            }
            if op.data_len(self.block_size).is_none() {
                return invalid(format!("operation {index} is too large"));
            }
            match op.kind {
                OperationKind::SourceCopy => {
                    if checked_total_blocks(&src_extents) != blocks {
                        return invalid(format!(
                            "operation {index} has source and destination extents of different sizes"
                        ));
                    }
                }
                _ if !src_extents.is_empty() => {
                    return invalid(format!(
                        "operation {index} has source extents but is not a source copy"
                    ));
                }
                _ => {}
            }
        }
        if self.data_len().is_none() {
            return invalid("operations need more data than fits in 64 bits".to_string());
        }
        for (index, op) in self.merge_operations.iter().enumerate() {
            for ext in [op.src_extent, op.dst_extent].into_iter().flatten() {
                if !addressable(ext.into(), self.block_size) {
                    return invalid(format!(
                        "merge operation {index} has extent {} past the addressable range",
                        Extent::from(ext)
                    ));
                }
            }
            if op.kind == MergeOpKind::Xor && op.src_offset >= self.block_size {
                return Err(ManifestError::Invalid {
                    message: format!(
                        "merge operation {index} has source offset {} not below block size {}",
                        op.src_offset, self.block_size
                    ),
                });
            }
        }
        Ok(())
    }

    /// Merge operations as core values.
    pub fn merge_operations(&self) -> Vec<MergeOperation> {
        self.merge_operations
            .iter()
            .map(|entry| MergeOperation {
                op_type: match entry.kind {
                    MergeOpKind::Copy => MergeOpType::Copy,
                    MergeOpKind::Xor => MergeOpType::Xor,
                },
                src_extent: entry.src_extent.map(Extent::from),
                dst_extent: entry.dst_extent.map(Extent::from),
                src_offset: entry.src_offset,
            })
            .collect()
    }

    /// Total number of data bytes the install operations consume, `None`
    /// if that does not fit in a `u64`.
    pub fn data_len(&self) -> Option<u64> {
        self.operations.iter().try_fold(0u64, |total, op| {
            total.checked_add(op.data_len(self.block_size)?)
        })
    }
}
