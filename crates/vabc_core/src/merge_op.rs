//! Merge operations carried by a partition update.

use crate::extent::Extent;
use std::fmt;

/// How a merge operation relates destination blocks to source blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeOpType {
    /// Destination blocks are an exact copy of source blocks.
    Copy,
    /// Destination blocks are stored as an XOR delta against source blocks.
    Xor,
}

/// Maps a destination extent to the source extent it is derived from.
///
/// `src_offset` is a byte shift (smaller than one block) applied to every
/// source read, so source data need not be block-aligned with the destination.
/// The extents are optional because an update payload may omit them; writers
/// reject such operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOperation {
    /// Operation kind.
    pub op_type: MergeOpType,
    /// Source blocks.
    pub src_extent: Option<Extent>,
    /// Destination blocks.
    pub dst_extent: Option<Extent>,
    /// Sub-block byte shift applied to source reads.
    pub src_offset: u32,
}

impl MergeOperation {
    /// Creates a COPY operation.
    #[must_use]
    pub const fn copy(src_extent: Extent, dst_extent: Extent) -> Self {
        Self {
            op_type: MergeOpType::Copy,
            src_extent: Some(src_extent),
            dst_extent: Some(dst_extent),
            src_offset: 0,
        }
    }

    /// Creates an XOR operation with the given sub-block source shift.
    #[must_use]
    pub const fn xor(src_extent: Extent, dst_extent: Extent, src_offset: u32) -> Self {
        Self {
            op_type: MergeOpType::Xor,
            src_extent: Some(src_extent),
            dst_extent: Some(dst_extent),
            src_offset,
        }
    }

    /// Returns true for XOR operations.
    #[must_use]
    pub fn is_xor(&self) -> bool {
        self.op_type == MergeOpType::Xor
    }
}

impl fmt::Display for MergeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |e: Option<Extent>| e.map_or_else(|| "<none>".to_string(), |e| e.to_string());
        write!(
            f,
            "{:?} {} -> {} +{}",
            self.op_type,
            show(self.src_extent),
            show(self.dst_extent),
            self.src_offset
        )
    }
}
