//! Destination-extent index over merge operations.
//!
//! The extent writer asks three questions of this index for every install
//! extent it writes: which blocks have a merge operation, which do not, and
//! which operation covers a given run of blocks. [`MergeOpLookup`] is that
//! capability; [`ExtentMap`] is the in-crate implementation.

use crate::extent::Extent;
use crate::merge_op::{MergeOpType, MergeOperation};
use std::collections::BTreeMap;
use tracing::warn;

/// Read-only lookup of merge operations by destination block range.
///
/// # Contract
///
/// For any `extent`, the results of `intersecting_extents` and
/// `non_intersecting_extents` lie within `extent` and together cover every
/// block of it exactly once, each list in ascending block order. Every extent
/// returned by `intersecting_extents` has an operation under `get`.
pub trait MergeOpLookup {
    /// Sub-extents of `extent` that are covered by a merge operation.
    fn intersecting_extents(&self, extent: Extent) -> Vec<Extent>;

    /// Sub-extents of `extent` that no merge operation covers.
    fn non_intersecting_extents(&self, extent: Extent) -> Vec<Extent>;

    /// The merge operation whose destination fully contains `extent`.
    fn get(&self, extent: Extent) -> Option<&MergeOperation>;
}

/// Non-overlapping destination extents, each mapped to a merge operation.
#[derive(Debug, Default, Clone)]
pub struct ExtentMap {
    // Keyed by start block; entries never overlap.
    entries: BTreeMap<u64, (Extent, MergeOperation)>,
}

impl ExtentMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the map of XOR operations of a partition update, keyed by
    /// destination extent.
    ///
    /// Operations of other kinds, operations without a usable destination
    /// extent and operations overlapping an earlier one are skipped.
    #[must_use]
    pub fn xor_map(merge_ops: &[MergeOperation]) -> Self {
        Self::from_ops(merge_ops, MergeOpType::Xor)
    }

    /// Builds the map of COPY operations of a partition update, keyed by
    /// destination extent. Skips what [`xor_map`](Self::xor_map) skips.
    #[must_use]
    pub fn copy_map(merge_ops: &[MergeOperation]) -> Self {
        Self::from_ops(merge_ops, MergeOpType::Copy)
    }

    fn from_ops(merge_ops: &[MergeOperation], op_type: MergeOpType) -> Self {
        let mut map = Self::new();
        for op in merge_ops.iter().filter(|op| op.op_type == op_type) {
            let Some(dst) = op.dst_extent else {
                warn!(%op, "merge operation without destination extent skipped");
                continue;
            };
            if dst.checked_end_block().is_none() {
                warn!(%op, "merge operation destination past the last addressable block, skipped");
                continue;
            }
            if !map.add_extent(dst, op.clone()) {
                warn!(%op, "merge operation overlaps an earlier one, skipped");
            }
        }
        map
    }

    /// Inserts `op` under `extent`.
    ///
    /// Returns false, leaving the map unchanged, if `extent` is empty, ends
    /// past the last addressable block or overlaps an extent already in the
    /// map.
    pub fn add_extent(&mut self, extent: Extent, op: MergeOperation) -> bool {
        if extent.is_empty()
            || extent.checked_end_block().is_none()
            || self.overlapping(extent).next().is_some()
        {
            return false;
        }
        self.entries.insert(extent.start_block, (extent, op));
        true
    }

    /// Returns true if `block` lies inside one of the stored extents.
    #[must_use]
    pub fn contains_block(&self, block: u64) -> bool {
        self.get(Extent::new(block, 1)).is_some()
    }

    /// Number of extents in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the map holds no extents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn overlapping(&self, extent: Extent) -> impl Iterator<Item = &(Extent, MergeOperation)> {
        // The entry starting before `extent` may still reach into it.
        let first = self
            .entries
            .range(..extent.start_block)
            .next_back()
            .map_or(extent.start_block, |(start, _)| *start);
        self.entries
            .range(first..extent.end_block())
            .map(|(_, entry)| entry)
            .filter(move |(stored, _)| stored.overlaps(&extent))
    }
}

impl MergeOpLookup for ExtentMap {
    fn intersecting_extents(&self, extent: Extent) -> Vec<Extent> {
        if extent.is_empty() {
            return Vec::new();
        }
        self.overlapping(extent)
            .filter_map(|(stored, _)| stored.intersection(&extent))
            .collect()
    }

    fn non_intersecting_extents(&self, extent: Extent) -> Vec<Extent> {
        let mut gaps = Vec::new();
        let mut cursor = extent.start_block;
        for covered in self.intersecting_extents(extent) {
            if covered.start_block > cursor {
                gaps.push(Extent::new(cursor, covered.start_block - cursor));
            }
            cursor = covered.end_block();
        }
        if cursor < extent.end_block() {
            gaps.push(Extent::new(cursor, extent.end_block() - cursor));
        }
        gaps
    }

    fn get(&self, extent: Extent) -> Option<&MergeOperation> {
        let (_, (stored, op)) = self.entries.range(..=extent.start_block).next_back()?;
        stored.contains(&extent).then_some(op)
    }
}
