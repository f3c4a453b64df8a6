//! In-memory sink.

use crate::cow::record::CowRecord;
use crate::cow::CowSink;
use crate::error::{CowError, CowResult};

/// A [`CowSink`] that keeps every operation in memory.
///
/// Used for dry runs and as a test double. A failure can be injected so that
/// the sink rejects every operation once it has accepted a given number.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    records: Vec<CowRecord>,
    fail_after: Option<usize>,
    finalized: bool,
}

impl RecordingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sink that rejects operations after accepting `accepted`.
    #[must_use]
    pub fn failing_after(accepted: usize) -> Self {
        Self {
            fail_after: Some(accepted),
            ..Self::default()
        }
    }

    /// Operations recorded so far, in arrival order.
    #[must_use]
    pub fn records(&self) -> &[CowRecord] {
        &self.records
    }

    /// Consumes the sink and returns its records.
    #[must_use]
    pub fn into_records(self) -> Vec<CowRecord> {
        self.records
    }

    /// Returns true once [`CowSink::finalize`] has succeeded.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn push(&mut self, record: CowRecord) -> CowResult<()> {
        if self.fail_after.is_some_and(|n| self.records.len() >= n) {
            return Err(CowError::sink_rejected(format!(
                "{} record refused after {} accepted",
                record.record_type().name(),
                self.records.len()
            )));
        }
        self.records.push(record);
        Ok(())
    }
}

impl CowSink for RecordingSink {
    fn add_raw_blocks(&mut self, dst_start_block: u64, data: &[u8]) -> CowResult<()> {
        self.push(CowRecord::Raw {
            dst_block: dst_start_block,
            data: data.to_vec(),
        })
    }

    fn add_xor_blocks(
        &mut self,
        dst_start_block: u64,
        data: &[u8],
        src_block: u64,
        src_sub_block_offset: u32,
    ) -> CowResult<()> {
        self.push(CowRecord::Xor {
            dst_block: dst_start_block,
            src_block,
            src_offset: src_sub_block_offset,
            data: data.to_vec(),
        })
    }

    fn add_copy_blocks(
        &mut self,
        dst_start_block: u64,
        src_start_block: u64,
        num_blocks: u64,
    ) -> CowResult<()> {
        self.push(CowRecord::Copy {
            dst_block: dst_start_block,
            src_block: src_start_block,
            num_blocks,
        })
    }

    fn add_zero_blocks(&mut self, dst_start_block: u64, num_blocks: u64) -> CowResult<()> {
        self.push(CowRecord::Zero {
            dst_block: dst_start_block,
            num_blocks,
        })
    }

    fn add_label(&mut self, label: u64) -> CowResult<()> {
        self.push(CowRecord::Label { label })
    }

    fn finalize(&mut self) -> CowResult<()> {
        self.finalized = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_keeps_order() {
        let mut sink = RecordingSink::new();
        sink.add_label(0).unwrap();
        sink.add_raw_blocks(4, &[1, 2]).unwrap();
        sink.finalize().unwrap();
        assert!(sink.is_finalized());
        assert_eq!(
            sink.into_records(),
            vec![
                CowRecord::Label { label: 0 },
                CowRecord::Raw {
                    dst_block: 4,
                    data: vec![1, 2]
                }
            ]
        );
    }

    #[test]
    fn recording_injected_failure() {
        let mut sink = RecordingSink::failing_after(1);
        assert!(sink.add_label(0).is_ok());
        assert!(matches!(
            sink.add_copy_blocks(0, 1, 1),
            Err(CowError::SinkRejected { .. })
        ));
        assert_eq!(sink.records().len(), 1);
    }
}
