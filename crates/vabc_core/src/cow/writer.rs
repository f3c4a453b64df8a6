//! COW log writer.

use crate::config::WriterConfig;
use crate::cow::iterator::CowRecordIterator;
use crate::cow::record::CowRecord;
use crate::cow::CowSink;
use crate::error::{CowError, CowResult};
use tracing::{debug, info, warn};
use vabc_storage::StorageBackend;

/// A [`CowSink`] that appends framed records to a storage backend.
///
/// # Example
///
/// ```rust
/// use vabc_core::{CowLogWriter, CowSink, WriterConfig};
/// use vabc_storage::InMemoryBackend;
///
/// let config = WriterConfig::new().block_size(512);
/// let mut log = CowLogWriter::new(InMemoryBackend::new(), &config);
/// log.add_raw_blocks(7, &[0u8; 512]).unwrap();
/// log.finalize().unwrap();
/// assert_eq!(log.records_written(), 1);
/// ```
#[derive(Debug)]
pub struct CowLogWriter<B> {
    backend: B,
    block_size: u64,
    sync_on_write: bool,
    records_written: u64,
}

impl<B: StorageBackend> CowLogWriter<B> {
    /// Creates a writer appending to `backend`.
    pub fn new(backend: B, config: &WriterConfig) -> Self {
        Self {
            backend,
            block_size: config.block_bytes(),
            sync_on_write: config.sync_on_write,
            records_written: 0,
        }
    }

    /// Reopens an existing log for appending after `label`.
    ///
    /// Everything recorded after the first `Label { label }` record is cut
    /// off, so the writer continues exactly where that label was written.
    /// The records kept count towards [`records_written`](Self::records_written).
    ///
    /// # Errors
    ///
    /// Returns [`CowError::LabelNotFound`] if the log holds no such label,
    /// or an error if the log cannot be read or truncated.
    pub fn resume_at_label(mut backend: B, config: &WriterConfig, label: u64) -> CowResult<Self> {
        let mut kept = 0u64;
        let mut resume_offset = None;
        {
            let mut records = CowRecordIterator::new(&backend)?;
            while resume_offset.is_none() {
                let Some(entry) = records.next() else {
                    break;
                };
                let (_, record) = entry?;
                kept += 1;
                if record == (CowRecord::Label { label }) {
                    resume_offset = Some(records.position());
                }
            }
        }
        let Some(offset) = resume_offset else {
            warn!(label, "resume label not found in COW log");
            return Err(CowError::LabelNotFound { label });
        };

        let size = backend.size()?;
        if size > offset {
            backend.truncate(offset)?;
        }
        info!(label, records = kept, dropped_bytes = size - offset, "COW log resumed");

        let mut writer = Self::new(backend, config);
        writer.records_written = kept;
        Ok(writer)
    }

    /// Appends a record to the log.
    ///
    /// Returns the offset where the record was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or the backend fails.
    pub fn append(&mut self, record: &CowRecord) -> CowResult<u64> {
        let data = record.encode()?;
        let offset = self.backend.append(&data)?;
        if self.sync_on_write {
            self.backend.flush()?;
        }
        self.records_written += 1;
        Ok(offset)
    }

    /// Number of records appended through this writer.
    #[must_use]
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Consumes the writer and returns the backend.
    pub fn into_inner(self) -> B {
        self.backend
    }

    fn check_blocks(&self, dst_start_block: u64, data: &[u8]) -> CowResult<()> {
        if data.is_empty() || data.len() as u64 % self.block_size != 0 {
            return Err(CowError::invalid_argument(format!(
                "block data for {} is {} bytes, not a whole number of {}-byte blocks",
                dst_start_block,
                data.len(),
                self.block_size
            )));
        }
        Ok(())
    }
}

impl<B: StorageBackend> CowSink for CowLogWriter<B> {
    fn add_raw_blocks(&mut self, dst_start_block: u64, data: &[u8]) -> CowResult<()> {
        self.check_blocks(dst_start_block, data)?;
        self.append(&CowRecord::Raw {
            dst_block: dst_start_block,
            data: data.to_vec(),
        })?;
        Ok(())
    }

    fn add_xor_blocks(
        &mut self,
        dst_start_block: u64,
        data: &[u8],
        src_block: u64,
        src_sub_block_offset: u32,
    ) -> CowResult<()> {
        self.check_blocks(dst_start_block, data)?;
        if u64::from(src_sub_block_offset) >= self.block_size {
            return Err(CowError::invalid_argument(format!(
                "source offset {} is not inside a {}-byte block",
                src_sub_block_offset, self.block_size
            )));
        }
        self.append(&CowRecord::Xor {
            dst_block: dst_start_block,
            src_block,
            src_offset: src_sub_block_offset,
            data: data.to_vec(),
        })?;
        Ok(())
    }

    fn add_copy_blocks(
        &mut self,
        dst_start_block: u64,
        src_start_block: u64,
        num_blocks: u64,
    ) -> CowResult<()> {
        if num_blocks == 0 {
            return Err(CowError::invalid_argument(format!(
                "empty copy to block {}",
                dst_start_block
            )));
        }
        self.append(&CowRecord::Copy {
            dst_block: dst_start_block,
            src_block: src_start_block,
            num_blocks,
        })?;
        Ok(())
    }

    fn add_zero_blocks(&mut self, dst_start_block: u64, num_blocks: u64) -> CowResult<()> {
        if num_blocks == 0 {
            return Err(CowError::invalid_argument(format!(
                "empty zero run at block {}",
                dst_start_block
            )));
        }
        self.append(&CowRecord::Zero {
            dst_block: dst_start_block,
            num_blocks,
        })?;
        Ok(())
    }

    fn add_label(&mut self, label: u64) -> CowResult<()> {
        self.append(&CowRecord::Label { label })?;
        Ok(())
    }

    fn finalize(&mut self) -> CowResult<()> {
        self.backend.flush()?;
        self.backend.sync()?;
        debug!(
            records = self.records_written,
            bytes = self.backend.size()?,
            "COW log finalized"
        );
        Ok(())
    }
}
