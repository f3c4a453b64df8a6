//! Sequential reader over a COW log.

use crate::cow::record::{
    compute_crc32, CowRecord, CowRecordType, COW_MAGIC, COW_VERSION, CRC_SIZE, HEADER_SIZE,
};
use crate::error::{CowError, CowResult};
use vabc_storage::StorageBackend;

/// Iterates over the records of a COW log.
///
/// Yields `(offset, record)` pairs. Iteration stops after the first error.
///
/// # Example
///
/// ```ignore
/// for result in CowRecordIterator::new(&backend)? {
///     let (offset, record) = result?;
/// }
/// ```
pub struct CowRecordIterator<'a, B: ?Sized> {
    backend: &'a B,
    total_size: u64,
    offset: u64,
    finished: bool,
}

impl<'a, B: StorageBackend + ?Sized> CowRecordIterator<'a, B> {
    /// Creates an iterator starting at the beginning of the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn new(backend: &'a B) -> CowResult<Self> {
        Self::starting_at(backend, 0)
    }

    /// Creates an iterator starting at `offset`, which must be a record boundary.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn starting_at(backend: &'a B, offset: u64) -> CowResult<Self> {
        Ok(Self {
            backend,
            total_size: backend.size()?,
            offset,
            finished: false,
        })
    }

    /// Offset of the next record to read.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.offset
    }

    fn read_next(&mut self) -> CowResult<Option<(u64, CowRecord)>> {
        let start = self.offset;
        if start + HEADER_SIZE as u64 > self.total_size {
            return Ok(None);
        }

        let header = self.backend.read_at(start, HEADER_SIZE)?;
        if header[0..4] != COW_MAGIC {
            return Err(CowError::corrupt_log(format!("bad magic at offset {start}")));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version == 0 || version > COW_VERSION {
            return Err(CowError::corrupt_log(format!(
                "unsupported record version {version} at offset {start}"
            )));
        }
        let record_type = CowRecordType::from_byte(header[6]).ok_or_else(|| {
            CowError::corrupt_log(format!(
                "unknown record type {:#04x} at offset {start}",
                header[6]
            ))
        })?;
        let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

        let body_len = len + CRC_SIZE;
        if start + (HEADER_SIZE + body_len) as u64 > self.total_size {
            // Torn append at the tail.
            return Ok(None);
        }
        let body = self.backend.read_at(start + HEADER_SIZE as u64, body_len)?;
        let (payload, crc_bytes) = body.split_at(len);

        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let mut covered = header;
        covered.extend_from_slice(payload);
        let actual = compute_crc32(&covered);
        if expected != actual {
            return Err(CowError::ChecksumMismatch { expected, actual });
        }

        let record = CowRecord::decode_payload(record_type, payload)?;
        self.offset = start + (HEADER_SIZE + body_len) as u64;
        Ok(Some((start, record)))
    }
}

impl<B: StorageBackend + ?Sized> Iterator for CowRecordIterator<'_, B> {
    type Item = CowResult<(u64, CowRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
