//! Storage backend trait definition.

use crate::error::{StorageError, StorageResult};

/// An offset-addressed byte store.
///
/// Source partitions are only ever read through [`read_into`](Self::read_into);
/// COW logs are built with [`append`](Self::append) and read back with
/// [`read_at`](Self::read_at).
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_into` never returns more bytes than exist past `offset`
/// - `flush` ensures all appended data has been handed to the OS
/// - Backends must be `Send + Sync`
pub trait StorageBackend: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset` into `buf`.
    ///
    /// Keeps reading until `buf` is full or the end of storage is reached, and
    /// returns the number of bytes read. A return value smaller than
    /// `buf.len()` means the storage ended; callers that need the full range
    /// must treat it as a failure.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize>;

    /// Reads exactly `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReadPastEnd`] if fewer than `len` bytes are
    /// available, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let read = self.read_into(offset, &mut buf)?;
        if read != len {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: self.size()?,
            });
        }
        Ok(buf)
    }

    /// Appends data to the end of the storage.
    ///
    /// Returns the offset where the data was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is read-only or an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Flushes all pending writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the storage to `new_size` bytes.
    ///
    /// Used to drop a partially written tail before appending again.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` is larger than the current size, if
    /// the backend is read-only, or if an I/O error occurs.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
