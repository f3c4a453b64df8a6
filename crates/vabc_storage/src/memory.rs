//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;

/// An in-memory storage backend.
///
/// Suitable for:
/// - Unit and integration tests (fake source partitions)
/// - Dry runs that build a COW log without touching disk
///
/// # Example
///
/// ```rust
/// use vabc_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let offset = backend.append(b"test data").unwrap();
/// assert_eq!(offset, 0);
/// assert_eq!(backend.size().unwrap(), 9);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<Vec<u8>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory backend with pre-existing data.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Returns a copy of all data in the backend.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        let data = self.data.read();
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size,
            });
        }
        // Fits: new_size is at most the current length.
        data.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn memory_new_is_empty() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(backend.data().is_empty());
    }

    #[test]
    fn memory_truncate() {
        let mut backend = InMemoryBackend::with_data(b"hello world".to_vec());
        backend.truncate(5).unwrap();
        assert_eq!(backend.data(), b"hello");
        assert!(matches!(
            backend.truncate(6),
            Err(StorageError::TruncateBeyondEnd {
                requested: 6,
                size: 5
            })
        ));
    }

    #[test]
    fn memory_append_returns_correct_offset() {
        let mut backend = InMemoryBackend::new();

        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.size().unwrap(), 11);
    }

    #[test]
    fn memory_read_into_full() {
        let backend = InMemoryBackend::with_data(b"hello world".to_vec());
        let mut buf = [0u8; 5];
        assert_eq!(backend.read_into(6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn memory_read_into_short_at_end() {
        let backend = InMemoryBackend::with_data(b"hello".to_vec());
        let mut buf = [0xAAu8; 4];
        assert_eq!(backend.read_into(3, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(&buf[2..], &[0xAA, 0xAA]);
    }

    #[test]
    fn memory_read_into_past_end_reads_nothing() {
        let backend = InMemoryBackend::with_data(b"hello".to_vec());
        let mut buf = [0u8; 4];
        assert_eq!(backend.read_into(10, &mut buf).unwrap(), 0);
        assert_eq!(backend.read_into(u64::MAX, &mut buf).unwrap(), 0);
    }

    #[test]
    fn memory_read_at_extending_past_end_fails() {
        let backend = InMemoryBackend::with_data(b"hello".to_vec());
        let result = backend.read_at(3, 10);
        assert!(matches!(
            result,
            Err(StorageError::ReadPastEnd {
                offset: 3,
                len: 10,
                size: 5
            })
        ));
    }

    #[test]
    fn memory_empty_read() {
        let backend = InMemoryBackend::with_data(b"hello".to_vec());
        assert!(backend.read_at(2, 0).unwrap().is_empty());
    }

    #[test]
    fn memory_flush_and_sync_succeed() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"data").unwrap();
        assert!(backend.flush().is_ok());
        assert!(backend.sync().is_ok());
    }

    proptest! {
        #[test]
        fn memory_read_into_never_exceeds_size(
            data in proptest::collection::vec(any::<u8>(), 0..256),
            offset in 0u64..300,
            len in 0usize..300,
        ) {
            let backend = InMemoryBackend::with_data(data.clone());
            let mut buf = vec![0u8; len];
            let n = backend.read_into(offset, &mut buf).unwrap();
            let available = (data.len() as u64).saturating_sub(offset) as usize;
            prop_assert_eq!(n, len.min(available));
            if n > 0 {
                let start = offset as usize;
                prop_assert_eq!(&buf[..n], &data[start..start + n]);
            }
        }
    }
}
