//! Writer configuration.

use crate::error::{CowError, CowResult};

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Default size of the streaming writer's staging buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Configuration captured by a writer at construction.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Partition block size in bytes.
    pub block_size: u32,

    /// Source partition size in bytes (0 = unknown, no boundary checks).
    pub partition_size: u64,

    /// Largest piece the streaming writer forwards at once.
    pub buffer_size: usize,

    /// Whether the COW log flushes after every record.
    pub sync_on_write: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            partition_size: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sync_on_write: false,
        }
    }
}

impl WriterConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the block size.
    #[must_use]
    pub const fn block_size(mut self, size: u32) -> Self {
        self.block_size = size;
        self
    }

    /// Sets the source partition size.
    #[must_use]
    pub const fn partition_size(mut self, size: u64) -> Self {
        self.partition_size = size;
        self
    }

    /// Sets the streaming buffer size.
    #[must_use]
    pub const fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Sets whether the COW log flushes after every record.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Block size as a `u64`, for offset arithmetic.
    #[must_use]
    pub const fn block_bytes(&self) -> u64 {
        self.block_size as u64
    }

    /// Checks that the values are usable together.
    ///
    /// # Errors
    ///
    /// Returns [`CowError::InvalidArgument`] if the block size is zero or not
    /// a power of two, or if the buffer size is not a positive multiple of it.
    pub fn validate(&self) -> CowResult<()> {
        if !self.block_size.is_power_of_two() {
            return Err(CowError::invalid_argument(format!(
                "block size {} is not a power of two",
                self.block_size
            )));
        }
        if self.buffer_size == 0 || self.buffer_size % self.block_size as usize != 0 {
            return Err(CowError::invalid_argument(format!(
                "buffer size {} is not a positive multiple of block size {}",
                self.buffer_size, self.block_size
            )));
        }
        Ok(())
    }
}
