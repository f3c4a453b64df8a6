//! Error types for the COW writing pipeline.

use crate::extent::Extent;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CowResult<T> = Result<T, CowError>;

/// Errors that can occur while turning install operations into COW records.
#[derive(Debug, Error)]
pub enum CowError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] vabc_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The source partition returned fewer bytes than requested.
    #[error("short read from source: read {read} of {expected} bytes at offset {offset}")]
    ShortRead {
        /// Byte offset of the read.
        offset: u64,
        /// Bytes requested.
        expected: usize,
        /// Bytes actually read.
        read: usize,
    },

    /// The lookup reported an XOR extent that has no merge operation.
    #[error("no merge operation for XOR extent {extent} (install extent {install_extent})")]
    MissingMergeOperation {
        /// The XOR sub-extent.
        extent: Extent,
        /// The install operation extent being written.
        install_extent: Extent,
    },

    /// A merge operation lacks its source or destination extent.
    #[error("merge operation for {extent} is missing its {missing} extent")]
    IncompleteMergeOperation {
        /// The XOR sub-extent the operation was fetched for.
        extent: Extent,
        /// Which extent is absent (`"source"` or `"destination"`).
        missing: &'static str,
    },

    /// A sub-extent is not fully inside the extent that should contain it.
    #[error("{kind} extent {inner} is not contained in {outer}")]
    ExtentNotContained {
        /// What the inner extent is (`"xor"`, `"replace"`, ...).
        kind: &'static str,
        /// The offending sub-extent.
        inner: Extent,
        /// The extent expected to contain it.
        outer: Extent,
    },

    /// The lookup's sub-extents leave a gap in, or cover twice, an install extent.
    #[error("block {block} of install extent {extent} is {reason}")]
    TilingMismatch {
        /// The install extent being written.
        extent: Extent,
        /// First offending block.
        block: u64,
        /// `"not covered"` or `"covered twice"`.
        reason: &'static str,
    },

    /// An XOR read would overrun the source partition by a block or more.
    #[error(
        "XOR read for {extent} overruns source partition of {partition_size} bytes by {oob_bytes} bytes"
    )]
    SourceOverrun {
        /// The XOR sub-extent.
        extent: Extent,
        /// Bytes past the end of the partition.
        oob_bytes: u64,
        /// Source partition size in bytes.
        partition_size: u64,
    },

    /// More bytes were written than the destination extents can hold.
    #[error("all extents written, {pending} bytes left over")]
    ExtentsExhausted {
        /// Bytes that had nowhere to go.
        pending: usize,
    },

    /// COW log is corrupted or unreadable.
    #[error("COW log corruption: {message}")]
    CorruptLog {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch in a COW record.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// A COW log has no label to resume from.
    #[error("label {label} not found in COW log")]
    LabelNotFound {
        /// The label asked for.
        label: u64,
    },

    /// An argument or configuration value was rejected.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Why the argument was rejected.
        message: String,
    },

    /// The sink refused an operation.
    #[error("sink rejected operation: {message}")]
    SinkRejected {
        /// Why the sink refused.
        message: String,
    },
}

impl CowError {
    /// Creates a COW log corruption error.
    pub fn corrupt_log(message: impl Into<String>) -> Self {
        Self::CorruptLog {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a sink rejection error.
    pub fn sink_rejected(message: impl Into<String>) -> Self {
        Self::SinkRejected {
            message: message.into(),
        }
    }

    /// Returns true if the error is an I/O failure rather than a logic error.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_) | Self::ShortRead { .. })
    }
}
