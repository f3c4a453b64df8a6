//! # vabc core
//!
//! Write path for applying a block-level partition update as a copy-on-write
//! overlay (Virtual A/B compression).
//!
//! This crate provides:
//! - [`Extent`] arithmetic and [`MergeOperation`] descriptors
//! - [`ExtentMap`], the [`MergeOpLookup`] over XOR merge operations
//! - [`XorExtentWriter`], which stores each install extent as XOR deltas
//!   against the source partition where possible and verbatim elsewhere
//! - [`BlockExtentWriter`], which slices a byte stream into extent writes
//! - [`PartitionWriter`], which drives a whole partition into a [`CowSink`]
//! - [`CowLogWriter`] / [`CowRecordIterator`], a framed on-disk COW log
//!
//! ## Example
//!
//! ```rust
//! use vabc_core::{Extent, ExtentMap, MergeOperation, RecordingSink, WriterConfig, XorExtentWriter};
//! use vabc_storage::InMemoryBackend;
//!
//! let config = WriterConfig::new().block_size(512);
//! let source = InMemoryBackend::with_data(vec![0xFF; 512 * 8]);
//! let mut map = ExtentMap::new();
//! map.add_extent(Extent::new(2, 1), MergeOperation::xor(Extent::new(6, 1), Extent::new(2, 1), 0));
//!
//! let mut sink = RecordingSink::new();
//! let mut writer = XorExtentWriter::new(&map, &source, &mut sink, &config).unwrap();
//! writer.write_extent(&vec![0u8; 512 * 3], Extent::new(1, 3)).unwrap();
//! assert_eq!(sink.records().len(), 3);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod block_writer;
mod config;
pub mod cow;
mod error;
mod extent;
mod extent_map;
mod merge_op;
mod partition;
mod xor_writer;

pub use block_writer::{BlockExtentWriter, WriteExtent};
pub use config::{WriterConfig, DEFAULT_BLOCK_SIZE, DEFAULT_BUFFER_SIZE};
pub use cow::{CowLogWriter, CowRecord, CowRecordIterator, CowRecordType, CowSink, RecordingSink};
pub use error::{CowError, CowResult};
pub use extent::{checked_total_blocks, Extent};
pub use extent_map::{ExtentMap, MergeOpLookup};
pub use merge_op::{MergeOpType, MergeOperation};
pub use partition::{PartitionWriter, END_OF_INSTALL_LABEL};
pub use xor_writer::XorExtentWriter;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
