//! # vabc storage
//!
//! Byte stores addressed by absolute offset.
//!
//! A backend plays two roles in a Virtual A/B compression update:
//!
//! - the **source partition**, read at arbitrary offsets while XOR deltas are
//!   computed against it
//! - the **COW log**, an append-only store of framed block records
//!
//! Backends do not interpret the data they store.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and dry runs
//! - [`FileBackend`] - Partition images and COW files on disk
//!
//! ## Example
//!
//! ```rust
//! use vabc_storage::{StorageBackend, InMemoryBackend};
//!
//! let source = InMemoryBackend::with_data(vec![7u8; 16]);
//! let mut buf = [0u8; 8];
//! let n = source.read_into(12, &mut buf).unwrap();
//! assert_eq!(n, 4);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
