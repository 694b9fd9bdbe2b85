//! # Kestrel Storage
//!
//! Byte-level storage for the Kestrel persistence layer.
//!
//! Backends are **append-only byte stores**: they hand out the offset of
//! every appended slice and read arbitrary ranges back. Record framing,
//! checksums and indexes all live in `kestrel_core`; nothing here knows
//! what the bytes mean.
//!
//! Besides the backends this crate carries the small set of filesystem
//! primitives the engine relies on for crash safety: replacing a file by
//! rename and fsyncing the directory that holds it.
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - a single OS file, optionally opened read-only
//! - [`InMemoryBackend`] - a shared in-process buffer for tests
//!
//! ## Example
//!
//! ```rust
//! use kestrel_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"kestrel").unwrap();
//! assert_eq!(backend.read_at(offset, 7).unwrap(), b"kestrel");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod fsops;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use fsops::{remove_file_if_exists, replace_file, sync_directory};
pub use memory::InMemoryBackend;
