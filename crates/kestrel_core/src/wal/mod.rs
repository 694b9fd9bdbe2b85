//! Write-ahead log boundary.
//!
//! The storage layer does not interpret WAL contents. A transaction's
//! mutations arrive as an opaque blob and are appended to the active
//! segment `{catalog}_{index}.wal` as one storage record whose generation
//! is the transaction's catalog version. Segments rotate once they exceed
//! `max_wal_file_size`.
//!
//! ## Contract with the catalog
//!
//! - [`CatalogWal::append`] returns a [`WalFileReference`] the catalog
//!   stores in its next header
//! - a reference stays valid until a strictly later header supersedes it
//! - after a restart [`CatalogWal::committed_from`] replays every
//!   transaction newer than the header's version
//! - trimming the bootstrap log calls [`WalPurgeCallback::purge_up_to`],
//!   which drops segments no retained header can replay from
//!
//! ## Recovery policy
//!
//! A torn record at the end of the newest segment is a crash-time write and
//! is cut away on open. Damage anywhere else is fatal.
//!
//! [`WalFileReference`]: crate::header::WalFileReference

mod iterator;
mod record;
mod writer;

pub use iterator::WalReplay;
pub use record::WalEntry;
pub use writer::{CatalogWal, SegmentSummary, WalOptions, WalPurgeCallback};
