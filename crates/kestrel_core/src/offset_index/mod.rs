//! Offset-indexed record store.
//!
//! A record store is one append-only data file plus an in-memory map from
//! [`RecordKey`](crate::types::RecordKey) to the [`FileLocation`](crate::types::FileLocation)
//! of the newest record for that key.
//!
//! ## Write path
//!
//! 1. `put`/`remove` stage changes for the single open catalog version.
//!    Payloads stay in memory ("trapped") until they are spilled.
//! 2. `flush(version)` spills the remaining payloads, appends one index
//!    chunk describing every change and fsyncs. The result is a new
//!    [`OffsetIndexDescriptor`].
//! 3. The caller persists the descriptor inside a header; only then does
//!    the flush become part of a recoverable catalog version.
//!
//! ## Versioned reads
//!
//! Superseded locations are kept per key, tagged with the version that
//! replaced them, so a reader pinned to an older catalog version keeps
//! seeing the bytes that were current for it. `purge(version)` drops the
//! bookkeeping no remaining reader can reach.
//!
//! ## Recovery
//!
//! Index chunks link to their predecessor. Reopening walks the chain from
//! the descriptor's chunk and truncates anything written after the last
//! committed byte, which discards the tail of a crashed flush.

mod chunk;
mod descriptor;
mod store;

pub use chunk::IndexChunk;
pub use descriptor::{FileStatistics, OffsetIndexDescriptor};
pub use store::{read_root_record, RecordStore, RecordStoreOptions, KEY_PREFIX_SIZE};
