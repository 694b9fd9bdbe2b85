//! Index chunks: the per-flush delta of a record store's key map.
//!
//! Binary layout (little endian):
//!
//! ```text
//! previous_start: i64   (-1 when this is the first chunk)
//! previous_len:   u32
//! version:        u64
//! upsert_count:   u32
//!   record_type u8 | primary_key i64 | start u64 | length u32   (21 bytes each)
//! removal_count:  u32
//!   record_type u8 | primary_key i64                            (9 bytes each)
//! ```

use crate::error::{CoreError, CoreResult};
use crate::record::{read_u32, read_u64};
use crate::types::{CatalogVersion, FileLocation, RecordKey};

const FIXED_SIZE: usize = 8 + 4 + 8 + 4 + 4;
const UPSERT_SIZE: usize = 21;
const REMOVAL_SIZE: usize = 9;

/// Changes made to a record store by one flush.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexChunk {
    /// Chunk written by the previous flush.
    pub previous: Option<FileLocation>,
    /// Version of the flush.
    pub version: CatalogVersion,
    /// Keys whose newest record moved.
    pub upserts: Vec<(RecordKey, FileLocation)>,
    /// Keys that no longer exist.
    pub removals: Vec<RecordKey>,
}

impl IndexChunk {
    /// Encodes the chunk payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            FIXED_SIZE + self.upserts.len() * UPSERT_SIZE + self.removals.len() * REMOVAL_SIZE,
        );
        match self.previous {
            Some(location) => {
                buf.extend_from_slice(&(location.start as i64).to_le_bytes());
                buf.extend_from_slice(&location.length.to_le_bytes());
            }
            None => {
                buf.extend_from_slice(&(-1i64).to_le_bytes());
                buf.extend_from_slice(&0u32.to_le_bytes());
            }
        }
        buf.extend_from_slice(&self.version.as_u64().to_le_bytes());

        buf.extend_from_slice(&(self.upserts.len() as u32).to_le_bytes());
        for (key, location) in &self.upserts {
            buf.push(key.record_type);
            buf.extend_from_slice(&key.primary_key.to_le_bytes());
            buf.extend_from_slice(&location.start.to_le_bytes());
            buf.extend_from_slice(&location.length.to_le_bytes());
        }

        buf.extend_from_slice(&(self.removals.len() as u32).to_le_bytes());
        for key in &self.removals {
            buf.push(key.record_type);
            buf.extend_from_slice(&key.primary_key.to_le_bytes());
        }
        buf
    }

    /// Decodes a chunk payload.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptedRecord`] if the payload is truncated or
    /// has trailing bytes.
    pub fn decode(data: &[u8], source: &str) -> CoreResult<Self> {
        let corrupted = |message: &str| CoreError::corrupted(source, None, message.to_string());
        if data.len() < FIXED_SIZE {
            return Err(corrupted("index chunk shorter than fixed part"));
        }
        let previous_start = read_u64(data, 0) as i64;
        let previous_len = read_u32(data, 8);
        let previous = if previous_start < 0 {
            None
        } else {
            Some(FileLocation::new(previous_start as u64, previous_len))
        };
        let version = CatalogVersion::new(read_u64(data, 12));

        let mut at = 20;
        let upsert_count = read_u32(data, at) as usize;
        at += 4;
        let upserts_end = at + upsert_count * UPSERT_SIZE;
        if data.len() < upserts_end + 4 {
            return Err(corrupted("index chunk truncated in upserts"));
        }
        let mut upserts = Vec::with_capacity(upsert_count);
        while at < upserts_end {
            let key = RecordKey::new(data[at], read_u64(data, at + 1) as i64);
            let location = FileLocation::new(read_u64(data, at + 9), read_u32(data, at + 17));
            upserts.push((key, location));
            at += UPSERT_SIZE;
        }

        let removal_count = read_u32(data, at) as usize;
        at += 4;
        if data.len() != at + removal_count * REMOVAL_SIZE {
            return Err(corrupted("index chunk removal section has wrong length"));
        }
        let mut removals = Vec::with_capacity(removal_count);
        for _ in 0..removal_count {
            removals.push(RecordKey::new(data[at], read_u64(data, at + 1) as i64));
            at += REMOVAL_SIZE;
        }

        Ok(Self {
            previous,
            version,
            upserts,
            removals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_roundtrip() {
        let chunk = IndexChunk {
            previous: Some(FileLocation::new(120, 45)),
            version: CatalogVersion::new(9),
            upserts: vec![
                (RecordKey::new(16, -3), FileLocation::new(0, 30)),
                (RecordKey::new(17, i64::MAX), FileLocation::new(30, 60)),
            ],
            removals: vec![RecordKey::new(16, 4)],
        };
        let bytes = chunk.encode();
        assert_eq!(bytes.len(), FIXED_SIZE + 2 * UPSERT_SIZE + REMOVAL_SIZE);
        assert_eq!(IndexChunk::decode(&bytes, "test").unwrap(), chunk);
    }

    #[test]
    fn first_chunk_has_no_previous() {
        let chunk = IndexChunk::default();
        let decoded = IndexChunk::decode(&chunk.encode(), "test").unwrap();
        assert_eq!(decoded.previous, None);
    }

    #[test]
    fn truncated_chunk_is_rejected() {
        let chunk = IndexChunk {
            upserts: vec![(RecordKey::new(16, 1), FileLocation::new(0, 20))],
            ..IndexChunk::default()
        };
        let bytes = chunk.encode();
        assert!(IndexChunk::decode(&bytes[..bytes.len() - 5], "test").is_err());
    }
}
