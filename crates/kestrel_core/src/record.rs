//! Storage record framing.
//!
//! Every file Kestrel writes is a sequence of storage records:
//!
//! ```text
//! ┌──────────┬─────────┬────────────────┬────────────┬─────────────┐
//! │ len: u32 │ ctl: u8 │ generation:u64 │ crc32c:u32 │ payload ... │
//! └──────────┴─────────┴────────────────┴────────────┴─────────────┘
//! ```
//!
//! All integers are little endian. `len` covers the whole record including
//! itself. The checksum covers the control byte, the generation and the
//! payload. The generation is the catalog version that wrote the record.

use crate::error::{CoreError, CoreResult};
use crate::types::FileLocation;
use kestrel_storage::StorageBackend;

/// Control bits of a storage record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordControl(u8);

impl RecordControl {
    /// Plain data record.
    pub const NONE: Self = Self(0);
    /// The record is the last one written for its transaction.
    pub const CLOSES_TRANSACTION: Self = Self(0x01);
    /// Header record addressed by location rather than by key.
    pub const ROOT: Self = Self(0x02);
    /// Offset index chunk written by a flush.
    pub const INDEX: Self = Self(0x04);
    /// The checksum field holds a CRC32C that must be verified.
    pub const CHECKSUMMED: Self = Self(0x08);

    /// Creates control bits from a raw byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Self {
        Self(b)
    }

    /// Returns the raw byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the union of both bit sets.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// One framed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRecord {
    /// Control bits.
    pub control: RecordControl,
    /// Catalog version that produced the record.
    pub generation: u64,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

impl StorageRecord {
    /// Size of the fixed header: len (4) + control (1) + generation (8) + crc (4).
    pub const HEADER_SIZE: usize = 17;

    /// Creates a record.
    #[must_use]
    pub fn new(control: RecordControl, generation: u64, payload: Vec<u8>) -> Self {
        Self {
            control,
            generation,
            payload,
        }
    }

    /// Encoded size of a record carrying `payload_len` bytes.
    #[must_use]
    pub const fn encoded_len(payload_len: usize) -> usize {
        Self::HEADER_SIZE + payload_len
    }

    /// Encodes the record, computing the checksum when `checksummed` is set.
    ///
    /// # Errors
    ///
    /// Fails if the payload does not fit the 32-bit length field.
    pub fn encode(&self, checksummed: bool) -> CoreResult<Vec<u8>> {
        let total = Self::encoded_len(self.payload.len());
        let length = u32::try_from(total).map_err(|_| {
            CoreError::invalid_operation(format!("record of {total} bytes exceeds u32 length"))
        })?;
        let control = if checksummed {
            self.control.with(RecordControl::CHECKSUMMED)
        } else {
            RecordControl::from_byte(self.control.as_byte() & !RecordControl::CHECKSUMMED.0)
        };

        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&length.to_le_bytes());
        buf.push(control.as_byte());
        buf.extend_from_slice(&self.generation.to_le_bytes());
        let crc = if checksummed {
            checksum(&buf[4..13], &self.payload)
        } else {
            0
        };
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes exactly one record from `data`.
    ///
    /// `source` and `location` only feed error messages. With
    /// `require_checksum` set, a record without the checksum bit is refused.
    /// An unchecksummed record must carry a zero checksum field.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptedRecord`] for truncated or inconsistent
    /// framing and [`CoreError::ChecksumMismatch`] when the CRC32C differs.
    pub fn decode(
        data: &[u8],
        source: &str,
        location: FileLocation,
        require_checksum: bool,
    ) -> CoreResult<Self> {
        if data.len() < Self::HEADER_SIZE {
            return Err(CoreError::corrupted(
                source,
                Some(location),
                format!("record shorter than header: {} bytes", data.len()),
            ));
        }
        let length = read_u32(data, 0) as usize;
        if length != data.len() {
            return Err(CoreError::corrupted(
                source,
                Some(location),
                format!("length field {length} does not match {} bytes read", data.len()),
            ));
        }
        let control = RecordControl::from_byte(data[4]);
        let generation = read_u64(data, 5);
        let stored_crc = read_u32(data, 13);
        let payload = &data[Self::HEADER_SIZE..];

        if control.contains(RecordControl::CHECKSUMMED) {
            let computed = checksum(&data[4..13], payload);
            if computed != stored_crc {
                return Err(CoreError::ChecksumMismatch {
                    file: source.to_string(),
                    location,
                    expected: stored_crc,
                    actual: computed,
                });
            }
        } else if require_checksum {
            return Err(CoreError::corrupted(
                source,
                Some(location),
                "record carries no checksum",
            ));
        } else if stored_crc != 0 {
            return Err(CoreError::corrupted(
                source,
                Some(location),
                format!("unchecksummed record has checksum field {stored_crc:#010x}"),
            ));
        }

        Ok(Self {
            control,
            generation,
            payload: payload.to_vec(),
        })
    }

    /// Reads and decodes the record at `location`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, truncation or checksum mismatch.
    pub fn read(
        backend: &dyn StorageBackend,
        location: FileLocation,
        require_checksum: bool,
    ) -> CoreResult<Self> {
        if location.end() > backend.len() {
            return Err(CoreError::corrupted(
                backend.describe(),
                Some(location),
                format!("record extends past end of file ({} bytes)", backend.len()),
            ));
        }
        let data = backend.read_at(location.start, location.length as usize)?;
        Self::decode(&data, &backend.describe(), location, require_checksum)
    }
}

fn checksum(head: &[u8], payload: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(head), payload)
}

pub(crate) fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(bytes)
}

pub(crate) fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Appends a record to a backend and returns where it landed.
///
/// # Errors
///
/// Fails if encoding or the append fails. Earlier records are untouched.
pub fn append_record(
    backend: &mut dyn StorageBackend,
    record: &StorageRecord,
    checksummed: bool,
) -> CoreResult<FileLocation> {
    let bytes = record.encode(checksummed)?;
    let start = backend.append(&bytes)?;
    Ok(FileLocation::new(start, bytes.len() as u32))
}

/// Sequential reader over the records of a file.
///
/// The scan stops quietly at a torn tail: an incomplete header, a length
/// that runs past the end, or a checksum failure on the very last record.
/// A checksum failure anywhere else is reported as an error, since records
/// that were followed by further writes must have been complete.
///
/// Records without a checksum are refused unless
/// [`require_checksum`](Self::require_checksum) is turned off.
pub struct RecordScanner<'a> {
    backend: &'a dyn StorageBackend,
    offset: u64,
    end: u64,
    require_checksum: bool,
    torn_tail: bool,
    failed: bool,
}

impl<'a> RecordScanner<'a> {
    /// Scans `[from, end)` of the backend.
    #[must_use]
    pub fn new(backend: &'a dyn StorageBackend, from: u64, end: u64) -> Self {
        Self {
            backend,
            offset: from,
            end: end.min(backend.len()),
            require_checksum: true,
            torn_tail: false,
            failed: false,
        }
    }

    /// Scans the whole backend.
    #[must_use]
    pub fn full(backend: &'a dyn StorageBackend) -> Self {
        Self::new(backend, 0, backend.len())
    }

    /// Whether records without the checksum bit are refused.
    #[must_use]
    pub fn require_checksum(mut self, value: bool) -> Self {
        self.require_checksum = value;
        self
    }

    /// Offset just past the last complete record seen so far.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.offset
    }

    /// Returns `true` if the scan ended at an incomplete record.
    #[must_use]
    pub fn hit_torn_tail(&self) -> bool {
        self.torn_tail
    }

    fn next_record(&mut self) -> CoreResult<Option<(FileLocation, StorageRecord)>> {
        let remaining = self.end - self.offset;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < StorageRecord::HEADER_SIZE as u64 {
            self.torn_tail = true;
            return Ok(None);
        }
        let head = self.backend.read_at(self.offset, 4)?;
        let length = u64::from(read_u32(&head, 0));
        if length < StorageRecord::HEADER_SIZE as u64 || length > remaining {
            self.torn_tail = true;
            return Ok(None);
        }
        let location = FileLocation::new(self.offset, length as u32);
        match StorageRecord::read(self.backend, location, self.require_checksum) {
            Ok(record) => {
                self.offset = location.end();
                Ok(Some((location, record)))
            }
            Err(CoreError::ChecksumMismatch { .. } | CoreError::CorruptedRecord { .. })
                if location.end() == self.end =>
            {
                self.torn_tail = true;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

impl Iterator for RecordScanner<'_> {
    type Item = CoreResult<(FileLocation, StorageRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_record() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_storage::InMemoryBackend;

    fn sample() -> StorageRecord {
        StorageRecord::new(RecordControl::CLOSES_TRANSACTION, 7, b"payload".to_vec())
    }

    #[test]
    fn encode_layout() {
        let bytes = sample().encode(true).unwrap();
        assert_eq!(bytes.len(), StorageRecord::HEADER_SIZE + 7);
        assert_eq!(read_u32(&bytes, 0) as usize, bytes.len());
        assert_eq!(bytes[4], 0x01 | 0x08);
        assert_eq!(read_u64(&bytes, 5), 7);
        assert_eq!(&bytes[17..], b"payload");
    }

    #[test]
    fn decode_restores_record() {
        let bytes = sample().encode(true).unwrap();
        let location = FileLocation::new(0, bytes.len() as u32);
        let decoded = StorageRecord::decode(&bytes, "test", location, true).unwrap();
        assert_eq!(decoded.payload, b"payload");
        assert_eq!(decoded.generation, 7);
        assert!(decoded.control.contains(RecordControl::CLOSES_TRANSACTION));
        assert!(decoded.control.contains(RecordControl::CHECKSUMMED));
    }

    #[test]
    fn detect_corruption() {
        let mut bytes = sample().encode(true).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let location = FileLocation::new(0, bytes.len() as u32);
        let result = StorageRecord::decode(&bytes, "test", location, true);
        assert!(matches!(result, Err(CoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn unchecksummed_record_skips_verification() {
        let mut bytes = sample().encode(false).unwrap();
        assert_eq!(read_u32(&bytes, 13), 0);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let location = FileLocation::new(0, bytes.len() as u32);
        assert!(StorageRecord::decode(&bytes, "test", location, false).is_ok());
    }

    #[test]
    fn cleared_checksum_bit_is_refused_when_required() {
        let mut bytes = sample().encode(true).unwrap();
        bytes[4] &= !RecordControl::CHECKSUMMED.as_byte();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let location = FileLocation::new(0, bytes.len() as u32);
        assert!(matches!(
            StorageRecord::decode(&bytes, "test", location, true),
            Err(CoreError::CorruptedRecord { .. })
        ));
        // the stale CRC gives the flipped bit away even when not required
        assert!(matches!(
            StorageRecord::decode(&bytes, "test", location, false),
            Err(CoreError::CorruptedRecord { .. })
        ));
    }

    #[test]
    fn scanner_refuses_unchecksummed_records_in_the_middle() {
        let mut backend = InMemoryBackend::new();
        append_record(&mut backend, &sample(), false).unwrap();
        append_record(&mut backend, &sample(), true).unwrap();

        let results: Vec<_> = RecordScanner::full(&backend).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(CoreError::CorruptedRecord { .. })));

        let lenient: Vec<_> = RecordScanner::full(&backend)
            .require_checksum(false)
            .collect::<CoreResult<_>>()
            .unwrap();
        assert_eq!(lenient.len(), 2);
    }

    #[test]
    fn length_mismatch_is_corruption() {
        let bytes = sample().encode(true).unwrap();
        let location = FileLocation::new(0, 10);
        let result = StorageRecord::decode(&bytes[..10], "test", location, true);
        assert!(matches!(result, Err(CoreError::CorruptedRecord { .. })));
    }

    #[test]
    fn scanner_stops_at_torn_tail() {
        let mut backend = InMemoryBackend::new();
        for generation in 0..3 {
            let record = StorageRecord::new(RecordControl::NONE, generation, vec![1, 2, 3]);
            append_record(&mut backend, &record, true).unwrap();
        }
        let full = backend.len();
        backend.append(&[0x40, 0, 0]).unwrap();

        let mut scanner = RecordScanner::full(&backend);
        let generations: Vec<u64> = scanner
            .by_ref()
            .map(|item| item.unwrap().1.generation)
            .collect();
        assert_eq!(generations, vec![0, 1, 2]);
        assert!(scanner.hit_torn_tail());
        assert_eq!(scanner.valid_end(), full);
    }

    #[test]
    fn scanner_treats_damaged_last_record_as_torn() {
        let mut backend = InMemoryBackend::new();
        let first = append_record(&mut backend, &sample(), true).unwrap();
        append_record(&mut backend, &sample(), true).unwrap();
        backend.flip_byte(backend.len() as usize - 1);

        let mut scanner = RecordScanner::full(&backend);
        assert_eq!(scanner.by_ref().count(), 1);
        assert!(scanner.hit_torn_tail());
        assert_eq!(scanner.valid_end(), first.end());
    }

    #[test]
    fn scanner_reports_damage_in_the_middle() {
        let mut backend = InMemoryBackend::new();
        let first = append_record(&mut backend, &sample(), true).unwrap();
        append_record(&mut backend, &sample(), true).unwrap();
        backend.flip_byte(first.end() as usize - 1);

        let results: Vec<_> = RecordScanner::full(&backend).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(CoreError::ChecksumMismatch { .. })));
    }
}
