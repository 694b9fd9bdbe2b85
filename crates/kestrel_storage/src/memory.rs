//! In-memory storage backend for tests and scratch stores.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// A backend that keeps its bytes in a shared buffer.
///
/// Clones made with [`share`](Self::share) see the same buffer. Tests use
/// this to hand one handle to the engine and keep another to inspect or
/// damage the bytes afterwards, the way a crash would.
///
/// # Example
///
/// ```rust
/// use kestrel_storage::{InMemoryBackend, StorageBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let observer = backend.share();
/// backend.append(b"abc").unwrap();
/// assert_eq!(observer.bytes(), b"abc");
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    buffer: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend preloaded with `bytes`, as if read back from disk.
    #[must_use]
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            buffer: Arc::new(RwLock::new(bytes)),
        }
    }

    /// Returns another handle onto the same buffer.
    #[must_use]
    pub fn share(&self) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
        }
    }

    /// Returns a copy of the current contents.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.buffer.read().clone()
    }

    /// Overwrites one byte in place.
    ///
    /// Only meant for corruption tests; the engine itself never rewrites.
    pub fn flip_byte(&self, offset: usize) {
        if let Some(byte) = self.buffer.write().get_mut(offset) {
            *byte ^= 0xFF;
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let buffer = self.buffer.read();
        let size = buffer.len() as u64;
        let end = offset.saturating_add(len as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        let start = offset as usize;
        Ok(buffer[start..start + len].to_vec())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut buffer = self.buffer.write();
        let offset = buffer.len() as u64;
        buffer.extend_from_slice(data);
        Ok(offset)
    }

    fn len(&self) -> u64 {
        self.buffer.read().len() as u64
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_len: u64) -> StorageResult<()> {
        let mut buffer = self.buffer.write();
        let size = buffer.len() as u64;
        if new_len > size {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_len,
                size,
            });
        }
        buffer.truncate(new_len as usize);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("memory[{} bytes]", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn new_backend_is_empty() {
        let backend = InMemoryBackend::new();
        assert!(backend.is_empty());
        assert!(backend.bytes().is_empty());
    }

    #[test]
    fn shared_handles_see_appends() {
        let mut writer = InMemoryBackend::new();
        let reader = writer.share();

        writer.append(b"hello").unwrap();
        assert_eq!(reader.len(), 5);
        assert_eq!(reader.read_at(1, 3).unwrap(), b"ell");
    }

    #[test]
    fn read_extending_past_end_fails() {
        let backend = InMemoryBackend::with_bytes(b"hello".to_vec());
        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(backend.read_at(5, 0).unwrap().is_empty());
    }

    #[test]
    fn flip_byte_corrupts_in_place() {
        let backend = InMemoryBackend::with_bytes(vec![0x0F, 0x00]);
        backend.flip_byte(0);
        backend.flip_byte(99);
        assert_eq!(backend.bytes(), vec![0xF0, 0x00]);
    }

    #[test]
    fn truncate_rejects_growth() {
        let mut backend = InMemoryBackend::with_bytes(b"abc".to_vec());
        backend.truncate(1).unwrap();
        assert_eq!(backend.bytes(), b"a");
        assert!(backend.truncate(2).is_err());
    }

    proptest! {
        #[test]
        fn appended_chunks_read_back(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..20)) {
            let mut backend = InMemoryBackend::new();
            let offsets: Vec<u64> = chunks.iter().map(|c| backend.append(c).unwrap()).collect();
            for (chunk, offset) in chunks.iter().zip(offsets) {
                prop_assert_eq!(&backend.read_at(offset, chunk.len()).unwrap(), chunk);
            }
        }
    }
}
