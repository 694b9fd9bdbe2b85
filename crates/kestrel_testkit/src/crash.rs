//! Crash and corruption simulation.
//!
//! Two tools are provided:
//!
//! 1. [`FaultyBackend`] wraps any backend and fails appends or syncs once a
//!    byte budget is spent, optionally leaving a torn partial write behind.
//! 2. File surgery helpers that damage a closed catalog directory the way a
//!    crash or bad disk would: cutting the tail of a file, flipping a byte,
//!    or freezing a copy of the directory in the middle of an operation.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kestrel_testkit::crash::{truncate_file_by, FaultyBackend};
//!
//! let (backend, switch) = FaultyBackend::new(Box::new(InMemoryBackend::new()));
//! switch.fail_after(64);
//! ```

use kestrel_storage::{StorageBackend, StorageError, StorageResult};
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Shared control over a [`FaultyBackend`].
#[derive(Debug)]
pub struct FaultSwitch {
    budget: AtomicU64,
    written: AtomicU64,
    torn_writes: AtomicBool,
    fail_sync: AtomicBool,
    tripped: AtomicBool,
}

impl Default for FaultSwitch {
    fn default() -> Self {
        Self {
            budget: AtomicU64::new(u64::MAX),
            written: AtomicU64::new(0),
            torn_writes: AtomicBool::new(true),
            fail_sync: AtomicBool::new(false),
            tripped: AtomicBool::new(false),
        }
    }
}

impl FaultSwitch {
    /// Fails every append once `bytes` more bytes have been written.
    pub fn fail_after(&self, bytes: u64) {
        let written = self.written.load(Ordering::SeqCst);
        self.budget.store(written.saturating_add(bytes), Ordering::SeqCst);
    }

    /// Whether an append crossing the budget writes its first part before
    /// failing. On by default.
    pub fn set_torn_writes(&self, torn: bool) {
        self.torn_writes.store(torn, Ordering::SeqCst);
    }

    /// Makes every sync fail.
    pub fn set_fail_sync(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::SeqCst);
    }

    /// Removes every fault.
    pub fn reset(&self) {
        self.budget.store(u64::MAX, Ordering::SeqCst);
        self.fail_sync.store(false, Ordering::SeqCst);
        self.tripped.store(false, Ordering::SeqCst);
    }

    /// Returns `true` once a fault was injected.
    #[must_use]
    pub fn has_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Bytes appended successfully or partially.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    fn injected(&self, what: &str) -> StorageError {
        self.tripped.store(true, Ordering::SeqCst);
        StorageError::Io(io::Error::other(format!("injected fault: {what}")))
    }
}

/// A backend that fails on command.
#[derive(Debug)]
pub struct FaultyBackend {
    inner: Box<dyn StorageBackend>,
    switch: Arc<FaultSwitch>,
}

impl FaultyBackend {
    /// Wraps `inner`; the returned switch controls the faults.
    #[must_use]
    pub fn new(inner: Box<dyn StorageBackend>) -> (Self, Arc<FaultSwitch>) {
        let switch = Arc::new(FaultSwitch::default());
        (
            Self {
                inner,
                switch: Arc::clone(&switch),
            },
            switch,
        )
    }
}

impl StorageBackend for FaultyBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let written = self.switch.written.load(Ordering::SeqCst);
        let budget = self.switch.budget.load(Ordering::SeqCst);
        let len = data.len() as u64;
        if written.saturating_add(len) <= budget {
            let offset = self.inner.append(data)?;
            self.switch.written.fetch_add(len, Ordering::SeqCst);
            return Ok(offset);
        }

        let partial = budget.saturating_sub(written) as usize;
        if partial > 0 && self.switch.torn_writes.load(Ordering::SeqCst) {
            self.inner.append(&data[..partial])?;
            self.switch
                .written
                .fetch_add(partial as u64, Ordering::SeqCst);
        }
        Err(self.switch.injected("append"))
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.switch.fail_sync.load(Ordering::SeqCst) {
            return Err(self.switch.injected("sync"));
        }
        self.inner.sync()
    }

    fn truncate(&mut self, new_len: u64) -> StorageResult<()> {
        self.inner.truncate(new_len)
    }

    fn describe(&self) -> String {
        format!("faulty({})", self.inner.describe())
    }
}

/// Cuts the last `bytes` bytes off a file. Returns the new length.
///
/// # Errors
///
/// Fails if the file cannot be opened or resized.
pub fn truncate_file_by(path: &Path, bytes: u64) -> io::Result<u64> {
    let file = OpenOptions::new().write(true).open(path)?;
    let len = file.metadata()?.len().saturating_sub(bytes);
    file.set_len(len)?;
    file.sync_all()?;
    Ok(len)
}

/// Inverts every bit of the byte at `offset`.
///
/// # Errors
///
/// Fails if the file is shorter than `offset + 1` or cannot be written.
pub fn corrupt_byte_at(path: &Path, offset: u64) -> io::Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut byte)?;
    byte[0] = !byte[0];
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&byte)?;
    file.sync_all()
}

/// Appends `bytes` to a file, as a writer that died before its header was
/// committed would leave them.
///
/// # Errors
///
/// Fails if the file cannot be opened or written.
pub fn append_garbage(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Copies every regular file of `source` into `target`, freezing the
/// directory as a crash at this moment would leave it.
///
/// The writer lock file is skipped.
///
/// # Errors
///
/// Fails if a file cannot be copied.
pub fn snapshot_dir(source: &Path, target: &Path) -> io::Result<usize> {
    fs::create_dir_all(target)?;
    let mut copied = 0;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() || entry.file_name() == "LOCK" {
            continue;
        }
        fs::copy(entry.path(), target.join(entry.file_name()))?;
        copied += 1;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_storage::InMemoryBackend;
    use tempfile::tempdir;

    #[test]
    fn test_fault_after_budget() {
        let (mut backend, switch) = FaultyBackend::new(Box::new(InMemoryBackend::new()));
        backend.append(b"0123").unwrap();
        switch.fail_after(2);
        assert!(backend.append(b"4567").is_err());
        assert!(switch.has_tripped());
        assert_eq!(backend.len(), 6);

        switch.reset();
        backend.append(b"89").unwrap();
        assert_eq!(backend.read_at(0, 8).unwrap(), b"01234589");
    }

    #[test]
    fn test_clean_failure_without_torn_write() {
        let (mut backend, switch) = FaultyBackend::new(Box::new(InMemoryBackend::new()));
        switch.set_torn_writes(false);
        switch.fail_after(3);
        assert!(backend.append(b"abcdef").is_err());
        assert_eq!(backend.len(), 0);
    }

    #[test]
    fn test_file_surgery() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("data");
        fs::write(&path, [0u8, 1, 2, 3]).unwrap();

        corrupt_byte_at(&path, 1).unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![0, 0xFE, 2, 3]);
        assert_eq!(truncate_file_by(&path, 3).unwrap(), 1);
        append_garbage(&path, b"zz").unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![0, b'z', b'z']);

        let copy = temp.path().join("copy");
        assert_eq!(snapshot_dir(temp.path(), &copy).unwrap(), 1);
        assert!(copy.join("data").exists());
    }
}
