//! Storage backend over a single OS file.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// A backend that appends to one file on disk.
///
/// Reads are positional and serialized through an internal mutex, so a
/// backend may be shared by readers while the owner appends. The cached
/// length is the source of truth for `len()`; it is initialised from the
/// file metadata when the file is opened.
///
/// # Example
///
/// ```no_run
/// use kestrel_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("products_0.catalog")).unwrap();
/// backend.append(b"record").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: Mutex<File>,
    len: u64,
    read_only: bool,
}

impl FileBackend {
    /// Opens the file at `path` for appending, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::from_file(path, file, false)
    }

    /// Creates a brand new file, failing if one already exists.
    ///
    /// # Errors
    ///
    /// Returns an I/O error of kind `AlreadyExists` if the path is taken.
    pub fn create_new(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Self::from_file(path, file, false)
    }

    /// Opens an existing file for appending.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when the file does not exist.
    pub fn open_existing(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| not_found_or_io(path, e))?;
        Self::from_file(path, file, false)
    }

    /// Opens an existing file that will only ever be read.
    ///
    /// Used for historical generations and offline inspection; appends and
    /// truncation are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when the file does not exist.
    pub fn open_read_only(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| not_found_or_io(path, e))?;
        Self::from_file(path, file, true)
    }

    fn from_file(path: &Path, file: File, read_only: bool) -> StorageResult<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            len,
            read_only,
        })
    }

    /// Returns the path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` if this backend rejects writes.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn ensure_writable(&self) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly {
                description: self.describe(),
            });
        }
        Ok(())
    }
}

fn not_found_or_io(path: &Path, err: io::Error) -> StorageError {
    if err.kind() == io::ErrorKind::NotFound {
        StorageError::NotFound {
            path: path.to_path_buf(),
        }
    } else {
        StorageError::Io(err)
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let end = offset.saturating_add(len as u64);
        if end > self.len {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: self.len,
            });
        }
        let mut buffer = vec![0u8; len];
        if len == 0 {
            return Ok(buffer);
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.ensure_writable()?;
        let offset = self.len;
        if data.is_empty() {
            return Ok(offset);
        }

        let file = self.file.get_mut();
        file.seek(SeekFrom::Start(offset))?;
        if let Err(err) = file.write_all(data) {
            // A partial write leaves garbage past `len`; drop it so the next
            // append starts at a record boundary again.
            if let Err(rollback) = file.set_len(offset) {
                warn!(
                    path = %self.path.display(),
                    offset,
                    error = %rollback,
                    "failed to cut back partial write"
                );
            }
            return Err(err.into());
        }
        self.len += data.len() as u64;
        Ok(offset)
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.read_only {
            return Ok(());
        }
        let file = self.file.get_mut();
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_len: u64) -> StorageResult<()> {
        self.ensure_writable()?;
        if new_len > self.len {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_len,
                size: self.len,
            });
        }
        let file = self.file.get_mut();
        file.set_len(new_len)?;
        file.sync_all()?;
        self.len = new_len;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");

        let backend = FileBackend::open(&path).unwrap();
        assert!(backend.is_empty());
        assert!(path.exists());
    }

    #[test]
    fn append_returns_offsets() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("data.bin")).unwrap();

        assert_eq!(backend.append(b"abc").unwrap(), 0);
        assert_eq!(backend.append(b"defgh").unwrap(), 3);
        assert_eq!(backend.len(), 8);
        assert_eq!(backend.read_at(3, 5).unwrap(), b"defgh");
    }

    #[test]
    fn read_past_end_fails() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("data.bin")).unwrap();
        backend.append(b"abc").unwrap();

        assert!(matches!(
            backend.read_at(2, 4),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn contents_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"durable").unwrap();
            backend.sync().unwrap();
        }
        let backend = FileBackend::open_existing(&path).unwrap();
        assert_eq!(backend.len(), 7);
        assert_eq!(backend.read_at(0, 7).unwrap(), b"durable");
    }

    #[test]
    fn open_existing_reports_missing_file() {
        let dir = tempdir().unwrap();
        let result = FileBackend::open_existing(&dir.path().join("absent.bin"));
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[test]
    fn create_new_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        FileBackend::create_new(&path).unwrap();
        assert!(FileBackend::create_new(&path).is_err());
    }

    #[test]
    fn read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        FileBackend::open(&path).unwrap().append(b"x").unwrap();

        let mut backend = FileBackend::open_read_only(&path).unwrap();
        assert!(backend.is_read_only());
        assert!(matches!(
            backend.append(b"y"),
            Err(StorageError::ReadOnly { .. })
        ));
        assert!(matches!(
            backend.truncate(0),
            Err(StorageError::ReadOnly { .. })
        ));
        assert_eq!(backend.read_at(0, 1).unwrap(), b"x");
    }

    #[test]
    fn failed_write_keeps_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"head").unwrap();
        // writable as far as the backend knows, read-only for the OS
        let file = OpenOptions::new().read(true).open(&path).unwrap();
        let mut backend = FileBackend::from_file(&path, file, false).unwrap();

        assert!(matches!(backend.append(b"tail"), Err(StorageError::Io(_))));
        assert_eq!(backend.len(), 4);
        assert_eq!(backend.read_at(0, 4).unwrap(), b"head");
        assert_eq!(std::fs::read(&path).unwrap(), b"head");
    }

    #[test]
    fn truncate_drops_tail_and_appends_continue() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("data.bin")).unwrap();
        backend.append(b"keep-torn").unwrap();

        backend.truncate(4).unwrap();
        assert_eq!(backend.len(), 4);
        assert_eq!(backend.append(b"!").unwrap(), 4);
        assert_eq!(backend.read_at(0, 5).unwrap(), b"keep!");
        assert!(matches!(
            backend.truncate(100),
            Err(StorageError::TruncateBeyondEnd { .. })
        ));
    }
}
