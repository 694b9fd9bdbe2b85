//! Deferred removal of superseded files.
//!
//! When a file generation is replaced (compaction, rename, deletion of a
//! collection) readers pinned to older catalog versions may still read it.
//! The [`ObsoleteFileMaintainer`] queues the file together with the first
//! catalog version that no longer needs it and deletes it once no reader
//! can be below that version.
//!
//! ```text
//! retire(v5, a)  retire(v7, b)  retire(v9, c)
//!        │              │              │
//! ───────┴──────────────┴──────────────┴──────▶ catalog version
//!                          ▲
//!            consumers_left(v8): a and b are removed, c waits
//! ```
//!
//! The queue is ordered by version, so a purge stops at the first entry
//! that is still needed. In time-travel mode every generation is kept
//! until the bootstrap log is trimmed past it, since historical versions
//! stay addressable through the log. Files of the warm-up version have no
//! historical readers and are removed right away with
//! [`remove_immediately`](ObsoleteFileMaintainer::remove_immediately).

use crate::error::CoreResult;
use crate::observer::StorageObserver;
use crate::types::CatalogVersion;
use kestrel_storage::remove_file_if_exists;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Runs just before the file of a retired generation is deleted.
pub type RemovalCallback = Box<dyn FnOnce() + Send>;

/// A retired file waiting for its readers to go away.
pub struct PendingRemoval {
    /// First catalog version that no longer reads the file.
    pub catalog_version: CatalogVersion,
    /// File to delete.
    pub path: PathBuf,
    /// Releases in-memory handles of the generation.
    pub on_removal: Option<RemovalCallback>,
}

impl std::fmt::Debug for PendingRemoval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRemoval")
            .field("catalog_version", &self.catalog_version)
            .field("path", &self.path)
            .field("on_removal", &self.on_removal.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct MaintainerState {
    pending: VecDeque<PendingRemoval>,
    last_known_minimal_active_version: CatalogVersion,
    first_retained_bootstrap_version: CatalogVersion,
    purge_requested: bool,
    shutdown: bool,
}

impl MaintainerState {
    fn threshold(&self, time_travel: bool) -> CatalogVersion {
        if time_travel {
            self.last_known_minimal_active_version
                .min(self.first_retained_bootstrap_version)
        } else {
            self.last_known_minimal_active_version
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<MaintainerState>,
    wakeup: Condvar,
    observer: Arc<dyn StorageObserver>,
    time_travel: bool,
}

/// Queues retired files and deletes them once unreachable.
#[derive(Debug)]
pub struct ObsoleteFileMaintainer {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ObsoleteFileMaintainer {
    /// Creates a maintainer without a background worker; purges happen
    /// only through [`purge_obsolete_files`](Self::purge_obsolete_files).
    #[must_use]
    pub fn new(time_travel: bool, observer: Arc<dyn StorageObserver>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MaintainerState {
                    pending: VecDeque::new(),
                    last_known_minimal_active_version: CatalogVersion::WARM_UP,
                    first_retained_bootstrap_version: CatalogVersion::WARM_UP,
                    purge_requested: false,
                    shutdown: false,
                }),
                wakeup: Condvar::new(),
                observer,
                time_travel,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Creates a maintainer whose purges run on a background thread.
    ///
    /// # Errors
    ///
    /// Fails if the thread cannot be spawned.
    pub fn with_worker(time_travel: bool, observer: Arc<dyn StorageObserver>) -> CoreResult<Self> {
        let maintainer = Self::new(time_travel, observer);
        let shared = Arc::clone(&maintainer.shared);
        let handle = std::thread::Builder::new()
            .name("kestrel-obsolete-files".into())
            .spawn(move || run_worker(&shared))?;
        *maintainer.worker.lock() = Some(handle);
        Ok(maintainer)
    }

    /// Returns `true` if generations are kept until the bootstrap log is
    /// trimmed.
    #[must_use]
    pub fn is_time_travel(&self) -> bool {
        self.shared.time_travel
    }

    /// Queues `path` for removal once no reader is below `version`.
    pub fn retire(
        &self,
        version: CatalogVersion,
        path: impl Into<PathBuf>,
        on_removal: Option<RemovalCallback>,
    ) {
        let path = path.into();
        debug!(path = %path.display(), version = %version, "retired file");
        let mut state = self.shared.state.lock();
        let entry = PendingRemoval {
            catalog_version: version,
            path,
            on_removal,
        };
        let position = state
            .pending
            .partition_point(|pending| pending.catalog_version <= version);
        state.pending.insert(position, entry);
        if version <= state.threshold(self.shared.time_travel) {
            state.purge_requested = true;
            self.shared.wakeup.notify_one();
        }
    }

    /// Runs `on_removal` and deletes `path` right away.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be deleted.
    pub fn remove_immediately(
        &self,
        path: &Path,
        on_removal: Option<RemovalCallback>,
    ) -> CoreResult<()> {
        if let Some(callback) = on_removal {
            callback();
        }
        if remove_file_if_exists(path)? {
            info!(path = %path.display(), "removed warm-up file");
            self.shared
                .observer
                .obsolete_file_removed(path, CatalogVersion::WARM_UP);
        }
        Ok(())
    }

    /// Records that no reader below `min_version` remains and schedules a
    /// purge. The threshold never moves backwards.
    pub fn consumers_left(&self, min_version: CatalogVersion) {
        let mut state = self.shared.state.lock();
        if min_version > state.last_known_minimal_active_version {
            state.last_known_minimal_active_version = min_version;
        }
        state.purge_requested = true;
        self.shared.wakeup.notify_one();
    }

    /// Records the oldest version the bootstrap log still addresses.
    pub fn bootstrap_trimmed(&self, first_retained: CatalogVersion) {
        let mut state = self.shared.state.lock();
        if first_retained > state.first_retained_bootstrap_version {
            state.first_retained_bootstrap_version = first_retained;
        }
        state.purge_requested = true;
        self.shared.wakeup.notify_one();
    }

    /// Current minimal active version.
    #[must_use]
    pub fn last_known_minimal_active_version(&self) -> CatalogVersion {
        self.shared.state.lock().last_known_minimal_active_version
    }

    /// Number of queued files.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Versions and paths of the queued files, oldest first.
    #[must_use]
    pub fn pending(&self) -> Vec<(CatalogVersion, PathBuf)> {
        self.shared
            .state
            .lock()
            .pending
            .iter()
            .map(|entry| (entry.catalog_version, entry.path.clone()))
            .collect()
    }

    /// Deletes every queued file no reader can reach. Returns how many were
    /// deleted.
    ///
    /// Failed deletions are logged and stay queued. Running it again is
    /// harmless.
    pub fn purge_obsolete_files(&self) -> usize {
        purge(&self.shared)
    }

    /// Stops the background worker, if any, after a final purge.
    pub fn shutdown(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            {
                let mut state = self.shared.state.lock();
                state.shutdown = true;
                self.shared.wakeup.notify_all();
            }
            if handle.join().is_err() {
                warn!("obsolete file worker panicked");
            }
        }
        purge(&self.shared);
    }
}

impl Drop for ObsoleteFileMaintainer {
    fn drop(&mut self) {
        let handle = self.worker.get_mut().take();
        if let Some(handle) = handle {
            self.shared.state.lock().shutdown = true;
            self.shared.wakeup.notify_all();
            let _ = handle.join();
        }
    }
}

fn run_worker(shared: &Shared) {
    loop {
        {
            let mut state = shared.state.lock();
            while !state.purge_requested && !state.shutdown {
                shared.wakeup.wait(&mut state);
            }
            if state.shutdown {
                return;
            }
            state.purge_requested = false;
        }
        purge(shared);
    }
}

fn purge(shared: &Shared) -> usize {
    let due: Vec<PendingRemoval> = {
        let mut state = shared.state.lock();
        let threshold = state.threshold(shared.time_travel);
        let count = state
            .pending
            .iter()
            .take_while(|entry| entry.catalog_version <= threshold)
            .count();
        state.pending.drain(..count).collect()
    };
    if due.is_empty() {
        return 0;
    }

    let mut removed = 0;
    let mut failed = Vec::new();
    for mut entry in due {
        if let Some(callback) = entry.on_removal.take() {
            callback();
        }
        match remove_file_if_exists(&entry.path) {
            Ok(existed) => {
                removed += 1;
                if existed {
                    info!(path = %entry.path.display(), version = %entry.catalog_version, "removed obsolete file");
                }
                shared
                    .observer
                    .obsolete_file_removed(&entry.path, entry.catalog_version);
            }
            Err(err) => {
                warn!(path = %entry.path.display(), error = %err, "failed to remove obsolete file, will retry");
                failed.push(entry);
            }
        }
    }

    if !failed.is_empty() {
        let mut state = shared.state.lock();
        for entry in failed.into_iter().rev() {
            state.pending.push_front(entry);
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn v(n: u64) -> CatalogVersion {
        CatalogVersion::new(n)
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"data").unwrap();
        path
    }

    #[test]
    fn removes_only_files_below_threshold() {
        let temp = tempdir().unwrap();
        let maintainer = ObsoleteFileMaintainer::new(false, Arc::new(NoopObserver));
        let a = touch(temp.path(), "a");
        let b = touch(temp.path(), "b");
        let c = touch(temp.path(), "c");
        maintainer.retire(v(7), &b, None);
        maintainer.retire(v(5), &a, None);
        maintainer.retire(v(9), &c, None);

        assert_eq!(maintainer.purge_obsolete_files(), 0);
        maintainer.consumers_left(v(8));
        assert_eq!(maintainer.purge_obsolete_files(), 2);
        assert!(!a.exists());
        assert!(!b.exists());
        assert!(c.exists());
        assert_eq!(maintainer.pending(), vec![(v(9), c.clone())]);

        assert_eq!(maintainer.purge_obsolete_files(), 0);
    }

    #[test]
    fn threshold_never_moves_back() {
        let maintainer = ObsoleteFileMaintainer::new(false, Arc::new(NoopObserver));
        maintainer.consumers_left(v(10));
        maintainer.consumers_left(v(3));
        assert_eq!(maintainer.last_known_minimal_active_version(), v(10));
    }

    #[test]
    fn callback_runs_before_removal() {
        let temp = tempdir().unwrap();
        let maintainer = ObsoleteFileMaintainer::new(false, Arc::new(NoopObserver));
        let path = touch(temp.path(), "gen");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let watched = path.clone();
        maintainer.retire(
            v(1),
            &path,
            Some(Box::new(move || {
                assert!(watched.exists());
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        );
        maintainer.consumers_left(v(1));
        maintainer.purge_obsolete_files();
        maintainer.purge_obsolete_files();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!path.exists());
    }

    #[test]
    fn time_travel_waits_for_bootstrap_trim() {
        let temp = tempdir().unwrap();
        let maintainer = ObsoleteFileMaintainer::new(true, Arc::new(NoopObserver));
        let path = touch(temp.path(), "old");
        maintainer.retire(v(4), &path, None);
        maintainer.consumers_left(v(20));
        assert_eq!(maintainer.purge_obsolete_files(), 0);
        assert!(path.exists());

        maintainer.bootstrap_trimmed(v(6));
        assert_eq!(maintainer.purge_obsolete_files(), 1);
        assert!(!path.exists());
    }

    #[test]
    fn missing_file_counts_as_removed() {
        let temp = tempdir().unwrap();
        let maintainer = ObsoleteFileMaintainer::new(false, Arc::new(NoopObserver));
        maintainer.retire(v(1), temp.path().join("gone"), None);
        maintainer.consumers_left(v(2));
        assert_eq!(maintainer.purge_obsolete_files(), 1);
        assert_eq!(maintainer.pending_count(), 0);
    }

    #[test]
    fn failed_removal_stays_queued() {
        let temp = tempdir().unwrap();
        let maintainer = ObsoleteFileMaintainer::new(false, Arc::new(NoopObserver));
        // A non-empty directory cannot be removed as a file.
        let blocker = temp.path().join("blocker");
        std::fs::create_dir(&blocker).unwrap();
        touch(&blocker, "inner");
        maintainer.retire(v(1), &blocker, None);
        maintainer.consumers_left(v(1));
        assert_eq!(maintainer.purge_obsolete_files(), 0);
        assert_eq!(maintainer.pending_count(), 1);
    }

    #[test]
    fn worker_purges_in_background() {
        let temp = tempdir().unwrap();
        let maintainer = ObsoleteFileMaintainer::with_worker(false, Arc::new(NoopObserver)).unwrap();
        let path = touch(temp.path(), "bg");
        maintainer.retire(v(2), &path, None);
        maintainer.consumers_left(v(3));

        let deadline = Instant::now() + Duration::from_secs(5);
        while path.exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!path.exists());
        maintainer.shutdown();
    }

    #[test]
    fn immediate_removal() {
        let temp = tempdir().unwrap();
        let maintainer = ObsoleteFileMaintainer::new(false, Arc::new(NoopObserver));
        let path = touch(temp.path(), "warm");
        maintainer.remove_immediately(&path, None).unwrap();
        maintainer.remove_immediately(&path, None).unwrap();
        assert!(!path.exists());
    }
}
