//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: raft-kv hands it the blob encoded by raft-core's PersistentState
//! what: Persister trait, FileStorage implementation, InMemoryStorage for testing

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Durable storage for one replica's raft state.
///
/// The blob is opaque here; encoding is the consensus module's business.
/// A successful `save_raft_state` must be durable before it returns, and
/// must replace the previous blob as a whole.
pub trait Persister: Send {
    /// replace the persisted raft state
    fn save_raft_state(&mut self, state: &[u8]) -> io::Result<()>;

    /// load the persisted raft state (empty if nothing was ever saved)
    fn read_raft_state(&self) -> io::Result<Vec<u8>>;

    /// size in bytes of the persisted raft state
    fn raft_state_size(&self) -> usize;
}

impl<P: Persister + ?Sized> Persister for Box<P> {
    fn save_raft_state(&mut self, state: &[u8]) -> io::Result<()> {
        (**self).save_raft_state(state)
    }

    fn read_raft_state(&self) -> io::Result<Vec<u8>> {
        (**self).read_raft_state()
    }

    fn raft_state_size(&self) -> usize {
        (**self).raft_state_size()
    }
}

// -- file storage implementation --

const STATE_FILE: &str = "raft_state.bin";
const TEMP_FILE: &str = "raft_state.tmp";

/// file-based storage implementation using std::fs
///
/// keeps the whole blob in `raft_state.bin` inside its directory and
/// replaces it atomically (temp file, fsync, rename)
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
    /// size of the last blob written or found on open
    size: usize,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let size = match fs::metadata(dir.join(STATE_FILE)) {
            Ok(meta) => meta.len() as usize,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        Ok(Self { dir, size })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }
}

/// fsync a directory so a rename inside it survives a crash
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

impl Persister for FileStorage {
    fn save_raft_state(&mut self, state: &[u8]) -> io::Result<()> {
        // atomic write: write to temp file then rename
        let temp_path = self.dir.join(TEMP_FILE);
        let mut file = File::create(&temp_path)?;
        file.write_all(state)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.state_path())?;
        sync_dir(&self.dir)?;

        self.size = state.len();
        tracing::trace!(dir = %self.dir.display(), bytes = state.len(), "saved raft state");
        Ok(())
    }

    fn read_raft_state(&self) -> io::Result<Vec<u8>> {
        match fs::read(self.state_path()) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn raft_state_size(&self) -> usize {
        self.size
    }
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// stores all state in memory, no persistence across process restarts
#[derive(Debug, Default, Clone)]
pub struct InMemoryStorage {
    state: Vec<u8>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for InMemoryStorage {
    fn save_raft_state(&mut self, state: &[u8]) -> io::Result<()> {
        self.state = state.to_vec();
        Ok(())
    }

    fn read_raft_state(&self) -> io::Result<Vec<u8>> {
        Ok(self.state.clone())
    }

    fn raft_state_size(&self) -> usize {
        self.state.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn in_memory_storage_replaces_state() {
        let mut storage = InMemoryStorage::new();
        storage.save_raft_state(b"first").unwrap();
        storage.save_raft_state(b"second").unwrap();

        assert_eq!(storage.read_raft_state().unwrap(), b"second".to_vec());
        assert_eq!(storage.raft_state_size(), 6);
    }

    #[test]
    fn file_storage_starts_empty() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        assert!(storage.read_raft_state().unwrap().is_empty());
        assert_eq!(storage.raft_state_size(), 0);
    }

    #[test]
    fn file_storage_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.save_raft_state(b"state").unwrap();

        assert!(dir.path().join(STATE_FILE).exists());
        assert!(!dir.path().join(TEMP_FILE).exists());
    }

    #[cfg(unix)]
    #[test]
    fn directory_sync_errors_are_reported() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("gone");
        assert!(sync_dir(&missing).is_err());
        assert!(sync_dir(dir.path()).is_ok());
    }

    #[test]
    fn failed_save_is_an_error_and_keeps_the_old_size() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let mut storage = FileStorage::new(&data).unwrap();
        storage.save_raft_state(b"state").unwrap();
        fs::remove_dir_all(&data).unwrap();

        assert!(storage.save_raft_state(b"newer state").is_err());
        assert_eq!(storage.raft_state_size(), 5);
    }

    #[test]
    fn boxed_persister_delegates() {
        let mut storage: Box<dyn Persister> = Box::new(InMemoryStorage::new());
        storage.save_raft_state(b"abc").unwrap();
        assert_eq!(storage.raft_state_size(), 3);
    }
}
