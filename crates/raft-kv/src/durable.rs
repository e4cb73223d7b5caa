//! # durable
//!
//! why: make raft state durable off the async threads without reordering writes
//! relations: replica.rs stages blobs under its state lock and awaits them here before replying
//! what: StagedState, DurableWriter (versioned, retrying, blocking-pool writes)

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use raft_core::{LogIndex, RaftError, Term};
use raft_storage::Persister;
use tokio_util::sync::CancellationToken;

const RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// An encoded PersistentState, numbered in the order it was produced
#[derive(Clone)]
pub(crate) struct StagedState {
    pub version: u64,
    /// current_term and last log index captured in the blob
    pub term: Term,
    pub last_index: LogIndex,
    pub blob: Arc<Vec<u8>>,
}

struct Disk {
    persister: Box<dyn Persister>,
    /// version of the newest blob on disk
    written: u64,
}

enum WriteOutcome {
    Durable,
    Stopped,
    Failed(io::Error),
}

/// Serializes writes to the persister.
///
/// Blobs are staged under the replica's state lock, so a higher version
/// always reflects a later state. A blob older than what is already on disk
/// is skipped; the newer write covers it.
pub(crate) struct DurableWriter {
    disk: Arc<Mutex<Disk>>,
    /// mirror of `Disk::written`, readable without waiting on a save
    durable: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl DurableWriter {
    pub fn new(persister: Box<dyn Persister>, shutdown: CancellationToken) -> Self {
        Self {
            disk: Arc::new(Mutex::new(Disk {
                persister,
                written: 0,
            })),
            durable: Arc::new(AtomicU64::new(0)),
            shutdown,
        }
    }

    /// Load whatever was persisted before this process started
    pub fn read(&self) -> io::Result<Vec<u8>> {
        self.disk.lock().persister.read_raft_state()
    }

    pub fn size(&self) -> usize {
        self.disk.lock().persister.raft_state_size()
    }

    /// Version of the newest blob known to be on disk
    pub fn durable_version(&self) -> u64 {
        self.durable.load(Ordering::Acquire)
    }

    /// Wait until `staged` (or something newer) is durable.
    ///
    /// Failed writes are retried until they succeed or the replica stops.
    pub async fn write(&self, staged: StagedState) -> Result<(), RaftError> {
        loop {
            let disk = Arc::clone(&self.disk);
            let durable = Arc::clone(&self.durable);
            let shutdown = self.shutdown.clone();
            let blob = Arc::clone(&staged.blob);
            let version = staged.version;

            let outcome = tokio::task::spawn_blocking(move || {
                let mut disk = disk.lock();
                if disk.written >= version {
                    return WriteOutcome::Durable;
                }
                if shutdown.is_cancelled() {
                    return WriteOutcome::Stopped;
                }
                match disk.persister.save_raft_state(&blob) {
                    Ok(()) => {
                        disk.written = version;
                        durable.store(version, Ordering::Release);
                        WriteOutcome::Durable
                    }
                    Err(e) => WriteOutcome::Failed(e),
                }
            })
            .await
            .map_err(|e| RaftError::Persistence(e.to_string()))?;

            match outcome {
                WriteOutcome::Durable => return Ok(()),
                WriteOutcome::Stopped => return Err(RaftError::Stopped),
                WriteOutcome::Failed(e) => {
                    tracing::warn!(version, error = %e, "persisting raft state failed, retrying");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(RaftError::Stopped),
                _ = tokio::time::sleep(RETRY_BACKOFF) => {}
            }
        }
    }

    /// Wait for any write in progress; nothing new starts once stopped
    pub async fn drain(&self) {
        let disk = Arc::clone(&self.disk);
        let _ = tokio::task::spawn_blocking(move || drop(disk.lock())).await;
    }
}
