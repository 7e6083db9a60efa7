//! The narrow interface the server consumes the volume router through.

use std::sync::Arc;

use thiserror::Error;

/// Failures reported by a [`VolumeBackend`]; the I/O handler maps these to
/// wire `errval` codes per operation.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("object not found")]
    NotFound,

    #[error("object already exists")]
    AlreadyExists,

    #[error("object still has children")]
    HasChildren,

    #[error("timed out syncing to the backend")]
    SyncTimeout,

    #[error("previous snapshot not yet on the backend")]
    PreviousSnapshotNotOnBackend,

    #[error("resource busy")]
    Busy,

    #[error("backend i/o failure: {0}")]
    Io(String),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// An open volume. Dropped to release; I/O is blocking and runs on the
/// server's worker pool.
pub trait VolumeIo: Send + Sync {
    /// Reads `buf.len()` bytes at `offset`, returning the count read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> BackendResult<usize>;

    /// Writes `data` at `offset`, returning the count written.
    fn write_at(&self, data: &[u8], offset: u64) -> BackendResult<usize>;

    /// Flushes buffered data (fsync without a full backend sync).
    fn fsync(&self) -> BackendResult<()>;
}

pub type VolumeHandle = Arc<dyn VolumeIo>;

/// The filesystem/router operations the protocol front-end needs; every
/// opcode maps onto exactly one of these.
pub trait VolumeBackend: Send + Sync + 'static {
    fn open(&self, volume_name: &str) -> BackendResult<VolumeHandle>;

    fn create_volume(&self, volume_name: &str, size: u64) -> BackendResult<()>;

    fn remove_volume(&self, volume_name: &str) -> BackendResult<()>;

    fn truncate_volume(&self, volume_name: &str, size: u64) -> BackendResult<()>;

    /// Volume size in bytes.
    fn stat_volume(&self, volume_name: &str) -> BackendResult<u64>;

    fn list_volumes(&self) -> BackendResult<Vec<String>>;

    /// Snapshot names plus the volume size in bytes.
    fn list_snapshots(&self, volume_name: &str) -> BackendResult<(Vec<String>, u64)>;

    fn create_snapshot(&self, volume_name: &str, snapshot_name: &str, timeout: i64)
    -> BackendResult<()>;

    fn delete_snapshot(&self, volume_name: &str, snapshot_name: &str) -> BackendResult<()>;

    fn rollback_snapshot(&self, volume_name: &str, snapshot_name: &str) -> BackendResult<()>;

    fn is_snapshot_synced(&self, volume_name: &str, snapshot_name: &str) -> BackendResult<bool>;

    /// URIs of every cluster node serving this backend.
    fn list_cluster_node_uris(&self) -> BackendResult<Vec<String>>;

    /// URI of the node currently hosting `volume_name`.
    fn get_volume_uri(&self, volume_name: &str) -> BackendResult<String>;
}
