//! In-memory [`VolumeBackend`] used by tests and the demo server.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::backend::{BackendError, BackendResult, VolumeBackend, VolumeHandle, VolumeIo};

struct Snapshot {
    name: String,
    data: Vec<u8>,
}

struct VolumeState {
    data: Mutex<Vec<u8>>,
    snapshots: Mutex<Vec<Snapshot>>,
}

struct MemVolumeHandle {
    vol: Arc<VolumeState>,
}

impl VolumeIo for MemVolumeHandle {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> BackendResult<usize> {
        let data = self.vol.data.lock();
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| BackendError::Io("offset overflow".into()))?;
        if end > data.len() as u64 {
            return Err(BackendError::Io("read beyond end of volume".into()));
        }
        let offset = offset as usize;
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(buf.len())
    }

    fn write_at(&self, src: &[u8], offset: u64) -> BackendResult<usize> {
        let mut data = self.vol.data.lock();
        let end = offset
            .checked_add(src.len() as u64)
            .ok_or_else(|| BackendError::Io("offset overflow".into()))?;
        if end > data.len() as u64 {
            return Err(BackendError::Io("write beyond end of volume".into()));
        }
        let offset = offset as usize;
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(src.len())
    }

    fn fsync(&self) -> BackendResult<()> {
        Ok(())
    }
}

/// Volumes are zero-filled byte vectors; snapshots are full copies kept in
/// creation order and considered synced as soon as they exist.
pub struct MemBackend {
    volumes: RwLock<BTreeMap<String, Arc<VolumeState>>>,
    node_uri: RwLock<String>,
    cluster_uris: RwLock<Vec<String>>,
}

impl MemBackend {
    pub fn new(node_uri: &str) -> MemBackend {
        MemBackend {
            volumes: RwLock::new(BTreeMap::new()),
            node_uri: RwLock::new(node_uri.to_owned()),
            cluster_uris: RwLock::new(vec![node_uri.to_owned()]),
        }
    }

    /// Replaces the advertised node URI; servers bound to an ephemeral port
    /// call this once the port is known.
    pub fn set_node_uri(&self, uri: &str) {
        *self.node_uri.write() = uri.to_owned();
    }

    /// Replaces the advertised cluster node URI set.
    pub fn set_cluster_uris<S: AsRef<str>>(&self, uris: &[S]) {
        *self.cluster_uris.write() = uris.iter().map(|u| u.as_ref().to_owned()).collect();
    }

    fn volume(&self, name: &str) -> BackendResult<Arc<VolumeState>> {
        self.volumes
            .read()
            .get(name)
            .cloned()
            .ok_or(BackendError::NotFound)
    }
}

impl VolumeBackend for MemBackend {
    fn open(&self, volume_name: &str) -> BackendResult<VolumeHandle> {
        let vol = self.volume(volume_name)?;
        Ok(Arc::new(MemVolumeHandle { vol }))
    }

    fn create_volume(&self, volume_name: &str, size: u64) -> BackendResult<()> {
        let mut volumes = self.volumes.write();
        if volumes.contains_key(volume_name) {
            return Err(BackendError::AlreadyExists);
        }
        volumes.insert(
            volume_name.to_owned(),
            Arc::new(VolumeState {
                data: Mutex::new(vec![0; size as usize]),
                snapshots: Mutex::new(Vec::new()),
            }),
        );
        Ok(())
    }

    fn remove_volume(&self, volume_name: &str) -> BackendResult<()> {
        self.volumes
            .write()
            .remove(volume_name)
            .map(drop)
            .ok_or(BackendError::NotFound)
    }

    fn truncate_volume(&self, volume_name: &str, size: u64) -> BackendResult<()> {
        let vol = self.volume(volume_name)?;
        vol.data.lock().resize(size as usize, 0);
        Ok(())
    }

    fn stat_volume(&self, volume_name: &str) -> BackendResult<u64> {
        let vol = self.volume(volume_name)?;
        let len = vol.data.lock().len();
        Ok(len as u64)
    }

    fn list_volumes(&self) -> BackendResult<Vec<String>> {
        Ok(self.volumes.read().keys().cloned().collect())
    }

    fn list_snapshots(&self, volume_name: &str) -> BackendResult<(Vec<String>, u64)> {
        let vol = self.volume(volume_name)?;
        let names = vol.snapshots.lock().iter().map(|s| s.name.clone()).collect();
        let size = vol.data.lock().len() as u64;
        Ok((names, size))
    }

    fn create_snapshot(
        &self,
        volume_name: &str,
        snapshot_name: &str,
        _timeout: i64,
    ) -> BackendResult<()> {
        let vol = self.volume(volume_name)?;
        let data = vol.data.lock().clone();
        let mut snapshots = vol.snapshots.lock();
        if snapshots.iter().any(|s| s.name == snapshot_name) {
            return Err(BackendError::AlreadyExists);
        }
        snapshots.push(Snapshot {
            name: snapshot_name.to_owned(),
            data,
        });
        Ok(())
    }

    fn delete_snapshot(&self, volume_name: &str, snapshot_name: &str) -> BackendResult<()> {
        let vol = self.volume(volume_name)?;
        let mut snapshots = vol.snapshots.lock();
        let idx = snapshots
            .iter()
            .position(|s| s.name == snapshot_name)
            .ok_or(BackendError::NotFound)?;
        snapshots.remove(idx);
        Ok(())
    }

    fn rollback_snapshot(&self, volume_name: &str, snapshot_name: &str) -> BackendResult<()> {
        let vol = self.volume(volume_name)?;
        let mut snapshots = vol.snapshots.lock();
        let idx = snapshots
            .iter()
            .position(|s| s.name == snapshot_name)
            .ok_or(BackendError::NotFound)?;
        *vol.data.lock() = snapshots[idx].data.clone();
        // Rolling back discards everything newer than the target.
        snapshots.truncate(idx + 1);
        Ok(())
    }

    fn is_snapshot_synced(&self, volume_name: &str, snapshot_name: &str) -> BackendResult<bool> {
        let vol = self.volume(volume_name)?;
        let snapshots = vol.snapshots.lock();
        if snapshots.iter().any(|s| s.name == snapshot_name) {
            Ok(true)
        } else {
            Err(BackendError::NotFound)
        }
    }

    fn list_cluster_node_uris(&self) -> BackendResult<Vec<String>> {
        Ok(self.cluster_uris.read().clone())
    }

    fn get_volume_uri(&self, volume_name: &str) -> BackendResult<String> {
        self.volume(volume_name)?;
        Ok(self.node_uri.read().clone())
    }
}
