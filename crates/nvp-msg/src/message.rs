//! The protocol message header.

use serde::{Deserialize, Serialize};

use crate::{Opcode, Result};

/// The NVP message header, carried in the header iovec of every request and
/// response.
///
/// Serialized as a msgpack array with the fields in declaration order:
/// `(opcode, volume_name, snapshot_name, size, offset, retval, errval,
/// opaque, timeout)`. Bulk data never travels here; it goes in the separate
/// data iovec of the enclosing frame.
///
/// `opaque` is chosen by the sender, never inspected by the receiver and
/// returned verbatim in the paired response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub opcode: Opcode,
    pub volume_name: String,
    pub snapshot_name: String,
    pub size: u64,
    pub offset: u64,
    pub retval: i64,
    pub errval: i32,
    pub opaque: u64,
    pub timeout: i64,
}

impl Default for Message {
    fn default() -> Self {
        Message {
            opcode: Opcode::Noop,
            volume_name: String::new(),
            snapshot_name: String::new(),
            size: 0,
            offset: 0,
            retval: 0,
            errval: 0,
            opaque: 0,
            timeout: 0,
        }
    }
}

impl Message {
    /// A blank message with the given opcode; request fields default to zero.
    pub fn new(opcode: Opcode) -> Self {
        Message {
            opcode,
            ..Default::default()
        }
    }

    /// Packs the header into its msgpack representation.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Unpacks a header; fails with [`MsgError`](crate::MsgError) if the
    /// bytes do not decode or the opcode is unknown.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(buf)?)
    }

    pub fn open_req(volume_name: &str, opaque: u64) -> Self {
        Message {
            opcode: Opcode::OpenReq,
            volume_name: volume_name.to_owned(),
            opaque,
            ..Default::default()
        }
    }

    pub fn close_req(opaque: u64) -> Self {
        Message {
            opcode: Opcode::CloseReq,
            opaque,
            ..Default::default()
        }
    }

    pub fn read_req(size: u64, offset: u64, opaque: u64) -> Self {
        Message {
            opcode: Opcode::ReadReq,
            size,
            offset,
            opaque,
            ..Default::default()
        }
    }

    pub fn write_req(size: u64, offset: u64, opaque: u64) -> Self {
        Message {
            opcode: Opcode::WriteReq,
            size,
            offset,
            opaque,
            ..Default::default()
        }
    }

    pub fn flush_req(opaque: u64) -> Self {
        Message {
            opcode: Opcode::FlushReq,
            opaque,
            ..Default::default()
        }
    }

    pub fn create_volume_req(volume_name: &str, size: u64, opaque: u64) -> Self {
        Message {
            opcode: Opcode::CreateVolumeReq,
            volume_name: volume_name.to_owned(),
            size,
            opaque,
            ..Default::default()
        }
    }

    pub fn remove_volume_req(volume_name: &str, opaque: u64) -> Self {
        Message {
            opcode: Opcode::RemoveVolumeReq,
            volume_name: volume_name.to_owned(),
            opaque,
            ..Default::default()
        }
    }

    pub fn truncate_volume_req(volume_name: &str, size: u64, opaque: u64) -> Self {
        Message {
            opcode: Opcode::TruncateVolumeReq,
            volume_name: volume_name.to_owned(),
            size,
            opaque,
            ..Default::default()
        }
    }

    pub fn stat_volume_req(volume_name: &str, opaque: u64) -> Self {
        Message {
            opcode: Opcode::StatVolumeReq,
            volume_name: volume_name.to_owned(),
            opaque,
            ..Default::default()
        }
    }

    pub fn list_volumes_req(opaque: u64) -> Self {
        Message {
            opcode: Opcode::ListVolumesReq,
            opaque,
            ..Default::default()
        }
    }

    pub fn list_snapshots_req(volume_name: &str, opaque: u64) -> Self {
        Message {
            opcode: Opcode::ListSnapshotsReq,
            volume_name: volume_name.to_owned(),
            opaque,
            ..Default::default()
        }
    }

    pub fn create_snapshot_req(
        volume_name: &str,
        snapshot_name: &str,
        timeout: i64,
        opaque: u64,
    ) -> Self {
        Message {
            opcode: Opcode::CreateSnapshotReq,
            volume_name: volume_name.to_owned(),
            snapshot_name: snapshot_name.to_owned(),
            timeout,
            opaque,
            ..Default::default()
        }
    }

    pub fn delete_snapshot_req(volume_name: &str, snapshot_name: &str, opaque: u64) -> Self {
        Message {
            opcode: Opcode::DeleteSnapshotReq,
            volume_name: volume_name.to_owned(),
            snapshot_name: snapshot_name.to_owned(),
            opaque,
            ..Default::default()
        }
    }

    pub fn rollback_snapshot_req(volume_name: &str, snapshot_name: &str, opaque: u64) -> Self {
        Message {
            opcode: Opcode::RollbackSnapshotReq,
            volume_name: volume_name.to_owned(),
            snapshot_name: snapshot_name.to_owned(),
            opaque,
            ..Default::default()
        }
    }

    pub fn is_snapshot_synced_req(volume_name: &str, snapshot_name: &str, opaque: u64) -> Self {
        Message {
            opcode: Opcode::IsSnapshotSyncedReq,
            volume_name: volume_name.to_owned(),
            snapshot_name: snapshot_name.to_owned(),
            opaque,
            ..Default::default()
        }
    }

    pub fn list_cluster_node_uri_req(opaque: u64) -> Self {
        Message {
            opcode: Opcode::ListClusterNodeUriReq,
            opaque,
            ..Default::default()
        }
    }

    pub fn get_volume_uri_req(volume_name: &str, opaque: u64) -> Self {
        Message {
            opcode: Opcode::GetVolumeUriReq,
            volume_name: volume_name.to_owned(),
            opaque,
            ..Default::default()
        }
    }

    /// The response sent when a request cannot be understood or dispatched.
    pub fn error_rsp(errval: i32, opaque: u64) -> Self {
        Message {
            opcode: Opcode::ErrorRsp,
            retval: -1,
            errval,
            opaque,
            ..Default::default()
        }
    }
}
