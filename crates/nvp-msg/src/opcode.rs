//! Protocol command codes.

use serde::{Deserialize, Serialize};

use crate::MsgError;

/// NVP protocol command codes.
///
/// Requests and responses come in pairs; the numeric value of each variant
/// is its position in declaration order and is part of the wire contract.
/// `ErrorRsp` and `ShutdownRsp` exist only as responses.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Opcode {
    Noop = 0,
    OpenReq = 1,
    OpenRsp = 2,
    CloseReq = 3,
    CloseRsp = 4,
    ReadReq = 5,
    ReadRsp = 6,
    WriteReq = 7,
    WriteRsp = 8,
    FlushReq = 9,
    FlushRsp = 10,
    CreateVolumeReq = 11,
    CreateVolumeRsp = 12,
    RemoveVolumeReq = 13,
    RemoveVolumeRsp = 14,
    TruncateVolumeReq = 15,
    TruncateVolumeRsp = 16,
    StatVolumeReq = 17,
    StatVolumeRsp = 18,
    ListVolumesReq = 19,
    ListVolumesRsp = 20,
    ListSnapshotsReq = 21,
    ListSnapshotsRsp = 22,
    CreateSnapshotReq = 23,
    CreateSnapshotRsp = 24,
    DeleteSnapshotReq = 25,
    DeleteSnapshotRsp = 26,
    RollbackSnapshotReq = 27,
    RollbackSnapshotRsp = 28,
    IsSnapshotSyncedReq = 29,
    IsSnapshotSyncedRsp = 30,
    ListClusterNodeUriReq = 31,
    ListClusterNodeUriRsp = 32,
    GetVolumeUriReq = 33,
    GetVolumeUriRsp = 34,
    ErrorRsp = 35,
    ShutdownRsp = 36,
}

impl Opcode {
    /// The response opcode paired with this request, or `None` if this is
    /// not a request.
    pub fn response(self) -> Option<Opcode> {
        use Opcode::*;
        match self {
            OpenReq => Some(OpenRsp),
            CloseReq => Some(CloseRsp),
            ReadReq => Some(ReadRsp),
            WriteReq => Some(WriteRsp),
            FlushReq => Some(FlushRsp),
            CreateVolumeReq => Some(CreateVolumeRsp),
            RemoveVolumeReq => Some(RemoveVolumeRsp),
            TruncateVolumeReq => Some(TruncateVolumeRsp),
            StatVolumeReq => Some(StatVolumeRsp),
            ListVolumesReq => Some(ListVolumesRsp),
            ListSnapshotsReq => Some(ListSnapshotsRsp),
            CreateSnapshotReq => Some(CreateSnapshotRsp),
            DeleteSnapshotReq => Some(DeleteSnapshotRsp),
            RollbackSnapshotReq => Some(RollbackSnapshotRsp),
            IsSnapshotSyncedReq => Some(IsSnapshotSyncedRsp),
            ListClusterNodeUriReq => Some(ListClusterNodeUriRsp),
            GetVolumeUriReq => Some(GetVolumeUriRsp),
            _ => None,
        }
    }

    /// Whether this opcode names a request.
    pub fn is_request(self) -> bool {
        self.response().is_some()
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

impl TryFrom<u8> for Opcode {
    type Error = MsgError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Opcode::*;
        let op = match value {
            0 => Noop,
            1 => OpenReq,
            2 => OpenRsp,
            3 => CloseReq,
            4 => CloseRsp,
            5 => ReadReq,
            6 => ReadRsp,
            7 => WriteReq,
            8 => WriteRsp,
            9 => FlushReq,
            10 => FlushRsp,
            11 => CreateVolumeReq,
            12 => CreateVolumeRsp,
            13 => RemoveVolumeReq,
            14 => RemoveVolumeRsp,
            15 => TruncateVolumeReq,
            16 => TruncateVolumeRsp,
            17 => StatVolumeReq,
            18 => StatVolumeRsp,
            19 => ListVolumesReq,
            20 => ListVolumesRsp,
            21 => ListSnapshotsReq,
            22 => ListSnapshotsRsp,
            23 => CreateSnapshotReq,
            24 => CreateSnapshotRsp,
            25 => DeleteSnapshotReq,
            26 => DeleteSnapshotRsp,
            27 => RollbackSnapshotReq,
            28 => RollbackSnapshotRsp,
            29 => IsSnapshotSyncedReq,
            30 => IsSnapshotSyncedRsp,
            31 => ListClusterNodeUriReq,
            32 => ListClusterNodeUriRsp,
            33 => GetVolumeUriReq,
            34 => GetVolumeUriRsp,
            35 => ErrorRsp,
            36 => ShutdownRsp,
            other => return Err(MsgError::UnknownOpcode(other)),
        };
        Ok(op)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({:#04x})", self, *self as u8)
    }
}
