//! Per-connection I/O handler: decodes a request, performs the backend
//! call and fills in the response.

use std::sync::Arc;

use bytes::Bytes;
use nvp_mempool::MemPool;
use nvp_msg::{Message, Opcode, errno, pack_names};
use nvp_transport::{DataBuf, Frame};
use parking_lot::Mutex;

use crate::backend::{BackendError, VolumeBackend, VolumeHandle};

/// A filled-in response: header plus optional data iovec. Pool-backed data
/// buffers ride along and return to their slab when the reply is dropped
/// after the send completes.
pub(crate) struct Reply {
    pub msg: Message,
    pub data: Option<DataBuf>,
}

impl Reply {
    fn new(msg: Message) -> Reply {
        Reply { msg, data: None }
    }

    fn with_data(msg: Message, data: impl Into<DataBuf>) -> Reply {
        Reply {
            msg,
            data: Some(data.into()),
        }
    }
}

struct OpenVolume {
    name: String,
    handle: VolumeHandle,
}

/// Session state: at most one open volume handle, plus the shared backend
/// and reply-buffer pool.
pub(crate) struct IoHandler {
    backend: Arc<dyn VolumeBackend>,
    pool: Arc<MemPool>,
    open: Mutex<Option<OpenVolume>>,
}

fn rsp(opcode: Opcode, opaque: u64) -> Message {
    Message {
        opcode,
        opaque,
        ..Default::default()
    }
}

fn fail(mut msg: Message, errval: i32) -> Reply {
    msg.retval = -1;
    msg.errval = errval;
    Reply::new(msg)
}

impl IoHandler {
    pub(crate) fn new(backend: Arc<dyn VolumeBackend>, pool: Arc<MemPool>) -> IoHandler {
        IoHandler {
            backend,
            pool,
            open: Mutex::new(None),
        }
    }

    /// Runs one decoded request to completion. Never panics on bad input;
    /// anything that cannot be dispatched produces an `ErrorRsp`.
    pub(crate) fn process_request(&self, frame: Frame) -> Reply {
        let msg = match Message::decode(&frame.header) {
            Ok(msg) => msg,
            Err(e) => {
                log::error!("cannot unpack message: {e}");
                return Reply::new(Message::error_rsp(errno::EBADMSG, 0));
            }
        };
        match msg.opcode {
            Opcode::OpenReq => self.handle_open(&msg),
            Opcode::CloseReq => self.handle_close(&msg),
            Opcode::ReadReq => self.handle_read(&msg),
            Opcode::WriteReq => self.handle_write(&msg, frame.data),
            Opcode::FlushReq => self.handle_flush(&msg),
            Opcode::CreateVolumeReq => self.handle_create_volume(&msg),
            Opcode::RemoveVolumeReq => self.handle_remove_volume(&msg),
            Opcode::TruncateVolumeReq => self.handle_truncate_volume(&msg),
            Opcode::StatVolumeReq => self.handle_stat_volume(&msg),
            Opcode::ListVolumesReq => self.handle_list_volumes(&msg),
            Opcode::ListSnapshotsReq => self.handle_list_snapshots(&msg),
            Opcode::CreateSnapshotReq => self.handle_create_snapshot(&msg),
            Opcode::DeleteSnapshotReq => self.handle_delete_snapshot(&msg),
            Opcode::RollbackSnapshotReq => self.handle_rollback_snapshot(&msg),
            Opcode::IsSnapshotSyncedReq => self.handle_is_snapshot_synced(&msg),
            Opcode::ListClusterNodeUriReq => self.handle_list_cluster_node_uri(&msg),
            Opcode::GetVolumeUriReq => self.handle_get_volume_uri(&msg),
            other => {
                log::error!("unknown command {other}");
                Reply::new(Message::error_rsp(errno::EIO, msg.opaque))
            }
        }
    }

    /// Control-plane operations require no volume to be open on the session.
    fn check_no_handle(&self, req: &Message) -> Option<Reply> {
        if self.open.lock().is_some() {
            log::error!(
                "session holds an open volume, rejecting {}",
                req.opcode
            );
            let paired = req.opcode.response().unwrap_or(Opcode::ErrorRsp);
            Some(fail(rsp(paired, req.opaque), errno::EIO))
        } else {
            None
        }
    }

    fn handle_open(&self, req: &Message) -> Reply {
        log::debug!("trying to open volume '{}'", req.volume_name);
        let msg = rsp(Opcode::OpenRsp, req.opaque);
        let mut open = self.open.lock();
        if open.is_some() {
            log::error!(
                "volume '{}' is already open for this session",
                req.volume_name
            );
            return fail(msg, errno::EIO);
        }
        match self.backend.open(&req.volume_name) {
            Ok(handle) => {
                *open = Some(OpenVolume {
                    name: req.volume_name.clone(),
                    handle,
                });
                Reply::new(msg)
            }
            Err(BackendError::NotFound) => {
                log::error!("volume '{}' doesn't exist", req.volume_name);
                fail(msg, errno::EACCES)
            }
            Err(e) => {
                log::error!("failed to open volume '{}': {e}", req.volume_name);
                fail(msg, errno::EIO)
            }
        }
    }

    fn handle_close(&self, req: &Message) -> Reply {
        let msg = rsp(Opcode::CloseRsp, req.opaque);
        match self.open.lock().take() {
            Some(open) => {
                log::debug!("closed volume '{}'", open.name);
                Reply::new(msg)
            }
            None => {
                log::error!("no open volume to close");
                fail(msg, errno::EIO)
            }
        }
    }

    fn open_handle(&self) -> Option<VolumeHandle> {
        self.open.lock().as_ref().map(|o| Arc::clone(&o.handle))
    }

    fn handle_read(&self, req: &Message) -> Reply {
        let mut msg = rsp(Opcode::ReadRsp, req.opaque);
        let Some(handle) = self.open_handle() else {
            return fail(msg, errno::EIO);
        };
        let size = req.size as usize;
        let Some(mut buf) = self.pool.alloc_or_heap(size) else {
            log::error!("cannot allocate requested buffer, size: {size}");
            return fail(msg, errno::ENOMEM);
        };
        match handle.read_at(buf.as_mut_slice(), req.offset) {
            Ok(n) => {
                msg.retval = n as i64;
                msg.size = req.size;
                msg.offset = req.offset;
                Reply::with_data(msg, buf)
            }
            Err(e) => {
                log::error!("read I/O error: {e}");
                fail(msg, errno::EIO)
            }
        }
    }

    fn handle_write(&self, req: &Message, data: Option<DataBuf>) -> Reply {
        let mut msg = rsp(Opcode::WriteRsp, req.opaque);
        let Some(handle) = self.open_handle() else {
            return fail(msg, errno::EIO);
        };
        let size = req.size as usize;
        let Some(data) = data else {
            log::error!("no data iovec, cannot proceed with write I/O");
            return fail(msg, errno::EIO);
        };
        if data.len() < size {
            log::error!("data buffer is smaller than the requested write size");
            return fail(msg, errno::EIO);
        }
        match handle.write_at(&data.as_slice()[..size], req.offset) {
            Ok(n) => {
                msg.retval = n as i64;
                msg.size = req.size;
                msg.offset = req.offset;
                Reply::new(msg)
            }
            Err(e) => {
                log::error!("write I/O error: {e}");
                fail(msg, errno::EIO)
            }
        }
    }

    fn handle_flush(&self, req: &Message) -> Reply {
        let msg = rsp(Opcode::FlushRsp, req.opaque);
        let Some(handle) = self.open_handle() else {
            return fail(msg, errno::EIO);
        };
        log::trace!("flushing");
        match handle.fsync() {
            Ok(()) => Reply::new(msg),
            Err(e) => {
                log::error!("flush I/O error: {e}");
                fail(msg, errno::EIO)
            }
        }
    }

    fn handle_create_volume(&self, req: &Message) -> Reply {
        if let Some(reply) = self.check_no_handle(req) {
            return reply;
        }
        let msg = rsp(Opcode::CreateVolumeRsp, req.opaque);
        match self.backend.create_volume(&req.volume_name, req.size) {
            Ok(()) => Reply::new(msg),
            Err(BackendError::AlreadyExists) => fail(msg, errno::EEXIST),
            Err(e) => {
                log::error!("problem creating volume '{}': {e}", req.volume_name);
                fail(msg, errno::EIO)
            }
        }
    }

    fn handle_remove_volume(&self, req: &Message) -> Reply {
        if let Some(reply) = self.check_no_handle(req) {
            return reply;
        }
        let msg = rsp(Opcode::RemoveVolumeRsp, req.opaque);
        match self.backend.remove_volume(&req.volume_name) {
            Ok(()) => Reply::new(msg),
            Err(BackendError::NotFound) => fail(msg, errno::ENOENT),
            Err(e) => {
                log::error!("problem removing volume '{}': {e}", req.volume_name);
                fail(msg, errno::EIO)
            }
        }
    }

    fn handle_truncate_volume(&self, req: &Message) -> Reply {
        if let Some(reply) = self.check_no_handle(req) {
            return reply;
        }
        let msg = rsp(Opcode::TruncateVolumeRsp, req.opaque);
        match self.backend.truncate_volume(&req.volume_name, req.size) {
            Ok(()) => Reply::new(msg),
            Err(BackendError::NotFound) => fail(msg, errno::ENOENT),
            Err(e) => {
                log::error!("problem truncating volume '{}': {e}", req.volume_name);
                fail(msg, errno::EIO)
            }
        }
    }

    fn handle_stat_volume(&self, req: &Message) -> Reply {
        if let Some(reply) = self.check_no_handle(req) {
            return reply;
        }
        let mut msg = rsp(Opcode::StatVolumeRsp, req.opaque);
        match self.backend.stat_volume(&req.volume_name) {
            Ok(size) => {
                msg.retval = size as i64;
                Reply::new(msg)
            }
            Err(BackendError::NotFound) => fail(msg, errno::ENOENT),
            Err(e) => {
                log::error!("problem statting volume '{}': {e}", req.volume_name);
                fail(msg, errno::EIO)
            }
        }
    }

    fn handle_list_volumes(&self, req: &Message) -> Reply {
        if let Some(reply) = self.check_no_handle(req) {
            return reply;
        }
        let mut msg = rsp(Opcode::ListVolumesRsp, req.opaque);
        match self.backend.list_volumes() {
            Ok(volumes) => {
                msg.retval = volumes.len() as i64;
                Reply::with_data(msg, Bytes::from(pack_names(&volumes)))
            }
            Err(e) => {
                log::error!("problem listing volumes: {e}");
                fail(msg, errno::EIO)
            }
        }
    }

    fn handle_list_snapshots(&self, req: &Message) -> Reply {
        if let Some(reply) = self.check_no_handle(req) {
            return reply;
        }
        let mut msg = rsp(Opcode::ListSnapshotsRsp, req.opaque);
        match self.backend.list_snapshots(&req.volume_name) {
            Ok((snapshots, volume_size)) => {
                msg.retval = snapshots.len() as i64;
                msg.size = volume_size;
                Reply::with_data(msg, Bytes::from(pack_names(&snapshots)))
            }
            Err(BackendError::NotFound) => fail(msg, errno::ENOENT),
            Err(e) => {
                log::error!(
                    "problem listing snapshots for volume '{}': {e}",
                    req.volume_name
                );
                fail(msg, errno::EIO)
            }
        }
    }

    fn handle_create_snapshot(&self, req: &Message) -> Reply {
        if let Some(reply) = self.check_no_handle(req) {
            return reply;
        }
        let msg = rsp(Opcode::CreateSnapshotRsp, req.opaque);
        match self
            .backend
            .create_snapshot(&req.volume_name, &req.snapshot_name, req.timeout)
        {
            Ok(()) => Reply::new(msg),
            Err(BackendError::NotFound) => fail(msg, errno::ENOENT),
            Err(BackendError::AlreadyExists) => fail(msg, errno::EEXIST),
            Err(BackendError::SyncTimeout) => {
                log::info!(
                    "sync timeout snapshotting volume '{}'",
                    req.volume_name
                );
                fail(msg, errno::ETIMEDOUT)
            }
            Err(BackendError::PreviousSnapshotNotOnBackend) => {
                log::info!(
                    "previous snapshot not on backend yet for volume '{}'",
                    req.volume_name
                );
                fail(msg, errno::EBUSY)
            }
            Err(e) => {
                log::error!(
                    "problem creating snapshot for volume '{}': {e}",
                    req.volume_name
                );
                fail(msg, errno::EIO)
            }
        }
    }

    fn handle_delete_snapshot(&self, req: &Message) -> Reply {
        if let Some(reply) = self.check_no_handle(req) {
            return reply;
        }
        let msg = rsp(Opcode::DeleteSnapshotRsp, req.opaque);
        match self
            .backend
            .delete_snapshot(&req.volume_name, &req.snapshot_name)
        {
            Ok(()) => Reply::new(msg),
            Err(BackendError::NotFound) => fail(msg, errno::ENOENT),
            Err(BackendError::HasChildren) => fail(msg, errno::ENOTEMPTY),
            Err(e) => {
                log::error!(
                    "problem removing snapshot '{}' of volume '{}': {e}",
                    req.snapshot_name,
                    req.volume_name
                );
                fail(msg, errno::EIO)
            }
        }
    }

    fn handle_rollback_snapshot(&self, req: &Message) -> Reply {
        if let Some(reply) = self.check_no_handle(req) {
            return reply;
        }
        let msg = rsp(Opcode::RollbackSnapshotRsp, req.opaque);
        match self
            .backend
            .rollback_snapshot(&req.volume_name, &req.snapshot_name)
        {
            Ok(()) => Reply::new(msg),
            Err(BackendError::NotFound) => fail(msg, errno::ENOENT),
            Err(BackendError::HasChildren) => fail(msg, errno::ENOTEMPTY),
            Err(e) => {
                log::error!(
                    "problem rolling back snapshot '{}' of volume '{}': {e}",
                    req.snapshot_name,
                    req.volume_name
                );
                fail(msg, errno::EIO)
            }
        }
    }

    fn handle_is_snapshot_synced(&self, req: &Message) -> Reply {
        if let Some(reply) = self.check_no_handle(req) {
            return reply;
        }
        let mut msg = rsp(Opcode::IsSnapshotSyncedRsp, req.opaque);
        match self
            .backend
            .is_snapshot_synced(&req.volume_name, &req.snapshot_name)
        {
            Ok(synced) => {
                msg.retval = synced as i64;
                Reply::new(msg)
            }
            Err(BackendError::NotFound) => fail(msg, errno::ENOENT),
            Err(e) => {
                log::error!(
                    "problem checking snapshot '{}' of volume '{}': {e}",
                    req.snapshot_name,
                    req.volume_name
                );
                fail(msg, errno::EIO)
            }
        }
    }

    fn handle_list_cluster_node_uri(&self, req: &Message) -> Reply {
        let mut msg = rsp(Opcode::ListClusterNodeUriRsp, req.opaque);
        match self.backend.list_cluster_node_uris() {
            Ok(uris) => {
                msg.retval = uris.len() as i64;
                Reply::with_data(msg, Bytes::from(pack_names(&uris)))
            }
            Err(e) => {
                log::error!("problem listing cluster node URIs: {e}");
                fail(msg, errno::EIO)
            }
        }
    }

    fn handle_get_volume_uri(&self, req: &Message) -> Reply {
        let mut msg = rsp(Opcode::GetVolumeUriRsp, req.opaque);
        match self.backend.get_volume_uri(&req.volume_name) {
            Ok(uri) => {
                msg.retval = 1;
                Reply::with_data(msg, Bytes::from(pack_names(&[uri])))
            }
            Err(BackendError::NotFound) => fail(msg, errno::ENOENT),
            Err(e) => {
                log::error!(
                    "problem resolving URI of volume '{}': {e}",
                    req.volume_name
                );
                fail(msg, errno::EIO)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_backend::MemBackend;
    use std::time::Duration;

    fn handler() -> IoHandler {
        let backend = Arc::new(MemBackend::new("tcp://127.0.0.1:21321"));
        backend.create_volume("v1", 1 << 20).unwrap();
        let pool = Arc::new(
            MemPool::builder()
                .add_slab(4096, 0, 64, 4)
                .check_interval(Duration::from_secs(3600))
                .build()
                .unwrap(),
        );
        IoHandler::new(backend, pool)
    }

    fn run(handler: &IoHandler, msg: Message) -> Reply {
        let frame = Frame::new(msg.encode().unwrap());
        handler.process_request(frame)
    }

    fn run_with_data(handler: &IoHandler, msg: Message, data: &[u8]) -> Reply {
        let frame = Frame::with_data(msg.encode().unwrap(), Bytes::copy_from_slice(data));
        handler.process_request(frame)
    }

    #[test]
    fn second_open_fails_with_eio() {
        let h = handler();
        let reply = run(&h, Message::open_req("v1", 1));
        assert_eq!(reply.msg.opcode, Opcode::OpenRsp);
        assert_eq!(reply.msg.retval, 0);
        let reply = run(&h, Message::open_req("v1", 2));
        assert_eq!(reply.msg.retval, -1);
        assert_eq!(reply.msg.errval, errno::EIO);
        assert_eq!(reply.msg.opaque, 2);
    }

    #[test]
    fn open_missing_volume_is_eacces() {
        let h = handler();
        let reply = run(&h, Message::open_req("nope", 7));
        assert_eq!(reply.msg.errval, errno::EACCES);
    }

    #[test]
    fn read_without_handle_is_eio() {
        let h = handler();
        let reply = run(&h, Message::read_req(4096, 0, 3));
        assert_eq!(reply.msg.opcode, Opcode::ReadRsp);
        assert_eq!(reply.msg.errval, errno::EIO);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let h = handler();
        run(&h, Message::open_req("v1", 1));
        let payload = vec![0xab; 4096];
        let reply = run_with_data(&h, Message::write_req(4096, 4096, 2), &payload);
        assert_eq!(reply.msg.retval, 4096);
        assert_eq!(reply.msg.errval, 0);
        let reply = run(&h, Message::read_req(4096, 4096, 3));
        assert_eq!(reply.msg.retval, 4096);
        assert_eq!(reply.data.unwrap().as_slice(), &payload[..]);
    }

    #[test]
    fn write_with_short_data_is_eio() {
        let h = handler();
        run(&h, Message::open_req("v1", 1));
        let reply = run_with_data(&h, Message::write_req(4096, 0, 2), &[0u8; 16]);
        assert_eq!(reply.msg.errval, errno::EIO);
        let reply = run(&h, Message::write_req(4096, 0, 3));
        assert_eq!(reply.msg.errval, errno::EIO);
    }

    #[test]
    fn malformed_header_yields_error_rsp() {
        let h = handler();
        let frame = Frame::new(vec![0xc1, 0xff]);
        let reply = h.process_request(frame);
        assert_eq!(reply.msg.opcode, Opcode::ErrorRsp);
        assert_eq!(reply.msg.errval, errno::EBADMSG);
    }

    #[test]
    fn noop_yields_error_rsp() {
        let h = handler();
        let reply = run(&h, Message::new(Opcode::Noop));
        assert_eq!(reply.msg.opcode, Opcode::ErrorRsp);
        assert_eq!(reply.msg.errval, errno::EIO);
    }

    #[test]
    fn control_ops_rejected_while_volume_open() {
        let h = handler();
        run(&h, Message::open_req("v1", 1));
        let reply = run(&h, Message::create_volume_req("v2", 4096, 2));
        assert_eq!(reply.msg.opcode, Opcode::CreateVolumeRsp);
        assert_eq!(reply.msg.errval, errno::EIO);
    }

    #[test]
    fn snapshot_lifecycle_error_mapping() {
        let h = handler();
        let reply = run(&h, Message::create_snapshot_req("v1", "s1", 5, 1));
        assert_eq!(reply.msg.retval, 0);
        let reply = run(&h, Message::create_snapshot_req("v1", "s1", 5, 2));
        assert_eq!(reply.msg.errval, errno::EEXIST);
        let reply = run(&h, Message::delete_snapshot_req("v1", "s1", 3));
        assert_eq!(reply.msg.retval, 0);
        let reply = run(&h, Message::delete_snapshot_req("v1", "s1", 4));
        assert_eq!(reply.msg.errval, errno::ENOENT);
    }

    #[test]
    fn list_volumes_layout() {
        let h = handler();
        let reply = run(&h, Message::list_volumes_req(9));
        assert_eq!(reply.msg.retval, 1);
        let data = reply.data.unwrap();
        let names = nvp_msg::unpack_names(data.as_slice()).unwrap();
        assert_eq!(names, ["v1"]);
    }

    #[test]
    fn read_reply_falls_back_to_heap_when_pool_is_exhausted() {
        let backend = Arc::new(MemBackend::new("tcp://127.0.0.1:21321"));
        backend.create_volume("v1", 1 << 20).unwrap();
        let pool = Arc::new(
            MemPool::builder()
                .add_slab(4096, 0, 4, 4)
                .check_interval(Duration::from_secs(3600))
                .build()
                .unwrap(),
        );
        let h = IoHandler::new(backend, Arc::clone(&pool));
        run(&h, Message::open_req("v1", 1));
        let held: Vec<_> = (0..4).map(|_| pool.alloc(4096).unwrap()).collect();
        let reply = run(&h, Message::read_req(4096, 0, 2));
        assert_eq!(reply.msg.retval, 4096);
        let data = reply.data.unwrap();
        assert!(!data.from_pool());
        assert_eq!(data.as_slice().len(), 4096);
        drop(held);
        // With the slab free again, replies come from the pool.
        let reply = run(&h, Message::read_req(4096, 0, 3));
        assert!(reply.data.unwrap().from_pool());
    }

    #[test]
    fn list_snapshots_reports_volume_size() {
        let h = handler();
        run(&h, Message::create_snapshot_req("v1", "s1", 5, 1));
        let reply = run(&h, Message::list_snapshots_req("v1", 2));
        assert_eq!(reply.msg.retval, 1);
        assert_eq!(reply.msg.size, 1 << 20);
    }
}
