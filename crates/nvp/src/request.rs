//! In-flight request state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;
use nvp_mempool::IoBuffer;
use nvp_msg::{Message, errno};
use nvp_transport::DataBuf;

use crate::dispatcher::CompletionPool;

/// Completion callback: `(retval, errval)`.
pub type AioCallback = Box<dyn FnOnce(i64, i32) + Send>;

/// What the request does on the wire; enough is retained to resubmit the
/// identical request after a reconnect.
pub(crate) enum RequestOp {
    Open { volume_name: String },
    Close,
    Read { size: u64, offset: u64 },
    Write { data: Bytes, offset: u64 },
    Flush,
}

struct ReqState {
    done: bool,
    retval: i64,
    errval: i32,
    /// Read destination; reply data is copied here on completion.
    buffer: Option<IoBuffer>,
    callback: Option<AioCallback>,
}

/// One submitted request: wire parameters plus a one-shot completion latch.
///
/// The request id doubles as the wire cookie. Completion is idempotent;
/// after a reconnect replay, a late reply from the old connection finds the
/// latch already fired and is dropped.
pub(crate) struct AioRequest {
    id: u64,
    op: RequestOp,
    state: Mutex<ReqState>,
    cv: Condvar,
    completed_once: AtomicBool,
}

impl AioRequest {
    pub(crate) fn new(id: u64, op: RequestOp) -> AioRequest {
        AioRequest {
            id,
            op,
            state: Mutex::new(ReqState {
                done: false,
                retval: 0,
                errval: 0,
                buffer: None,
                callback: None,
            }),
            cv: Condvar::new(),
            completed_once: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn set_buffer(&self, buffer: IoBuffer) {
        let mut state = self.lock_state();
        state.buffer = Some(buffer);
    }

    pub(crate) fn set_callback(&self, callback: AioCallback) {
        let mut state = self.lock_state();
        state.callback = Some(callback);
    }

    /// Builds the wire header for (re)submission.
    pub(crate) fn to_message(&self) -> Message {
        match &self.op {
            RequestOp::Open { volume_name } => Message::open_req(volume_name, self.id),
            RequestOp::Close => Message::close_req(self.id),
            RequestOp::Read { size, offset } => Message::read_req(*size, *offset, self.id),
            RequestOp::Write { data, offset } => {
                Message::write_req(data.len() as u64, *offset, self.id)
            }
            RequestOp::Flush => Message::flush_req(self.id),
        }
    }

    /// Outbound data iovec, if the operation carries one.
    pub(crate) fn out_data(&self) -> Option<Bytes> {
        match &self.op {
            RequestOp::Write { data, .. } => Some(data.clone()),
            _ => None,
        }
    }

    /// Fires the latch. Returns `false` when the request already completed
    /// (duplicate delivery after replay). The callback, if any, is posted to
    /// the dispatcher.
    pub(crate) fn complete(
        &self,
        retval: i64,
        errval: i32,
        data: Option<DataBuf>,
        dispatcher: &CompletionPool,
    ) -> bool {
        if self.completed_once.swap(true, Ordering::AcqRel) {
            return false;
        }
        let callback = {
            let mut state = self.lock_state();
            if let (Some(buffer), Some(data)) = (state.buffer.as_mut(), data.as_ref()) {
                let src = data.as_slice();
                let n = src.len().min(buffer.len());
                buffer.as_mut_slice()[..n].copy_from_slice(&src[..n]);
            }
            state.retval = retval;
            state.errval = errval;
            state.done = true;
            state.callback.take()
        };
        self.cv.notify_all();
        if let Some(callback) = callback {
            dispatcher.post(Box::new(move || callback(retval, errval)));
        }
        true
    }

    /// Shorthand for failing with an errno.
    pub(crate) fn fail(&self, errval: i32, dispatcher: &CompletionPool) -> bool {
        self.complete(-1, errval, None, dispatcher)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.lock_state().done
    }

    /// `(retval, errval)` once done.
    pub(crate) fn result(&self) -> Option<(i64, i32)> {
        let state = self.lock_state();
        state.done.then_some((state.retval, state.errval))
    }

    /// Blocks until the latch fires.
    pub(crate) fn wait(&self) -> (i64, i32) {
        let mut state = self.lock_state();
        while !state.done {
            state = self
                .cv
                .wait(state)
                .unwrap_or_else(|poison| poison.into_inner());
        }
        (state.retval, state.errval)
    }

    /// Bounded wait; `None` on timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<(i64, i32)> {
        let mut state = self.lock_state();
        let deadline = std::time::Instant::now() + timeout;
        while !state.done {
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poison| poison.into_inner());
            state = guard;
        }
        Some((state.retval, state.errval))
    }

    /// Moves the read buffer out, once done.
    pub(crate) fn take_buffer(&self) -> Option<IoBuffer> {
        let mut state = self.lock_state();
        if state.done { state.buffer.take() } else { None }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ReqState> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Fails every request in `reqs` with `EIO`; used when a non-HA connection
/// dies.
pub(crate) fn fail_all(reqs: impl IntoIterator<Item = Arc<AioRequest>>, dispatcher: &CompletionPool) {
    for req in reqs {
        req.fail(errno::EIO, dispatcher);
    }
}
