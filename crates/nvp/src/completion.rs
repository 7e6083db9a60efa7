//! The completion object handed back for every asynchronous submit.

use std::sync::Arc;
use std::time::Duration;

use nvp_mempool::IoBuffer;

use crate::request::AioRequest;
use crate::{Error, Result};

/// Tracks one submitted request until its reply (or failure) is observed.
///
/// Waiting never holds a lock across the block; callbacks registered at
/// submit time run on the completion dispatcher instead.
pub struct Completion {
    req: Arc<AioRequest>,
}

impl Completion {
    pub(crate) fn new(req: Arc<AioRequest>) -> Completion {
        Completion { req }
    }

    /// Blocks until the request finishes; `Ok(retval)` on success,
    /// [`Error::Remote`] with the reply's errno on failure.
    pub fn wait(&self) -> Result<i64> {
        let (retval, errval) = self.req.wait();
        if retval < 0 {
            Err(Error::Remote(errval))
        } else {
            Ok(retval)
        }
    }

    /// Bounded [`wait`](Self::wait); [`Error::Timeout`] if the reply does
    /// not arrive in time (the request stays in flight).
    pub fn wait_timeout(&self, timeout: Duration) -> Result<i64> {
        match self.req.wait_timeout(timeout) {
            Some((retval, _)) if retval >= 0 => Ok(retval),
            Some((_, errval)) => Err(Error::Remote(errval)),
            None => Err(Error::Timeout),
        }
    }

    /// Non-blocking probe; `None` while the request is still in flight.
    pub fn try_result(&self) -> Option<Result<i64>> {
        self.req.result().map(|(retval, errval)| {
            if retval < 0 {
                Err(Error::Remote(errval))
            } else {
                Ok(retval)
            }
        })
    }

    pub fn is_done(&self) -> bool {
        self.req.is_done()
    }

    /// The errno of a failed request, `0` otherwise.
    pub fn errval(&self) -> i32 {
        self.req.result().map(|(_, errval)| errval).unwrap_or(0)
    }

    /// Takes back the buffer a read completed into. `None` before
    /// completion or for operations without one.
    pub fn take_buffer(&self) -> Option<IoBuffer> {
        self.req.take_buffer()
    }

    /// Request cancellation is not supported by the protocol.
    pub fn cancel(&self) -> Result<()> {
        Err(Error::NotSupported)
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("id", &self.req.id())
            .field("done", &self.is_done())
            .finish()
    }
}
