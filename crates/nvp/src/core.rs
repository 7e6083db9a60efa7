//! The client core: one connection, one dedicated event-loop thread.
//!
//! Submitters hand prepared requests to the loop over a channel after
//! taking a slot in the submit window; the loop owns the socket, correlates
//! replies by cookie and resolves the matching request. All transport state
//! lives on the loop thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use nvp_msg::{Message, Opcode, errno};
use nvp_transport::{Frame, FrameCodec, KeepaliveConfig, Uri};

use crate::dispatcher::CompletionPool;
use crate::ha::HaShared;
use crate::request::{AioRequest, RequestOp, fail_all};
use crate::{Error, Result};

/// Bound on the wait for a submit-window slot.
const SUBMIT_WAIT: Duration = Duration::from_secs(60);
/// Bound on connection establishment.
const CONNECT_WAIT: Duration = Duration::from_secs(30);

/// The submit window: a counter of free request slots, sized to the queue
/// depth.
struct Window {
    avail: Mutex<u64>,
    cv: Condvar,
}

impl Window {
    fn new(depth: u64) -> Window {
        Window {
            avail: Mutex::new(depth),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self) -> Result<()> {
        let mut avail = self
            .avail
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let deadline = std::time::Instant::now() + SUBMIT_WAIT;
        while *avail == 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(Error::QueueBusy);
            }
            let (guard, _) = self
                .cv
                .wait_timeout(avail, deadline - now)
                .unwrap_or_else(|poison| poison.into_inner());
            avail = guard;
        }
        *avail -= 1;
        Ok(())
    }

    fn release(&self) {
        let mut avail = self
            .avail
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        *avail += 1;
        drop(avail);
        self.cv.notify_one();
    }
}

/// One connected client context.
pub(crate) struct ClientCore {
    uri: Uri,
    submit_tx: mpsc::UnboundedSender<Arc<AioRequest>>,
    window: Arc<Window>,
    connection_error: Arc<AtomicBool>,
    shared: Arc<HaShared>,
    token: CancellationToken,
    loop_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ClientCore {
    /// Connects to `uri` and starts the event-loop thread. Fails if the
    /// connection cannot be established within the bound.
    pub(crate) fn connect(
        uri: Uri,
        queue_depth: u64,
        keepalive: KeepaliveConfig,
        shared: Arc<HaShared>,
        dispatcher: Arc<CompletionPool>,
    ) -> Result<Arc<ClientCore>> {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);
        let token = CancellationToken::new();
        let window = Arc::new(Window::new(queue_depth.max(1)));
        let connection_error = Arc::new(AtomicBool::new(false));

        let ctx = LoopCtx {
            uri: uri.clone(),
            keepalive,
            window: Arc::clone(&window),
            connection_error: Arc::clone(&connection_error),
            shared: Arc::clone(&shared),
            dispatcher,
            token: token.clone(),
        };
        let loop_thread = thread::Builder::new()
            .name("nvp-client".into())
            .spawn(move || run_loop_thread(ctx, submit_rx, ready_tx))
            .map_err(|e| Error::Transport(e.into()))?;

        let core = ClientCore {
            uri,
            submit_tx,
            window,
            connection_error,
            shared,
            token,
            loop_thread: Mutex::new(Some(loop_thread)),
        };
        match ready_rx.recv_timeout(CONNECT_WAIT) {
            Ok(Ok(())) => Ok(Arc::new(core)),
            Ok(Err(e)) => {
                core.join_loop();
                Err(e)
            }
            Err(_) => {
                core.token.cancel();
                core.join_loop();
                Err(Error::Timeout)
            }
        }
    }

    pub(crate) fn uri(&self) -> &Uri {
        &self.uri
    }

    pub(crate) fn connection_error(&self) -> bool {
        self.connection_error.load(Ordering::Acquire)
    }

    /// Queues a request on the loop. Blocks while the submit window is
    /// full, bounded by the 60 s wait.
    pub(crate) fn submit(&self, req: Arc<AioRequest>) -> Result<()> {
        if self.connection_error() && self.shared.fail_pending_on_error() {
            return Err(Error::ConnectionError);
        }
        self.window.acquire()?;
        if self.submit_tx.send(req).is_err() {
            self.window.release();
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    /// Sends an open request for `volume_name` and waits for the reply.
    pub(crate) fn open_volume(&self, volume_name: &str, id: u64) -> Result<()> {
        let req = Arc::new(AioRequest::new(
            id,
            RequestOp::Open {
                volume_name: volume_name.to_owned(),
            },
        ));
        self.submit(Arc::clone(&req))?;
        let (retval, errval) = req.wait();
        if retval < 0 {
            Err(Error::Remote(errval))
        } else {
            Ok(())
        }
    }

    /// Sends a close request and waits for the reply.
    pub(crate) fn close_volume(&self, id: u64) -> Result<()> {
        let req = Arc::new(AioRequest::new(id, RequestOp::Close));
        self.submit(Arc::clone(&req))?;
        let (retval, errval) = req.wait();
        if retval < 0 {
            Err(Error::Remote(errval))
        } else {
            Ok(())
        }
    }

    /// Stops the event loop and joins its thread. Idempotent.
    pub(crate) fn shutdown(&self) {
        self.token.cancel();
        self.join_loop();
    }

    fn join_loop(&self) {
        let handle = {
            let mut guard = self
                .loop_thread
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for ClientCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct LoopCtx {
    uri: Uri,
    keepalive: KeepaliveConfig,
    window: Arc<Window>,
    connection_error: Arc<AtomicBool>,
    shared: Arc<HaShared>,
    dispatcher: Arc<CompletionPool>,
    token: CancellationToken,
}

fn run_loop_thread(
    ctx: LoopCtx,
    submit_rx: mpsc::UnboundedReceiver<Arc<AioRequest>>,
    ready_tx: std::sync::mpsc::SyncSender<Result<()>>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready_tx.send(Err(Error::Transport(e.into())));
            return;
        }
    };
    rt.block_on(run_loop(ctx, submit_rx, ready_tx));
}

async fn run_loop(
    ctx: LoopCtx,
    mut submit_rx: mpsc::UnboundedReceiver<Arc<AioRequest>>,
    ready_tx: std::sync::mpsc::SyncSender<Result<()>>,
) {
    let stream = match nvp_transport::connect(&ctx.uri, &ctx.keepalive).await {
        Ok(stream) => stream,
        Err(e) => {
            log::error!("failed to connect to '{}': {e}", ctx.uri);
            let _ = ready_tx.send(Err(e.into()));
            return;
        }
    };
    log::debug!("connected to '{}'", ctx.uri);
    let _ = ready_tx.send(Ok(()));

    let framed = Framed::new(stream, FrameCodec::new());
    let (mut sink, mut frames) = framed.split();
    let mut pending: std::collections::HashMap<u64, Arc<AioRequest>> =
        std::collections::HashMap::new();

    let failure = loop {
        tokio::select! {
            Some(req) = submit_rx.recv() => {
                let header = match req.to_message().encode() {
                    Ok(header) => header,
                    Err(e) => {
                        log::error!("cannot pack request header: {e}");
                        ctx.window.release();
                        req.fail(errno::EIO, &ctx.dispatcher);
                        continue;
                    }
                };
                let frame = match req.out_data() {
                    Some(data) => Frame::with_data(header, data),
                    None => Frame::new(header),
                };
                let id = req.id();
                pending.insert(id, req);
                if let Err(e) = sink.send(frame).await {
                    log::error!("failed to send request {id}: {e}");
                    // The outbound-error path releases the slot too, so the
                    // window invariant survives replay.
                    if let Some(req) = pending.remove(&id) {
                        ctx.window.release();
                        if ctx.shared.fail_pending_on_error() {
                            req.fail(errno::EIO, &ctx.dispatcher);
                        }
                    }
                    break true;
                }
            }
            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    if on_reply(&ctx, &mut pending, frame) {
                        break true;
                    }
                }
                Some(Err(e)) => {
                    log::error!("transport error on '{}': {e}", ctx.uri);
                    break true;
                }
                None => {
                    log::warn!("server '{}' closed the connection", ctx.uri);
                    break true;
                }
            },
            _ = ctx.token.cancelled() => break false,
        }
    };

    submit_rx.close();
    if failure {
        ctx.connection_error.store(true, Ordering::Release);
    }
    let fail_now = failure && ctx.shared.fail_pending_on_error();
    // Drain requests that raced the loop exit.
    let mut leftover: Vec<Arc<AioRequest>> = Vec::new();
    while let Ok(req) = submit_rx.try_recv() {
        ctx.window.release();
        leftover.push(req);
    }
    if fail_now || !failure {
        // Connection-error replay keeps HA-tracked requests alive; every
        // other exit resolves them with EIO.
        for _ in 0..pending.len() {
            ctx.window.release();
        }
        fail_all(pending.drain().map(|(_, req)| req), &ctx.dispatcher);
        fail_all(leftover, &ctx.dispatcher);
    }
    if failure {
        ctx.shared.notify_connection_error();
    }
}

/// Handles one inbound frame. Returns `true` when the connection must be
/// treated as failed.
fn on_reply(
    ctx: &LoopCtx,
    pending: &mut std::collections::HashMap<u64, Arc<AioRequest>>,
    frame: Frame,
) -> bool {
    let msg = match Message::decode(&frame.header) {
        Err(e) => {
            // One unparseable reply; the matching request, if any, cannot
            // be identified, so it will surface through the transport
            // error path or replay.
            log::error!("cannot unpack reply header: {e}");
            return false;
        }
        Ok(msg) => msg,
    };
    if msg.opcode == Opcode::ShutdownRsp {
        log::warn!("server '{}' is shutting down", ctx.uri);
        return true;
    }
    let Some(req) = pending.remove(&msg.opaque) else {
        // Expected after replay: the reply of a request that already
        // completed on another core.
        log::debug!("discarding reply with unknown cookie {}", msg.opaque);
        return false;
    };
    ctx.window.release();
    if ctx.shared.observe_completion(msg.opaque) {
        req.complete(msg.retval, msg.errval, frame.data, &ctx.dispatcher);
    } else {
        log::debug!("suppressing duplicate completion {}", msg.opaque);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_bounds_outstanding_slots() {
        let window = Window::new(2);
        window.acquire().unwrap();
        window.acquire().unwrap();
        // The third slot only frees up after a release.
        let w = Arc::new(window);
        let waiter = {
            let w = Arc::clone(&w);
            std::thread::spawn(move || w.acquire())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        w.release();
        waiter.join().unwrap().unwrap();
    }
}
