//! The server event loop.
//!
//! One task accepts sessions; each connection runs its own task that feeds
//! decoded requests to the work queue and writes finished replies back to
//! the socket. A connection that disconnects with requests still in flight
//! sticks around until the last reply drains, then tears down.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use nvp_mempool::MemPool;
use nvp_msg::{Message, Opcode};
use nvp_transport::{Frame, FrameCodec, Uri};

use crate::backend::VolumeBackend;
use crate::handler::{IoHandler, Reply};
use crate::work_queue::WorkQueue;
use crate::{Result, ServerError};

/// Tuning knobs for one server instance.
pub struct ServerConfig {
    /// Blocking workers executing backend calls.
    pub work_queue_threads: usize,
    /// Bound on queued-but-unstarted work items.
    pub work_queue_capacity: usize,
    /// Reply-buffer pool; `None` builds the default slab set.
    pub pool: Option<MemPool>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            work_queue_threads: 4,
            work_queue_capacity: 2048,
            pool: None,
        }
    }
}

/// The default slab set: small classes sized for header-adjacent I/O, large
/// classes capped low so big transfers spill to the heap instead of pinning
/// memory.
fn default_pool() -> nvp_mempool::Result<MemPool> {
    MemPool::builder()
        .add_slab(4096, 0, 2048, 32)
        .add_slab(32768, 0, 2048, 32)
        .add_slab(65536, 0, 2048, 32)
        .add_slab(131072, 0, 256, 32)
        .add_slab(1 << 20, 0, 32, 4)
        .build()
}

/// Cancellation handle; cloneable, shutdown is idempotent.
#[derive(Clone)]
pub struct ServerHandle {
    token: CancellationToken,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

/// A bound protocol server. [`run`](Server::run) drives it to completion.
pub struct Server {
    listener: tokio::net::TcpListener,
    backend: Arc<dyn VolumeBackend>,
    pool: Arc<MemPool>,
    wq: Arc<WorkQueue>,
    token: CancellationToken,
}

impl Server {
    /// Binds the listener and brings up the work queue and memory pool.
    pub async fn bind(
        uri: &Uri,
        backend: Arc<dyn VolumeBackend>,
        config: ServerConfig,
    ) -> Result<Server> {
        log::info!("binding server to '{uri}'");
        let listener = nvp_transport::listen(uri).await.map_err(ServerError::Bind)?;
        let pool = Arc::new(match config.pool {
            Some(pool) => pool,
            None => default_pool()?,
        });
        let wq = Arc::new(WorkQueue::new(
            "nvp-wq",
            config.work_queue_threads,
            config.work_queue_capacity,
        )?);
        Ok(Server {
            listener,
            backend,
            pool,
            wq,
            token: CancellationToken::new(),
        })
    }

    /// The URI actually bound, with the listener's port filled in.
    pub fn local_uri(&self) -> Result<Uri> {
        let addr = self.listener.local_addr().map_err(|e| {
            ServerError::Transport(nvp_transport::TransportError::Io(e))
        })?;
        Ok(Uri::tcp(&addr.ip().to_string(), addr.port()))
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            token: self.token.clone(),
        }
    }

    /// Open sessions, for introspection.
    pub fn open_sessions(&self) -> u64 {
        self.wq.open_sessions()
    }

    /// Runs until [`ServerHandle::shutdown`], then unbinds, drains work and
    /// stops the workers.
    pub async fn run(self) -> Result<()> {
        let polling = nvp_transport::config::polling_timeout();
        if !polling.is_zero() {
            log::debug!("polling timeout configured: {polling:?}");
        }
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        log::debug!("accepted session from {peer}");
                        self.wq.open_sessions_inc();
                        connections.spawn(handle_connection(
                            stream,
                            Arc::clone(&self.backend),
                            Arc::clone(&self.pool),
                            Arc::clone(&self.wq),
                            self.token.child_token(),
                        ));
                    }
                    Err(e) => log::error!("cannot accept new session: {e}"),
                },
                Some(_) = connections.join_next() => {
                    self.wq.open_sessions_dec();
                }
            }
        }

        log::info!("shutting down server");
        // Unbind before draining so no new sessions arrive.
        drop(self.listener);
        while connections.join_next().await.is_some() {
            self.wq.open_sessions_dec();
        }
        self.wq.stop();
        Ok(())
    }
}

fn encode_reply(reply: Reply) -> Option<Frame> {
    match reply.msg.encode() {
        Ok(header) => Some(Frame {
            header: header.into(),
            data: reply.data,
        }),
        Err(e) => {
            log::error!("cannot pack reply header: {e}");
            None
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    backend: Arc<dyn VolumeBackend>,
    pool: Arc<MemPool>,
    wq: Arc<WorkQueue>,
    token: CancellationToken,
) {
    let framed = Framed::new(stream, FrameCodec::with_pool(Arc::clone(&pool)));
    let (mut sink, mut stream) = framed.split();
    let handler = Arc::new(IoHandler::new(backend, pool));
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Reply>();
    let mut inflight: usize = 0;
    let mut disconnected = false;

    loop {
        tokio::select! {
            Some(reply) = reply_rx.recv() => {
                inflight -= 1;
                if !disconnected {
                    if let Some(frame) = encode_reply(reply) {
                        if let Err(e) = sink.send(frame).await {
                            log::error!("failed to send reply: {e}");
                            disconnected = true;
                        }
                    }
                }
            }
            frame = stream.next(), if !disconnected => match frame {
                Some(Ok(frame)) => {
                    inflight += 1;
                    let handler = Arc::clone(&handler);
                    let reply_tx = reply_tx.clone();
                    wq.submit(Box::new(move || {
                        let reply = handler.process_request(frame);
                        // Receiver gone means the connection tore down.
                        let _ = reply_tx.send(reply);
                    }));
                }
                Some(Err(e)) => {
                    log::error!("transport error on session: {e}");
                    disconnected = true;
                }
                None => {
                    log::debug!("peer disconnected");
                    disconnected = true;
                }
            },
            _ = token.cancelled(), if !disconnected => {
                // Graceful shutdown: tell the peer, stop reading.
                let shutdown = Message::new(Opcode::ShutdownRsp);
                if let Some(frame) = encode_reply(Reply { msg: shutdown, data: None }) {
                    let _ = sink.send(frame).await;
                }
                disconnected = true;
            }
        }
        // Teardown waits for the last in-flight request to drain.
        if disconnected && inflight == 0 {
            break;
        }
    }
}
