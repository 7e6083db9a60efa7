//! The public client: volume I/O with transparent failover.
//!
//! A [`Client`] owns the active [`ClientCore`] plus the in-flight tracking
//! that survives core swaps. When the connection fails, a supervisor thread
//! picks another endpoint from the known cluster URIs, rebuilds the core,
//! reopens the volume with the saved parameters and resubmits every request
//! whose completion was never observed. Idempotent operations are assumed;
//! the wire cookie keeps request identity stable across replays.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use nvp_mempool::{IoBuffer, MemPool};
use nvp_msg::Message;
use nvp_transport::{KeepaliveConfig, Uri};
use rand::Rng;

use crate::completion::Completion;
use crate::control::{control_list, control_request};
use crate::core::ClientCore;
use crate::dispatcher::CompletionPool;
use crate::ha::{CoreEvent, HaShared};
use crate::request::{AioCallback, AioRequest, RequestOp};
use crate::{Error, Result};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Client tuning knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Submit window depth; in-flight requests never exceed it.
    pub queue_depth: u64,
    /// Reconnect-and-replay on connection failure. Without it, a connection
    /// error fails all in-flight and future requests.
    pub ha_enabled: bool,
    /// TCP keepalive; `None` reads the `xio_keepalive_*` environment keys.
    pub keepalive: Option<KeepaliveConfig>,
    /// Completion dispatcher threads; `None` reads `completion_pool_size`.
    pub completion_threads: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            queue_depth: 64,
            ha_enabled: true,
            keepalive: None,
            completion_threads: None,
        }
    }
}

struct ClientInner {
    queue_depth: u64,
    keepalive: KeepaliveConfig,
    shared: Arc<HaShared>,
    dispatcher: Arc<CompletionPool>,
    pool: MemPool,
    active: parking_lot::Mutex<Arc<ClientCore>>,
    volume: parking_lot::Mutex<Option<String>>,
    cluster_uris: parking_lot::Mutex<Vec<String>>,
    request_id: AtomicU64,
    stopping: AtomicBool,
    event_tx: Sender<CoreEvent>,
}

/// A connected volume client.
pub struct Client {
    inner: Arc<ClientInner>,
    supervisor: Option<thread::JoinHandle<()>>,
}

impl Client {
    /// Connects to `uri` (`tcp://host:port`).
    pub fn connect(uri: &str, config: &ClientConfig) -> Result<Client> {
        let uri: Uri = uri.parse()?;
        let keepalive = config.keepalive.unwrap_or_else(KeepaliveConfig::from_env);
        let threads = config
            .completion_threads
            .unwrap_or_else(CompletionPool::pool_size_from_env);
        let dispatcher = Arc::new(CompletionPool::new(threads)?);
        let shared = Arc::new(HaShared::new(
            config.ha_enabled,
            (config.queue_depth as usize) * 2,
        ));
        let (event_tx, event_rx) = channel();
        shared.set_event_sender(event_tx.clone());

        let core = ClientCore::connect(
            uri.clone(),
            config.queue_depth,
            keepalive,
            Arc::clone(&shared),
            Arc::clone(&dispatcher),
        )?;

        let pool = MemPool::builder()
            .add_slab(4096, 0, config.queue_depth.max(32) as usize, 32)
            .add_slab(32768, 0, 32, 32)
            .add_slab(131072, 0, 8, 32)
            .build()
            .map_err(|_| Error::OutOfMemory)?;

        let inner = Arc::new(ClientInner {
            queue_depth: config.queue_depth,
            keepalive,
            shared,
            dispatcher,
            pool,
            active: parking_lot::Mutex::new(core),
            volume: parking_lot::Mutex::new(None),
            cluster_uris: parking_lot::Mutex::new(vec![uri.to_string()]),
            request_id: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
            event_tx,
        });

        let supervisor = if config.ha_enabled {
            let inner = Arc::clone(&inner);
            Some(
                thread::Builder::new()
                    .name("nvp-ha".into())
                    .spawn(move || supervisor_loop(inner, event_rx))
                    .map_err(|e| Error::Transport(e.into()))?,
            )
        } else {
            None
        };

        Ok(Client { inner, supervisor })
    }

    /// Opens `volume_name` on this session; at most one volume per client.
    /// The name is retained so a failover can reopen it, and the cluster
    /// URI set is refreshed while the endpoint is known-good.
    pub fn open_volume(&self, volume_name: &str) -> Result<()> {
        let core = self.active_core();
        core.open_volume(volume_name, self.inner.next_id())?;
        *self.inner.volume.lock() = Some(volume_name.to_owned());
        if self.inner.shared.ha_enabled() {
            match self.list_cluster_node_uri() {
                Ok(uris) if !uris.is_empty() => *self.inner.cluster_uris.lock() = uris,
                Ok(_) => {}
                Err(e) => log::debug!("cluster URI refresh failed: {e}"),
            }
        }
        Ok(())
    }

    /// Closes the open volume.
    pub fn close_volume(&self) -> Result<()> {
        let core = self.active_core();
        core.close_volume(self.inner.next_id())?;
        *self.inner.volume.lock() = None;
        Ok(())
    }

    /// Allocates a data buffer, preferring the client's buffer pool.
    pub fn allocate_buffer(&self, size: usize) -> Result<IoBuffer> {
        self.inner.pool.alloc_or_heap(size).ok_or(Error::OutOfMemory)
    }

    /// Submits a read of `buf.len()` bytes at `offset`. The buffer rides on
    /// the completion and holds the data once it fires.
    pub fn aio_read(&self, buf: IoBuffer, offset: u64) -> Result<Completion> {
        let req = self.new_request(RequestOp::Read {
            size: buf.len() as u64,
            offset,
        });
        req.set_buffer(buf);
        self.submit_io(req)
    }

    /// Submits a write of `data` at `offset`.
    pub fn aio_write(&self, data: &[u8], offset: u64) -> Result<Completion> {
        let req = self.new_request(RequestOp::Write {
            data: Bytes::copy_from_slice(data),
            offset,
        });
        self.submit_io(req)
    }

    /// Submits a flush.
    pub fn aio_flush(&self) -> Result<Completion> {
        let req = self.new_request(RequestOp::Flush);
        self.submit_io(req)
    }

    /// [`aio_read`](Self::aio_read) with a callback invoked on the
    /// completion dispatcher.
    pub fn aio_read_with_callback(
        &self,
        buf: IoBuffer,
        offset: u64,
        callback: impl FnOnce(i64, i32) + Send + 'static,
    ) -> Result<Completion> {
        let req = self.new_request(RequestOp::Read {
            size: buf.len() as u64,
            offset,
        });
        req.set_buffer(buf);
        req.set_callback(Box::new(callback) as AioCallback);
        self.submit_io(req)
    }

    /// [`aio_write`](Self::aio_write) with a callback invoked on the
    /// completion dispatcher.
    pub fn aio_write_with_callback(
        &self,
        data: &[u8],
        offset: u64,
        callback: impl FnOnce(i64, i32) + Send + 'static,
    ) -> Result<Completion> {
        let req = self.new_request(RequestOp::Write {
            data: Bytes::copy_from_slice(data),
            offset,
        });
        req.set_callback(Box::new(callback) as AioCallback);
        self.submit_io(req)
    }

    /// [`aio_flush`](Self::aio_flush) with a callback invoked on the
    /// completion dispatcher.
    pub fn aio_flush_with_callback(
        &self,
        callback: impl FnOnce(i64, i32) + Send + 'static,
    ) -> Result<Completion> {
        let req = self.new_request(RequestOp::Flush);
        req.set_callback(Box::new(callback) as AioCallback);
        self.submit_io(req)
    }

    pub fn create_volume(&self, volume_name: &str, size: u64) -> Result<()> {
        self.control(Message::create_volume_req(volume_name, size, self.inner.next_id()))
            .map(drop)
    }

    pub fn remove_volume(&self, volume_name: &str) -> Result<()> {
        self.control(Message::remove_volume_req(volume_name, self.inner.next_id()))
            .map(drop)
    }

    pub fn truncate_volume(&self, volume_name: &str, size: u64) -> Result<()> {
        self.control(Message::truncate_volume_req(
            volume_name,
            size,
            self.inner.next_id(),
        ))
        .map(drop)
    }

    /// Volume size in bytes.
    pub fn stat_volume(&self, volume_name: &str) -> Result<u64> {
        let (reply, _) =
            self.control(Message::stat_volume_req(volume_name, self.inner.next_id()))?;
        Ok(reply.retval as u64)
    }

    pub fn list_volumes(&self) -> Result<Vec<String>> {
        let (_, names) = self.control_names(Message::list_volumes_req(self.inner.next_id()))?;
        Ok(names)
    }

    pub fn snapshot_create(
        &self,
        volume_name: &str,
        snapshot_name: &str,
        timeout: i64,
    ) -> Result<()> {
        self.control(Message::create_snapshot_req(
            volume_name,
            snapshot_name,
            timeout,
            self.inner.next_id(),
        ))
        .map(drop)
    }

    pub fn snapshot_remove(&self, volume_name: &str, snapshot_name: &str) -> Result<()> {
        self.control(Message::delete_snapshot_req(
            volume_name,
            snapshot_name,
            self.inner.next_id(),
        ))
        .map(drop)
    }

    pub fn snapshot_rollback(&self, volume_name: &str, snapshot_name: &str) -> Result<()> {
        self.control(Message::rollback_snapshot_req(
            volume_name,
            snapshot_name,
            self.inner.next_id(),
        ))
        .map(drop)
    }

    /// Snapshot names plus the volume size in bytes.
    pub fn snapshot_list(&self, volume_name: &str) -> Result<(Vec<String>, u64)> {
        let (reply, names) =
            self.control_names(Message::list_snapshots_req(volume_name, self.inner.next_id()))?;
        Ok((names, reply.size))
    }

    pub fn is_snapshot_synced(&self, volume_name: &str, snapshot_name: &str) -> Result<bool> {
        let (reply, _) = self.control(Message::is_snapshot_synced_req(
            volume_name,
            snapshot_name,
            self.inner.next_id(),
        ))?;
        Ok(reply.retval != 0)
    }

    /// URIs of every node in the serving cluster.
    pub fn list_cluster_node_uri(&self) -> Result<Vec<String>> {
        let (_, uris) =
            self.control_names(Message::list_cluster_node_uri_req(self.inner.next_id()))?;
        Ok(uris)
    }

    /// URI of the node currently hosting `volume_name`.
    pub fn get_volume_uri(&self, volume_name: &str) -> Result<String> {
        let (_, mut uris) =
            self.control_names(Message::get_volume_uri_req(volume_name, self.inner.next_id()))?;
        uris.pop().ok_or(Error::NotConnected)
    }

    /// Recently observed request ids, oldest first; diagnostics only.
    pub fn seen_request_ids(&self) -> Vec<u64> {
        self.inner.shared.seen_ids()
    }

    /// In-flight request count.
    pub fn inflight_requests(&self) -> usize {
        self.inner.shared.inflight_len()
    }

    fn active_core(&self) -> Arc<ClientCore> {
        Arc::clone(&self.inner.active.lock())
    }

    fn new_request(&self, op: RequestOp) -> Arc<AioRequest> {
        Arc::new(AioRequest::new(self.inner.next_id(), op))
    }

    fn submit_io(&self, req: Arc<AioRequest>) -> Result<Completion> {
        if self.inner.stopping.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        // Blocks while a failover swap holds the lock.
        let core = self.active_core();
        self.inner
            .shared
            .insert_inflight(Arc::clone(&req), Arc::clone(&core));
        match core.submit(Arc::clone(&req)) {
            Ok(()) => Ok(Completion::new(req)),
            Err(Error::QueueBusy) => {
                self.inner.shared.remove_inflight(req.id());
                Err(Error::QueueBusy)
            }
            Err(e) if self.inner.shared.ha_enabled() => {
                // The connection died underneath us. If the failover swap
                // already happened, resubmit on the replacement; otherwise
                // the pending replay will pick this request up from the
                // in-flight map.
                log::warn!("submit error masked pending failover: {e}");
                let retry = self.active_core();
                if !Arc::ptr_eq(&retry, &core) {
                    self.inner.shared.reassign_inflight(req.id(), &retry);
                    if let Err(e) = retry.submit(Arc::clone(&req)) {
                        log::warn!("resubmit after failover failed: {e}");
                    }
                }
                Ok(Completion::new(req))
            }
            Err(e) => {
                self.inner.shared.remove_inflight(req.id());
                Err(e)
            }
        }
    }

    fn control(&self, msg: Message) -> Result<(Message, Option<nvp_transport::DataBuf>)> {
        let uri = self.active_core().uri().clone();
        control_request(&uri, &self.inner.keepalive, msg)
    }

    fn control_names(&self, msg: Message) -> Result<(Message, Vec<String>)> {
        let uri = self.active_core().uri().clone();
        control_list(&uri, &self.inner.keepalive, msg)
    }

    /// Stops the supervisor and the event loop. Called on drop.
    pub fn shutdown(&mut self) {
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.event_tx.send(CoreEvent::Stop);
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.join();
        }
        self.active_core().shutdown();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ClientInner {
    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn supervisor_loop(inner: Arc<ClientInner>, event_rx: Receiver<CoreEvent>) {
    loop {
        match event_rx.recv() {
            Ok(CoreEvent::ConnectionError) => {
                if inner.stopping.load(Ordering::Acquire) {
                    break;
                }
                // Collapse an error burst into one reconnect.
                loop {
                    match event_rx.try_recv() {
                        Ok(CoreEvent::ConnectionError) => continue,
                        Ok(CoreEvent::Stop) => return,
                        Err(_) => break,
                    }
                }
                reconnect_and_replay(&inner);
            }
            Ok(CoreEvent::Stop) | Err(_) => break,
        }
    }
}

fn refresh_cluster_uris(inner: &ClientInner, current: &Uri) -> Vec<String> {
    let known = inner.cluster_uris.lock().clone();
    let mut candidates: Vec<String> = vec![current.to_string()];
    candidates.extend(known.iter().cloned());
    for uri_str in &candidates {
        let Ok(uri) = uri_str.parse::<Uri>() else {
            continue;
        };
        match control_list(
            &uri,
            &inner.keepalive,
            Message::list_cluster_node_uri_req(inner.next_id()),
        ) {
            Ok((_, uris)) if !uris.is_empty() => {
                *inner.cluster_uris.lock() = uris.clone();
                return uris;
            }
            Ok(_) => {}
            Err(e) => log::debug!("cluster URI query via '{uri}' failed: {e}"),
        }
    }
    known
}

fn pick_endpoint(uris: &[String], current: &Uri) -> Option<Uri> {
    let parsed: Vec<Uri> = uris.iter().filter_map(|u| u.parse().ok()).collect();
    if parsed.is_empty() {
        return Some(current.clone());
    }
    let others: Vec<&Uri> = parsed.iter().filter(|u| *u != current).collect();
    let mut rng = rand::thread_rng();
    if others.is_empty() {
        Some(parsed[rng.gen_range(0..parsed.len())].clone())
    } else {
        Some(others[rng.gen_range(0..others.len())].clone())
    }
}

/// Builds a replacement core on another endpoint, reopens the volume and
/// resubmits everything in flight that was never observed to complete.
/// Retries with bounded backoff until it succeeds or the client stops.
fn reconnect_and_replay(inner: &Arc<ClientInner>) {
    let current = inner.active.lock().uri().clone();
    let uris = refresh_cluster_uris(inner, &current);
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if inner.stopping.load(Ordering::Acquire) {
            return;
        }
        let Some(target) = pick_endpoint(&uris, &current) else {
            return;
        };
        log::info!("attempting failover from '{current}' to '{target}'");
        match ClientCore::connect(
            target.clone(),
            inner.queue_depth,
            inner.keepalive,
            Arc::clone(&inner.shared),
            Arc::clone(&inner.dispatcher),
        ) {
            Ok(core) => {
                let volume = inner.volume.lock().clone();
                let reopened = match &volume {
                    Some(name) => core.open_volume(name, inner.next_id()),
                    None => Ok(()),
                };
                match reopened {
                    Ok(()) => {
                        if swap_and_replay(inner, core) {
                            log::info!("failover to '{target}' complete");
                            return;
                        }
                    }
                    Err(e) => {
                        log::warn!("failed to reopen volume on '{target}': {e}")
                    }
                }
            }
            Err(e) => log::warn!("failover connection to '{target}' failed: {e}"),
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
        std::thread::sleep(backoff + Duration::from_millis(jitter_ms));
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Swaps the active core while holding the swap lock (submitters block on
/// it), then replays. `false` if the new core died mid-replay.
fn swap_and_replay(inner: &Arc<ClientInner>, core: Arc<ClientCore>) -> bool {
    let mut active = inner.active.lock();
    *active = Arc::clone(&core);
    let candidates = inner.shared.replay_candidates();
    if !candidates.is_empty() {
        log::info!("replaying {} unacknowledged requests", candidates.len());
    }
    for req in candidates {
        inner.shared.reassign_inflight(req.id(), &core);
        if let Err(e) = core.submit(Arc::clone(&req)) {
            log::warn!("replay of request {} failed: {e}", req.id());
            return false;
        }
    }
    true
}
