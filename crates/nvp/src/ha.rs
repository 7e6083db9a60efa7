//! Shared HA state: the in-flight map, the seen queue and the supervisor
//! event channel.
//!
//! Every submitted I/O request is tracked in the in-flight map together
//! with the core that carried it, from submission until its completion is
//! observed. Ids of observed completions move to the seen queue, which
//! suppresses the second delivery a request can receive when a reply from
//! the dying connection races its replay on the new one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::mpsc::Sender;

use crate::core::ClientCore;
use crate::request::AioRequest;

/// Events the HA supervisor thread reacts to.
pub(crate) enum CoreEvent {
    ConnectionError,
    Stop,
}

struct SeenState {
    fifo: VecDeque<u64>,
    set: HashSet<u64>,
}

pub(crate) struct InflightEntry {
    pub(crate) req: Arc<AioRequest>,
    /// The core the request was last submitted on; pins a replaced core
    /// until its late completions have resolved through the shared request.
    #[allow(dead_code)]
    pub(crate) core: Arc<ClientCore>,
}

pub(crate) struct HaShared {
    ha_enabled: bool,
    inflight: Mutex<HashMap<u64, InflightEntry>>,
    seen: Mutex<SeenState>,
    seen_cap: usize,
    event_tx: Mutex<Option<Sender<CoreEvent>>>,
}

impl HaShared {
    pub(crate) fn new(ha_enabled: bool, seen_cap: usize) -> HaShared {
        HaShared {
            ha_enabled,
            inflight: Mutex::new(HashMap::new()),
            seen: Mutex::new(SeenState {
                fifo: VecDeque::new(),
                set: HashSet::new(),
            }),
            seen_cap: seen_cap.max(1),
            event_tx: Mutex::new(None),
        }
    }

    pub(crate) fn ha_enabled(&self) -> bool {
        self.ha_enabled
    }

    /// Whether a dying connection should fail its pending requests rather
    /// than leave them for replay.
    pub(crate) fn fail_pending_on_error(&self) -> bool {
        !self.ha_enabled
    }

    pub(crate) fn set_event_sender(&self, tx: Sender<CoreEvent>) {
        *lock(&self.event_tx) = Some(tx);
    }

    /// Wakes the supervisor; called from a core's event loop on any
    /// transport failure.
    pub(crate) fn notify_connection_error(&self) {
        if let Some(tx) = lock(&self.event_tx).as_ref() {
            let _ = tx.send(CoreEvent::ConnectionError);
        }
    }

    pub(crate) fn insert_inflight(&self, req: Arc<AioRequest>, core: Arc<ClientCore>) {
        if !self.ha_enabled {
            return;
        }
        lock(&self.inflight).insert(req.id(), InflightEntry { req, core });
    }

    pub(crate) fn remove_inflight(&self, id: u64) {
        lock(&self.inflight).remove(&id);
    }

    /// Called for every reply a core delivers. Returns `false` when the id
    /// was already observed (a replay duplicate, which the caller drops).
    /// Ids tracked in the in-flight map move to the seen queue; untracked
    /// ids (open/close handshakes, non-HA mode) pass through unrecorded.
    pub(crate) fn observe_completion(&self, id: u64) -> bool {
        if !self.ha_enabled {
            return true;
        }
        let mut inflight = lock(&self.inflight);
        let mut seen = lock(&self.seen);
        if seen.set.contains(&id) {
            return false;
        }
        if inflight.remove(&id).is_some() {
            seen.fifo.push_back(id);
            seen.set.insert(id);
            while seen.fifo.len() > self.seen_cap {
                if let Some(old) = seen.fifo.pop_front() {
                    seen.set.remove(&old);
                }
            }
        }
        true
    }

    /// Requests whose completion has not been observed, in submission
    /// order; these get resubmitted after a core swap.
    pub(crate) fn replay_candidates(&self) -> Vec<Arc<AioRequest>> {
        let inflight = lock(&self.inflight);
        let seen = lock(&self.seen);
        let mut reqs: Vec<_> = inflight
            .values()
            .filter(|entry| !seen.set.contains(&entry.req.id()))
            .map(|entry| Arc::clone(&entry.req))
            .collect();
        reqs.sort_by_key(|req| req.id());
        reqs
    }

    /// Points an in-flight entry at the core it was replayed on.
    pub(crate) fn reassign_inflight(&self, id: u64, core: &Arc<ClientCore>) {
        if let Some(entry) = lock(&self.inflight).get_mut(&id) {
            entry.core = Arc::clone(core);
        }
    }

    pub(crate) fn drain_inflight(&self) -> Vec<Arc<AioRequest>> {
        lock(&self.inflight)
            .drain()
            .map(|(_, entry)| entry.req)
            .collect()
    }

    pub(crate) fn inflight_len(&self) -> usize {
        lock(&self.inflight).len()
    }

    /// Observed request ids, oldest first.
    pub(crate) fn seen_ids(&self) -> Vec<u64> {
        lock(&self.seen).fifo.iter().copied().collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}
