//! Bounded work queue with a fixed worker pool.
//!
//! Connection tasks queue blocking backend calls here; each worker pops an
//! item, runs it, and the item delivers its result back to the owning
//! connection's event loop over that connection's reply channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;

use crate::{Result, ServerError};

type WorkItem = Box<dyn FnOnce() + Send>;

struct QueueState {
    items: VecDeque<WorkItem>,
    stopping: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    /// Signals workers on submit and submitters on pop.
    cv: Condvar,
    capacity: usize,
    open_sessions: AtomicU64,
}

/// FIFO of blocking work items executed by `threads` workers. Submission
/// waits while the queue sits at capacity; stopping drains what is queued.
pub struct WorkQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkQueue {
    pub fn new(name: &str, threads: usize, capacity: usize) -> Result<WorkQueue> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                stopping: false,
            }),
            cv: Condvar::new(),
            capacity: capacity.max(1),
            open_sessions: AtomicU64::new(0),
        });
        let mut workers = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(shared))
                .map_err(ServerError::WorkQueueThreads)?;
            workers.push(handle);
        }
        Ok(WorkQueue {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Queues a work item, waiting while the queue is full. Items submitted
    /// after [`stop`](Self::stop) are dropped.
    pub fn submit(&self, item: WorkItem) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        while state.items.len() >= self.shared.capacity && !state.stopping {
            state = self
                .shared
                .cv
                .wait(state)
                .unwrap_or_else(|poison| poison.into_inner());
        }
        if state.stopping {
            return;
        }
        state.items.push_back(item);
        drop(state);
        self.shared.cv.notify_all();
    }

    pub fn queue_len(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .items
            .len()
    }

    pub fn open_sessions_inc(&self) {
        self.shared.open_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn open_sessions_dec(&self) {
        self.shared.open_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn open_sessions(&self) -> u64 {
        self.shared.open_sessions.load(Ordering::Relaxed)
    }

    /// Drains queued items, stops the workers and joins them. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            state.stopping = true;
        }
        self.shared.cv.notify_all();
        let workers = {
            let mut workers = self
                .workers
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            std::mem::take(&mut *workers)
        };
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let item = {
            let mut state = shared
                .state
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            loop {
                if let Some(item) = state.items.pop_front() {
                    break item;
                }
                if state.stopping {
                    return;
                }
                state = shared
                    .cv
                    .wait(state)
                    .unwrap_or_else(|poison| poison.into_inner());
            }
        };
        // Wake a submitter blocked on the capacity bound.
        shared.cv.notify_all();
        item();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn executes_submitted_items() {
        let wq = WorkQueue::new("test-wq", 2, 16).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            wq.submit(Box::new(move || tx.send(i).unwrap()));
        }
        let mut got: Vec<i32> = (0..8).map(|_| rx.recv().unwrap()).collect();
        got.sort_unstable();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn stop_drains_queued_items() {
        let wq = WorkQueue::new("test-wq", 1, 64).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            wq.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        wq.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn session_counter() {
        let wq = WorkQueue::new("test-wq", 1, 4).unwrap();
        wq.open_sessions_inc();
        wq.open_sessions_inc();
        wq.open_sessions_dec();
        assert_eq!(wq.open_sessions(), 1);
    }
}
