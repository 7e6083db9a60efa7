//! Completion callback dispatcher.
//!
//! User callbacks run on this pool, never on a transport event loop, so a
//! slow callback cannot stall network I/O.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use nvp_transport::config::{KEY_COMPLETION_POOL_SIZE, env_or_default};

use crate::{Error, Result};

pub(crate) const DEFAULT_POOL_SIZE: usize = 4;

type Job = Box<dyn FnOnce() + Send>;

struct State {
    queue: VecDeque<Job>,
    stopping: bool,
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

/// Worker pool invoking completion callbacks; sized by
/// `completion_pool_size` (default 4).
pub(crate) struct CompletionPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl CompletionPool {
    pub(crate) fn pool_size_from_env() -> usize {
        env_or_default(KEY_COMPLETION_POOL_SIZE, DEFAULT_POOL_SIZE).max(1)
    }

    pub(crate) fn new(threads: usize) -> Result<CompletionPool> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                stopping: false,
            }),
            cv: Condvar::new(),
        });
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads.max(1) {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("nvp-comp-{i}"))
                .spawn(move || worker_loop(shared))
                .map_err(|e| Error::Transport(e.into()))?;
            workers.push(handle);
        }
        Ok(CompletionPool {
            shared,
            workers: Mutex::new(workers),
        })
    }

    pub(crate) fn post(&self, job: Job) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if state.stopping {
            return;
        }
        state.queue.push_back(job);
        drop(state);
        self.shared.cv.notify_one();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared
                .state
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            loop {
                if let Some(job) = state.queue.pop_front() {
                    break job;
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
        job();
    }
}

impl Drop for CompletionPool {
    fn drop(&mut self) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn callbacks_run_off_caller_thread() {
        let pool = CompletionPool::new(2).unwrap();
        let (tx, rx) = mpsc::channel();
        let caller = thread::current().id();
        pool.post(Box::new(move || {
            tx.send(thread::current().id() != caller).unwrap();
        }));
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn queued_callbacks_drain_before_stop() {
        let pool = CompletionPool::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.post(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }
}
