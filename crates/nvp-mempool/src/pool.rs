//! The pool proper: an ordered set of slabs plus the slab-manager thread.

use std::sync::Arc;
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::slab::Slab;
use crate::{IoBuffer, MempoolError, Result};

pub use crate::slab::SlabStats;

/// Environment key overriding the reclamation period, in minutes.
const CHECK_INTERVAL_ENV: &str = "slab_manager_check_interval_mins";
const DEFAULT_CHECK_INTERVAL_MINS: u64 = 15;

/// Manager wakes at this cadence to test for shutdown and elapsed interval.
const MANAGER_TICK: Duration = Duration::from_millis(500);

fn check_interval_from_env() -> Duration {
    let mins = std::env::var(CHECK_INTERVAL_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_CHECK_INTERVAL_MINS);
    Duration::from_secs(mins * 60)
}

pub(crate) struct PoolShared {
    /// Sorted by block size; immutable after construction.
    slabs: Vec<Arc<Slab>>,
    stopping: Mutex<bool>,
    cv: Condvar,
}

impl PoolShared {
    pub(crate) fn free_block(&self, block: crate::slab::MemBlock) {
        let idx = block.slab_id() as usize;
        match self.slabs.get(idx) {
            Some(slab) => slab.free(block),
            // Unreachable: slab ids index the immutable slab vector.
            None => log::error!("freed block for unknown slab {idx}"),
        }
    }
}

/// Configures and constructs a [`MemPool`].
pub struct MemPoolBuilder {
    configs: Vec<(usize, usize, usize, usize)>,
    check_interval: Option<Duration>,
}

impl MemPoolBuilder {
    /// Registers a size class. `min` blocks are allocated eagerly, growth
    /// happens `quantum` blocks at a time and never exceeds `max`.
    pub fn add_slab(mut self, block_size: usize, min: usize, max: usize, quantum: usize) -> Self {
        self.configs.push((block_size, min, max, quantum));
        self
    }

    /// Overrides the reclamation period (normally taken from
    /// `slab_manager_check_interval_mins`).
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<MemPool> {
        let mut configs = self.configs;
        configs.sort_by_key(|(block_size, ..)| *block_size);
        let mut slabs = Vec::with_capacity(configs.len());
        for (id, (block_size, min, max, quantum)) in configs.into_iter().enumerate() {
            if block_size == 0 || max == 0 {
                return Err(MempoolError::InvalidSlab {
                    block_size,
                    max_blocks: max,
                });
            }
            if slabs
                .iter()
                .any(|s: &Arc<Slab>| s.block_size() == block_size)
            {
                return Err(MempoolError::DuplicateSlab(block_size));
            }
            slabs.push(Arc::new(Slab::new(id as u64, block_size, min, max, quantum)));
        }

        let shared = Arc::new(PoolShared {
            slabs,
            stopping: Mutex::new(false),
            cv: Condvar::new(),
        });
        let interval = self.check_interval.unwrap_or_else(check_interval_from_env);

        let manager = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("slab-manager".into())
                .spawn(move || slab_manager(shared, interval))
                .map_err(MempoolError::ManagerThread)?
        };

        Ok(MemPool {
            shared,
            manager: Some(manager),
        })
    }
}

fn slab_manager(shared: Arc<PoolShared>, interval: Duration) {
    let mut last_pass = Instant::now();
    let mut stopping = shared
        .stopping
        .lock()
        .unwrap_or_else(|poison| poison.into_inner());
    loop {
        let (guard, _timeout) = shared
            .cv
            .wait_timeout(stopping, MANAGER_TICK)
            .unwrap_or_else(|poison| poison.into_inner());
        stopping = guard;
        if *stopping {
            break;
        }
        if last_pass.elapsed() >= interval {
            for slab in &shared.slabs {
                slab.try_free_unused_blocks();
            }
            last_pass = Instant::now();
        }
    }
}

/// Size-classed pool of pinned I/O buffers.
///
/// The slab set is fixed at construction; allocation picks the smallest
/// class that fits and falls back to the heap when that class is exhausted.
/// A background thread reclaims one idle region per slab per period.
pub struct MemPool {
    shared: Arc<PoolShared>,
    manager: Option<thread::JoinHandle<()>>,
}

impl MemPool {
    pub fn builder() -> MemPoolBuilder {
        MemPoolBuilder {
            configs: Vec::new(),
            check_interval: None,
        }
    }

    /// A pool-backed buffer of `len` bytes, or `None` when every suitable
    /// class is exhausted (callers then go to the heap).
    pub fn alloc(&self, len: usize) -> Option<IoBuffer> {
        for slab in &self.shared.slabs {
            if len <= slab.block_size() {
                return slab
                    .alloc()
                    .map(|block| IoBuffer::pooled(block, Arc::clone(&self.shared), len));
            }
        }
        log::debug!("no slab serves allocations of {len} bytes");
        None
    }

    /// Pool allocation with aligned-heap fallback; `None` only when the heap
    /// allocation itself fails.
    pub fn alloc_or_heap(&self, len: usize) -> Option<IoBuffer> {
        self.alloc(len).or_else(|| IoBuffer::heap(len))
    }

    /// Runs one reclamation pass immediately.
    pub fn reclaim_idle(&self) {
        for slab in &self.shared.slabs {
            slab.try_free_unused_blocks();
        }
    }

    /// Accounting snapshot per slab, ordered by block size.
    pub fn slab_stats(&self) -> Vec<SlabStats> {
        self.shared.slabs.iter().map(|s| s.stats()).collect()
    }
}

impl Drop for MemPool {
    fn drop(&mut self) {
        {
            let mut stopping = self
                .shared
                .stopping
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            *stopping = true;
            self.shared.cv.notify_one();
        }
        if let Some(manager) = self.manager.take() {
            let _ = manager.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> MemPool {
        MemPool::builder()
            .add_slab(4096, 2, 8, 2)
            .add_slab(32768, 0, 4, 2)
            .check_interval(Duration::from_secs(3600))
            .build()
            .unwrap()
    }

    #[test]
    fn alloc_picks_smallest_fitting_class() {
        let pool = small_pool();
        let a = pool.alloc(100).unwrap();
        assert_eq!(a.capacity(), 4096);
        let b = pool.alloc(4097).unwrap();
        assert_eq!(b.capacity(), 32768);
        assert!(a.from_pool() && b.from_pool());
    }

    #[test]
    fn accounting_holds_across_alloc_free() {
        let pool = small_pool();
        let bufs: Vec<_> = (0..5).map(|_| pool.alloc(4096).unwrap()).collect();
        let stats = &pool.slab_stats()[0];
        assert_eq!(stats.used_blocks, 5);
        assert_eq!(stats.used_blocks + stats.free_blocks, stats.total_blocks);
        drop(bufs);
        let stats = &pool.slab_stats()[0];
        assert_eq!(stats.used_blocks, 0);
        assert_eq!(stats.free_blocks, stats.total_blocks);
    }

    #[test]
    fn exhausted_class_returns_none_then_heap() {
        let pool = small_pool();
        let held: Vec<_> = (0..8).map(|_| pool.alloc(4096).unwrap()).collect();
        assert!(pool.alloc(4096).is_none());
        let fallback = pool.alloc_or_heap(4096).unwrap();
        assert!(!fallback.from_pool());
        assert_eq!(fallback.len(), 4096);
        drop(held);
    }

    #[test]
    fn growth_is_bounded_by_max() {
        let pool = small_pool();
        let held: Vec<_> = (0..8).map(|_| pool.alloc(4096).unwrap()).collect();
        assert_eq!(pool.slab_stats()[0].total_blocks, 8);
        drop(held);
    }

    #[test]
    fn reclaim_spares_minimum_region_and_minimum_blocks() {
        let pool = small_pool();
        // Grow past the minimum, then release everything.
        let held: Vec<_> = (0..8).map(|_| pool.alloc(4096).unwrap()).collect();
        drop(held);
        // One region per pass until only the minimum remains.
        for _ in 0..8 {
            pool.reclaim_idle();
        }
        let stats = &pool.slab_stats()[0];
        assert_eq!(stats.total_blocks, 2);
        assert_eq!(stats.regions, 1);
        // The surviving minimum region still serves allocations.
        let buf = pool.alloc(1).unwrap();
        assert!(buf.from_pool());
    }

    #[test]
    fn reclaim_frees_one_region_per_pass() {
        let pool = small_pool();
        let held: Vec<_> = (0..8).map(|_| pool.alloc(4096).unwrap()).collect();
        drop(held);
        let before = pool.slab_stats()[0].regions;
        pool.reclaim_idle();
        let after = pool.slab_stats()[0].regions;
        assert_eq!(before - after, 1);
    }

    #[test]
    fn buffers_outlive_reclamation() {
        let pool = small_pool();
        let mut buf = pool.alloc(16).unwrap();
        buf.as_mut_slice().fill(0xab);
        pool.reclaim_idle();
        assert!(buf.as_slice().iter().all(|b| *b == 0xab));
    }

    #[test]
    fn zero_sized_heap_buffer() {
        let buf = IoBuffer::heap(0).unwrap();
        assert!(buf.is_empty());
        assert!(buf.as_slice().is_empty());
    }
}
