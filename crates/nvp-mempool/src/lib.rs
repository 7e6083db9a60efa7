//! Slab-based registered-memory pool.
//!
//! I/O buffers for the data iovec come from here: a pool of size-classed
//! slabs, each carving fixed-size blocks out of contiguous pinned regions.
//! Slabs grow lazily in `quantum`-sized regions up to a bounded maximum, and
//! a background manager thread periodically reclaims idle regions. When a
//! size class is exhausted, callers fall back to a plain aligned heap
//! allocation through [`MemPool::alloc_or_heap`].

mod buffer;
mod error;
mod pool;
mod slab;

pub use buffer::IoBuffer;
pub use error::MempoolError;
pub use pool::{MemPool, MemPoolBuilder, SlabStats};

/// Mempool result type
pub type Result<T> = std::result::Result<T, MempoolError>;
