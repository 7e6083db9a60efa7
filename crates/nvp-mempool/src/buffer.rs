//! RAII I/O buffers: pool-backed with a plain aligned heap fallback.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::pool::PoolShared;
use crate::slab::{MemBlock, REGION_ALIGN};

/// Aligned heap allocation used when no slab can serve a request.
struct HeapBuf {
    ptr: Option<NonNull<u8>>,
    layout: Layout,
}

// SAFETY: sole owner of its allocation.
unsafe impl Send for HeapBuf {}

impl HeapBuf {
    fn new(size: usize) -> Option<HeapBuf> {
        if size == 0 {
            return Some(HeapBuf {
                ptr: None,
                layout: Layout::new::<u8>(),
            });
        }
        let layout = Layout::from_size_align(size, REGION_ALIGN).ok()?;
        // SAFETY: non-zero size.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        Some(HeapBuf {
            ptr: Some(ptr),
            layout,
        })
    }
}

impl Drop for HeapBuf {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr {
            // SAFETY: ptr/layout are exactly what alloc_zeroed returned.
            unsafe { dealloc(ptr.as_ptr(), self.layout) }
        }
    }
}

enum Storage {
    Pooled {
        block: Option<MemBlock>,
        pool: Arc<PoolShared>,
    },
    Heap(HeapBuf),
}

/// A data-iovec buffer.
///
/// Either a block borrowed from the registered-memory pool or, when the
/// suitable size class is exhausted, an aligned heap allocation. Pool blocks
/// go back to their slab when the buffer is dropped.
pub struct IoBuffer {
    storage: Storage,
    len: usize,
}

impl IoBuffer {
    pub(crate) fn pooled(block: MemBlock, pool: Arc<PoolShared>, len: usize) -> IoBuffer {
        debug_assert!(len <= block.len());
        IoBuffer {
            storage: Storage::Pooled {
                block: Some(block),
                pool,
            },
            len,
        }
    }

    /// A heap-backed buffer of `len` bytes, zero-filled; `None` when the
    /// allocation itself fails.
    pub fn heap(len: usize) -> Option<IoBuffer> {
        Some(IoBuffer {
            storage: Storage::Heap(HeapBuf::new(len)?),
            len,
        })
    }

    /// Whether this buffer came out of the pool; heap fallbacks report
    /// `false`.
    pub fn from_pool(&self) -> bool {
        matches!(self.storage, Storage::Pooled { .. })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Usable capacity; at least `len`, more for pool blocks of a larger
    /// size class.
    pub fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Pooled { block, .. } => block.as_ref().map_or(0, MemBlock::len),
            Storage::Heap(_) => self.len,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            Storage::Pooled { block, .. } => {
                let block = block.as_ref().expect("block present until drop");
                // SAFETY: the block is exclusively ours and len <= block len.
                unsafe { std::slice::from_raw_parts(block.as_ptr(), self.len) }
            }
            Storage::Heap(heap) => match heap.ptr {
                // SAFETY: exclusive heap allocation of at least len bytes.
                Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len) },
                None => &[],
            },
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Pooled { block, .. } => {
                let block = block.as_ref().expect("block present until drop");
                // SAFETY: &mut self guarantees exclusivity; len <= block len.
                unsafe { std::slice::from_raw_parts_mut(block.as_ptr(), self.len) }
            }
            Storage::Heap(heap) => match heap.ptr {
                // SAFETY: exclusive heap allocation of at least len bytes.
                Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.len) },
                None => &mut [],
            },
        }
    }

    /// Copies `src` into the buffer. `src` must fit.
    pub fn copy_from_slice(&mut self, src: &[u8]) {
        self.as_mut_slice()[..src.len()].copy_from_slice(src);
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        if let Storage::Pooled { block, pool } = &mut self.storage {
            if let Some(block) = block.take() {
                pool.free_block(block);
            }
        }
    }
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("len", &self.len)
            .field("from_pool", &self.from_pool())
            .finish()
    }
}
