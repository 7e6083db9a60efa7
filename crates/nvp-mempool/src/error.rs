//! Pool construction and allocation errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MempoolError {
    /// A slab with this block size is already registered.
    #[error("slab with block size {0} already exists")]
    DuplicateSlab(usize),

    /// Slabs must have a non-zero block size and maximum.
    #[error("invalid slab parameters: block_size {block_size}, max {max_blocks}")]
    InvalidSlab { block_size: usize, max_blocks: usize },

    /// The slab-manager thread could not be spawned.
    #[error("failed to create slab-manager thread: {0}")]
    ManagerThread(#[source] std::io::Error),
}
