//! The NVP server: accepts protocol connections, decodes requests on a
//! blocking worker pool, calls into a [`VolumeBackend`] and sends replies
//! with pool-backed data iovecs.
//!
//! The server consumes the backing filesystem/router only through the
//! narrow [`VolumeBackend`] trait; [`MemBackend`] is the in-memory
//! implementation used by tests and the demo server.

pub mod backend;
mod error;
mod handler;
pub mod mem_backend;
mod server;
mod work_queue;

pub use backend::{BackendError, BackendResult, VolumeBackend, VolumeIo};
pub use error::ServerError;
pub use mem_backend::MemBackend;
pub use server::{Server, ServerConfig, ServerHandle};
pub use work_queue::WorkQueue;

pub use nvp_mempool::{IoBuffer, MemPool};

/// Server result type
pub type Result<T> = std::result::Result<T, ServerError>;
