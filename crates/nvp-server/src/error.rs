//! Server-side errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind server: {0}")]
    Bind(#[source] nvp_transport::TransportError),

    #[error(transparent)]
    Transport(#[from] nvp_transport::TransportError),

    #[error("failed to create memory pool: {0}")]
    Mempool(#[from] nvp_mempool::MempoolError),

    /// The work-queue worker threads could not be spawned.
    #[error("failed to create work-queue threads: {0}")]
    WorkQueueThreads(#[source] std::io::Error),
}
