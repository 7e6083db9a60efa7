//! Client-side errors.

use nvp_msg::errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] nvp_transport::TransportError),

    #[error(transparent)]
    Msg(#[from] nvp_msg::MsgError),

    /// The server answered with `retval = -1`; carries the reply's errno.
    #[error("server replied errno {0}")]
    Remote(i32),

    /// The submit window stayed full for the whole wait bound.
    #[error("request queue is busy")]
    QueueBusy,

    /// Control-plane call on a dead session.
    #[error("not connected")]
    NotConnected,

    /// The connection died and the request cannot be recovered.
    #[error("connection error")]
    ConnectionError,

    #[error("operation timed out")]
    Timeout,

    #[error("operation not supported")]
    NotSupported,

    #[error("buffer allocation failed")]
    OutOfMemory,

    #[error("client is shutting down")]
    ShuttingDown,
}

impl Error {
    /// errno-style code for the C-shaped surface.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::Transport(_) | Error::ConnectionError => errno::EIO,
            Error::Msg(_) => errno::EBADMSG,
            Error::Remote(e) => *e,
            Error::QueueBusy => errno::EBUSY,
            Error::NotConnected => errno::ENOTCONN,
            Error::Timeout => errno::ETIMEDOUT,
            Error::NotSupported => errno::ENOSYS,
            Error::OutOfMemory => errno::ENOMEM,
            Error::ShuttingDown => errno::EIO,
        }
    }
}
