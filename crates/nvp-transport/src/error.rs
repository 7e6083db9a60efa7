//! Transport-level errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing violation; fatal for the connection that produced it.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("invalid endpoint uri '{0}'")]
    InvalidUri(String),

    #[error("unsupported uri scheme '{0}'")]
    UnsupportedScheme(String),

    /// The endpoint did not resolve to a usable address.
    #[error("cannot resolve '{0}'")]
    Unresolvable(String),
}
