//! Length framing and TCP plumbing for the NVP protocol.
//!
//! A frame is a header iovec plus an optional data iovec; the codec here
//! carries both over a stream transport behind a length prefix. Connection
//! establishment applies the configured TCP keepalive, and endpoint
//! addresses are `tcp://host:port` URIs passed through unchanged from the
//! caller.

pub mod config;
pub mod error;
pub mod frame;
pub mod tcp;
pub mod uri;

pub use config::{KeepaliveConfig, env_or_default};
pub use error::TransportError;
pub use frame::{DataBuf, Frame, FrameCodec};
pub use tcp::{connect, listen};
pub use uri::Uri;

/// Transport result type
pub type Result<T> = std::result::Result<T, TransportError>;
