//! NVP volume client.
//!
//! Asynchronous block I/O against a remote volume server, with optional
//! transparent failover. A [`Client`] owns one connected context (a
//! dedicated event-loop thread); submits return a [`Completion`] that can
//! be waited on or paired with a callback running on the completion
//! dispatcher. Control-plane calls (volume and snapshot management) are
//! synchronous and use short-lived connections.
//!
//! ```no_run
//! use nvp::{Client, ClientConfig};
//!
//! # fn main() -> nvp::Result<()> {
//! let client = Client::connect("tcp://127.0.0.1:21321", &ClientConfig::default())?;
//! client.create_volume("v1", 1 << 20)?;
//! client.open_volume("v1")?;
//! let buf = client.allocate_buffer(4096)?;
//! let read = client.aio_read(buf, 0)?;
//! assert_eq!(read.wait()?, 4096);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod completion;
mod control;
mod core;
mod dispatcher;
mod error;
mod ha;
mod request;

pub use client::{Client, ClientConfig};
pub use completion::Completion;
pub use error::Error;

pub use nvp_mempool::IoBuffer;
pub use nvp_msg as msg;
pub use nvp_transport as transport;

/// NVP client result type
pub type Result<T> = std::result::Result<T, Error>;
