//! Wire messages and opcodes for the NVP volume protocol.
//!
//! A message is a msgpack-encoded tuple of nine fields (see [`Message`]).
//! Framing is not handled here: the codec is length-agnostic and the
//! transport carries the length prefix and any bulk-data iovec.

#![forbid(unsafe_code)]

mod error;
mod message;
mod names;
mod opcode;

pub mod errno;

pub use error::MsgError;
pub use message::Message;
pub use names::{pack_names, unpack_names};
pub use opcode::Opcode;

/// NVP message result type
pub type Result<T> = std::result::Result<T, MsgError>;
