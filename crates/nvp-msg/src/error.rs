//! Message-level errors.

use thiserror::Error;

/// Errors raised while packing or unpacking wire messages.
#[derive(Error, Debug)]
pub enum MsgError {
    /// The header bytes do not decode into a message tuple.
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] rmp_serde::decode::Error),

    /// The opcode field carries a value outside the protocol enum.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    /// Encoding failed; only possible on resource exhaustion.
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// A list payload is not a sequence of NUL-terminated names.
    #[error("malformed name list")]
    MalformedNameList,
}
