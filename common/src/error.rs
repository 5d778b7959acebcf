//! Errors
//!
//! Failures of the wire protocol itself, built with [`thiserror`]. File-system
//! conditions the protocol reports to the peer are not errors here, they travel as
//! [`crate::ResponseCode`] values.

use std::io;

use thiserror::Error;

/// A stream-level failure while moving bytes. Aborts the current connection.
#[derive(Error, Debug)]
pub enum TransferError {
    /// The peer closed the stream before the declared byte count arrived
    #[error("stream ended after {received} of {expected} bytes")]
    UnexpectedEof {
        /// Bytes the transfer was supposed to carry
        expected: u64,
        /// Bytes actually received before end-of-stream
        received: u64,
    },

    /// A length that cannot be represented in its wire field
    #[error("length {0} does not fit its wire field")]
    LengthOverflow(u64),

    /// Underlying read or write failure
    #[error("i/o error during transfer: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// True when the peer simply went away, as opposed to a local failure.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::UnexpectedEof { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            Self::LengthOverflow(_) => false,
        }
    }
}

/// Malformed or out-of-range protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// First byte of a connection is not a known command
    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),

    /// A status byte outside the response-code set
    #[error("unknown response code {0}")]
    UnknownResponse(i8),

    /// Text that does not fit its fixed-width field
    #[error("{field} is {len} bytes, wider than its {width}-byte field")]
    FieldTooLong {
        /// Field name, for diagnostics
        field: &'static str,
        /// Encoded length of the value
        len:   usize,
        /// Fixed width of the field on the wire
        width: usize,
    },

    /// An upload length below zero
    #[error("negative transfer length {0}")]
    NegativeLength(i64),
}
