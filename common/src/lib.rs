//! dtf Common Library
//!
//! This crate provides the pieces shared by the on-device agent and the controller
//! that drives it. It includes:
//!
//! - Protocol definitions (command bytes, response codes, field widths)
//! - Unix domain socket helpers (abstract and filesystem addresses, peer credentials)
//! - The chunked transfer engine and the wire integer codecs
//! - Error types for protocol and transfer failures
//!
//! # Wire format
//!
//! Every exchange starts with a single command byte (`'d'`, `'u'` or `'e'`) followed
//! by a fixed per-command sequence of status bytes, NUL padded text fields, big-endian
//! lengths and chunked payloads. See [`protocol`] and [`transfer`].

/// Socket naming and address handling
pub mod config;

/// Error types for the wire protocol
pub mod error;

/// Unix domain socket helpers
#[cfg(unix)]
pub mod platform_socket;

/// Command bytes, response codes and field widths
pub mod protocol;

/// Chunked transfer engine and wire codecs
pub mod transfer;

// Re-export commonly used types for convenience
pub use config::{SocketAddress, SOCKET_NAME};
pub use error::{ProtocolError, TransferError};
#[cfg(unix)]
pub use platform_socket::{PeerCredentials, PlatformListener};
pub use protocol::{Command, ResponseCode};
