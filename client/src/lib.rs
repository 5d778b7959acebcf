//! dtf Controller Client Library
//!
//! Drives the on-device dtf agent over its local socket. Each operation opens its
//! own connection, as the agent serves exactly one command per connection.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use dtf_client::{ClientConfig, DeviceClient};
//!
//! # fn main() -> anyhow::Result<()> {
//! let client = DeviceClient::new(ClientConfig::new());
//!
//! let pulled = client.download("/system/build.prop", Path::new("build.prop"))?;
//! println!("{} bytes, sha256 {}", pulled.bytes, pulled.sha256);
//!
//! let output = client.execute("getprop ro.build.version.sdk")?;
//! println!("SDK: {}", output.trim());
//! # Ok(())
//! # }
//! ```

mod client;
mod digest;

pub use client::*;
pub use digest::{HashingReader, HashingWriter};
// Re-export important types from dtf-common for convenience
pub use dtf_common::{ResponseCode, SocketAddress, SOCKET_NAME};
