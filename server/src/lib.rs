//! dtf Agent Server
//!
//! The on-device half of the dtf harness. A privileged controller connects over a
//! local Unix socket and can:
//!
//! - download files from the device
//! - upload files onto the device
//! - execute shell commands and fetch their output
//!
//! Only root and the `shell` user are let in, based on the credentials the kernel
//! reports for the connecting process. Connections are served one at a time.
//!
//! # Example
//!
//! ```no_run
//! use dtf_server::{ServerConfig, Supervisor};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut supervisor = Supervisor::new(ServerConfig::new().with_env_overrides());
//! supervisor.start()?;
//! // ...
//! supervisor.restart()?;
//! supervisor.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod executor;
pub mod logging;
pub mod server;
pub mod supervisor;

pub use auth::{Decision, Grant, PeerPolicy};
pub use config::ServerConfig;
pub use dispatch::{Connection, Dispatcher, Outcome};
pub use executor::{ExecutionError, ShellExecutor};
pub use server::{IpcServer, ServerHandle};
pub use supervisor::{Supervisor, Trigger};
