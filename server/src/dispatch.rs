//! Protocol dispatcher.
//!
//! One connection runs through `AwaitCommand -> Authenticated(..) -> Complete`:
//! the peer is authenticated before a single byte is read, the command byte picks a
//! handler, the handler acknowledges with `Ok` and runs its fixed exchange. The
//! caller closes the connection afterwards, whatever the result.

use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::Path,
};

use dtf_common::{
    protocol::{COMMAND_WIDTH, FILENAME_WIDTH},
    transfer::{
        copy_exact, read_byte, read_len64, read_text_field, to_len32, to_len64, write_len32,
        write_len64, write_status,
    },
    Command, PeerCredentials, ResponseCode, TransferError,
};
use nix::unistd::{access, AccessFlags};

use crate::{
    auth::{Decision, PeerPolicy},
    executor::ShellExecutor,
};

/// An accepted connection and the identity of its peer
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    peer:   PeerCredentials,
}

impl<S> Connection<S> {
    pub fn new(stream: S, peer: PeerCredentials) -> Self {
        Self { stream, peer }
    }

    pub fn peer(&self) -> &PeerCredentials {
        &self.peer
    }

    pub fn into_stream(self) -> S {
        self.stream
    }
}

/// How a connection ended, short of a transfer failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Peer failed authentication; nothing was read or written
    Denied,
    /// An error code was sent and the exchange stopped there
    Rejected(Command, ResponseCode),
    /// Peer answered a readiness check with something other than `Ok`
    Declined(Command),
    /// The exchange ran to the end
    Completed(Command, u64),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied => f.write_str("denied"),
            Self::Rejected(cmd, code) => write!(f, "{cmd} rejected with {code}"),
            Self::Declined(cmd) => write!(f, "{cmd} declined by peer"),
            Self::Completed(cmd, bytes) => write!(f, "{cmd} completed, {bytes} bytes"),
        }
    }
}

/// Routes authenticated connections to the download, upload and execute handlers
#[derive(Debug, Clone)]
pub struct Dispatcher {
    policy:   PeerPolicy,
    executor: ShellExecutor,
}

impl Dispatcher {
    pub fn new(policy: PeerPolicy, executor: ShellExecutor) -> Self {
        Self { policy, executor }
    }

    /// Runs one connection's exchange to completion
    pub fn serve<S: Read + Write>(&self, conn: &mut Connection<S>) -> Result<Outcome, TransferError> {
        match self.policy.authorize(&conn.peer) {
            Decision::Deny => {
                tracing::warn!(
                    "Unauthenticated attempt to access the agent socket (uid={}, gid={}, pid={:?})",
                    conn.peer.uid,
                    conn.peer.gid,
                    conn.peer.pid
                );
                return Ok(Outcome::Denied);
            }
            Decision::Allow(grant) => {
                tracing::info!("New connection from {:?} (pid={:?})", grant, conn.peer.pid);
            }
        }

        let stream = &mut conn.stream;
        let command = Command::from_byte(read_byte(stream)?);

        let handler: fn(&Self, &mut S) -> Result<Outcome, TransferError> = match command {
            Command::Download => Self::download,
            Command::Upload => Self::upload,
            Command::Execute => Self::execute,
            Command::Unknown(byte) => {
                tracing::error!("Unknown command byte {:#04x}", byte);
                return reject(stream, command, ResponseCode::GenericError);
            }
        };

        tracing::debug!("{} invoked", command);
        write_status(stream, ResponseCode::Ok)?;
        handler(self, stream)
    }

    /// Sends a device file to the peer
    fn download<S: Read + Write>(&self, stream: &mut S) -> Result<Outcome, TransferError> {
        let command = Command::Download;
        let filename = read_text_field(stream, FILENAME_WIDTH)?;
        tracing::debug!("Request to download: {}", filename);

        let path = Path::new(&filename);
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::error!("File {:?} doesn't exist: {}", filename, e);
                return reject(stream, command, ResponseCode::NotFound);
            }
        };
        if metadata.is_dir() {
            tracing::error!("{:?} is a directory", filename);
            return reject(stream, command, ResponseCode::NoReadPermission);
        }
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                tracing::error!("No read permission on {:?}: {}", filename, e);
                return reject(stream, command, ResponseCode::NoReadPermission);
            }
        };

        let len = metadata.len();
        tracing::debug!("File size: {}", len);
        write_len64(stream, to_len64(len)?)?;
        stream.flush()?;

        if !peer_ready(stream)? {
            tracing::error!("Client is not willing to receive file");
            return Ok(Outcome::Declined(command));
        }

        copy_exact(&mut file, stream, len)?;
        log_acknowledgement(stream, "Transfer");
        Ok(Outcome::Completed(command, len))
    }

    /// Receives a file from the peer
    fn upload<S: Read + Write>(&self, stream: &mut S) -> Result<Outcome, TransferError> {
        let command = Command::Upload;
        let declared = read_len64(stream)?;
        let len = match u64::try_from(declared) {
            Ok(len) => len,
            Err(_) => {
                tracing::error!("Invalid file size {}", declared);
                return reject(stream, command, ResponseCode::GenericError);
            }
        };
        tracing::debug!("File size: {}", len);
        write_status(stream, ResponseCode::Ok)?;

        let filename = read_text_field(stream, FILENAME_WIDTH)?;
        tracing::debug!("Request to upload: {}", filename);
        let path = Path::new(&filename);

        if fs::symlink_metadata(path).is_ok() {
            tracing::error!("File {:?} already exists", filename);
            return reject(stream, command, ResponseCode::AlreadyExists);
        }
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if let Err(e) = access(parent, AccessFlags::W_OK) {
            tracing::error!("No write permission on {}: {}", parent.display(), e);
            return reject(stream, command, ResponseCode::NoWritePermission);
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) => {
                tracing::error!("Cannot create {:?}: {}", filename, e);
                return reject(stream, command, create_error_code(&e));
            }
        };

        tracing::debug!("Ready to receive file");
        write_status(stream, ResponseCode::Ok)?;

        let received = copy_exact(stream, &mut file, len).and_then(|n| {
            file.sync_all()?;
            Ok(n)
        });
        if let Err(e) = received {
            tracing::error!("Error receiving {:?}: {}", filename, e);
            drop(file);
            if let Err(rm) = fs::remove_file(path) {
                tracing::warn!("Failed to remove partial upload {:?}: {}", filename, rm);
            }
            // The peer may already be gone
            let _ = write_status(stream, ResponseCode::GenericError);
            return Err(e);
        }

        tracing::debug!("Successfully uploaded {:?}", filename);
        write_status(stream, ResponseCode::Ok)?;
        Ok(Outcome::Completed(command, len))
    }

    /// Runs a shell command and sends its output
    fn execute<S: Read + Write>(&self, stream: &mut S) -> Result<Outcome, TransferError> {
        let command = Command::Execute;
        let command_text = read_text_field(stream, COMMAND_WIDTH)?;
        tracing::debug!("Request execute: {}", command_text);

        let output = self.executor.execute(&command_text).unwrap_or_else(|e| {
            tracing::warn!("Command could not be run, replying with empty output: {}", e);
            String::new()
        });

        let len = to_len32(output.len() as u64)?;
        tracing::debug!("Length of the output: {}", len);
        write_len32(stream, len)?;
        stream.flush()?;

        if !peer_ready(stream)? {
            tracing::error!("Client doesn't want the output");
            return Ok(Outcome::Declined(command));
        }
        if len == 0 {
            tracing::debug!("No output to send");
            return Ok(Outcome::Completed(command, 0));
        }

        let mut source = output.as_bytes();
        copy_exact(&mut source, stream, u64::from(len))?;
        log_acknowledgement(stream, "Output");
        Ok(Outcome::Completed(command, u64::from(len)))
    }
}

fn reject<W: Write>(stream: &mut W, command: Command, code: ResponseCode) -> Result<Outcome, TransferError> {
    write_status(stream, code)?;
    Ok(Outcome::Rejected(command, code))
}

/// Reads the peer's readiness byte
fn peer_ready<R: Read>(stream: &mut R) -> Result<bool, TransferError> {
    let status = read_byte(stream)?;
    if status != ResponseCode::Ok.as_byte() {
        tracing::debug!("Peer answered readiness check with {:#04x}", status);
    }
    Ok(status == ResponseCode::Ok.as_byte())
}

/// The closing acknowledgement is informational; a missing one is not a failure
fn log_acknowledgement<R: Read>(stream: &mut R, what: &str) {
    match read_byte(stream) {
        Ok(status) if status == ResponseCode::Ok.as_byte() => {
            tracing::debug!("{} completed successfully", what)
        }
        Ok(status) => tracing::error!("{} acknowledged with {:#04x}", what, status),
        Err(e) => tracing::warn!("{} sent, no acknowledgement: {}", what, e),
    }
}

fn create_error_code(e: &io::Error) -> ResponseCode {
    match e.kind() {
        io::ErrorKind::AlreadyExists => ResponseCode::AlreadyExists,
        io::ErrorKind::PermissionDenied | io::ErrorKind::NotFound => ResponseCode::NoWritePermission,
        _ => ResponseCode::GenericError,
    }
}
