use std::{
    fs::{self, File, Permissions},
    io::{self, Read, Write},
    os::unix::{fs::PermissionsExt, net::UnixStream},
    path::Path,
    time::Duration,
};

use dtf_common::{
    platform_socket,
    protocol::{COMMAND_WIDTH, FILENAME_WIDTH},
    transfer::{
        copy_exact, pad_field, read_byte, read_len32_reply, read_len64_reply, to_len64,
        write_len64, write_status, Reply,
    },
    Command, ProtocolError, ResponseCode, SocketAddress, TransferError,
};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::digest::{HashingReader, HashingWriter};

/// Errors seen by the controller
#[derive(Error, Debug)]
pub enum ClientError {
    /// The agent socket could not be reached
    #[error("failed to connect to the agent: {0:#}")]
    Connect(anyhow::Error),

    /// The agent closed the connection without answering the command byte,
    /// which is what an unauthorized peer sees
    #[error("agent closed the connection without a response")]
    Closed,

    /// The agent reported a failure code
    #[error("agent answered {0}")]
    Server(ResponseCode),

    /// A status byte outside the response-code set
    #[error("agent sent unexpected status byte {0:#04x}")]
    UnexpectedStatus(u8),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Local file handling failed
    #[error("{context}: {source}")]
    Local {
        context: String,
        #[source]
        source:  io::Error,
    },
}

impl ClientError {
    /// The response code behind a [`ClientError::Server`]
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            Self::Server(code) => Some(*code),
            _ => None,
        }
    }

    fn local(context: impl Into<String>, source: io::Error) -> Self {
        Self::Local {
            context: context.into(),
            source,
        }
    }
}

fn status_error(byte: u8) -> ClientError {
    match ResponseCode::from_byte(byte) {
        Ok(code) => ClientError::Server(code),
        Err(_) => ClientError::UnexpectedStatus(byte),
    }
}

/// Reads one status byte and turns anything but `Ok` into an error
fn expect_ok<R: Read>(stream: &mut R) -> Result<(), ClientError> {
    match read_byte(stream)? {
        0 => Ok(()),
        other => Err(status_error(other)),
    }
}

/// Result of a file transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// Bytes moved
    pub bytes:  u64,
    /// Lowercase hex SHA-256 of the content
    pub sha256: String,
}

/// Configuration for the controller client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Agent socket to connect to
    pub address:  SocketAddress,
    /// Tried when `address` cannot be reached
    pub fallback: Option<SocketAddress>,
    /// Read/write timeout per connection, none by default
    pub timeout:  Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        // Agents on systems without the abstract namespace listen on /tmp/dtf_socket
        let address = SocketAddress::from_env();
        let fallback = (address.is_abstract() && address == SocketAddress::default())
            .then(SocketAddress::filesystem_fallback);
        Self {
            address,
            fallback,
            timeout: None,
        }
    }
}

impl ClientConfig {
    /// Creates a client configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the agent socket address. An explicit address has no fallback.
    pub fn with_address(mut self, address: SocketAddress) -> Self {
        self.address = address;
        self.fallback = None;
        self
    }

    /// Set the address tried when the primary one cannot be reached
    pub fn with_fallback(mut self, fallback: Option<SocketAddress>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Set the per-connection timeout
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Drives the agent: one connection per operation, as the agent expects
#[derive(Debug, Clone)]
pub struct DeviceClient {
    config: ClientConfig,
}

impl DeviceClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Creates a client with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ClientConfig::default())
    }

    pub fn address(&self) -> &SocketAddress {
        &self.config.address
    }

    fn connect(&self) -> Result<UnixStream, ClientError> {
        let primary = match platform_socket::connect(&self.config.address) {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };
        let Some(fallback) = &self.config.fallback else {
            return Err(ClientError::Connect(primary));
        };

        tracing::debug!("{:#}, trying {}", primary, fallback);
        platform_socket::connect(fallback).map_err(ClientError::Connect)
    }

    /// Connects, sends the command byte and waits for the agent's acknowledgement
    fn open(&self, command: Command) -> Result<UnixStream, ClientError> {
        let mut stream = self.connect()?;
        if self.config.timeout.is_some() {
            stream
                .set_read_timeout(self.config.timeout)
                .and_then(|()| stream.set_write_timeout(self.config.timeout))
                .map_err(|e| ClientError::local("Failed to set socket timeouts", e))?;
        }

        tracing::debug!("Sending {} command", command);
        let acknowledged = stream
            .write_all(&[command.as_byte()])
            .map_err(|e| ClientError::Transfer(e.into()))
            .and_then(|()| expect_ok(&mut stream));

        match acknowledged {
            Err(ClientError::Transfer(e)) if e.is_disconnect() => Err(ClientError::Closed),
            Err(e) => {
                tracing::error!("Agent rejected {} request", command);
                Err(e)
            }
            Ok(()) => Ok(stream),
        }
    }

    /// Downloads `remote` into `sink`, returning the byte count
    pub fn download_to<W: Write>(&self, remote: &str, sink: &mut W) -> Result<u64, ClientError> {
        let filename = pad_field(remote, FILENAME_WIDTH, "filename")?;
        let mut stream = self.open(Command::Download)?;

        tracing::debug!("Sending filename {:?}", remote);
        stream.write_all(&filename).map_err(TransferError::from)?;

        let declared = match read_len64_reply(&mut stream)? {
            Reply::Value(len) => len,
            Reply::Status(byte) => return Err(status_error(byte)),
        };
        let len = u64::try_from(declared).map_err(|_| ProtocolError::NegativeLength(declared))?;
        tracing::debug!("File size from agent: {}", len);

        write_status(&mut stream, ResponseCode::Ok)?;
        copy_exact(&mut stream, sink, len)?;
        write_status(&mut stream, ResponseCode::Ok)?;

        tracing::debug!("Transfer complete");
        Ok(len)
    }

    /// Downloads `remote` to the local path `local`.
    ///
    /// The content is staged in a temporary file next to `local` and only moved into
    /// place once the whole transfer succeeded, so a failed pull leaves `local` as it was.
    pub fn download(&self, remote: &str, local: &Path) -> Result<Transfer, ClientError> {
        let dir = match local.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let staging = NamedTempFile::new_in(dir).map_err(|e| {
            ClientError::local(format!("Failed to create a staging file in {}", dir.display()), e)
        })?;

        let mut sink = HashingWriter::new(staging);
        let bytes = self.download_to(remote, &mut sink)?;
        let (staging, sha256) = sink.finish();

        // Staging files are private; keep the mode of a file being replaced
        let permissions = fs::metadata(local)
            .map(|m| m.permissions())
            .unwrap_or_else(|_| Permissions::from_mode(0o644));
        staging
            .as_file()
            .set_permissions(permissions)
            .map_err(|e| ClientError::local("Failed to set permissions on the staging file", e))?;
        staging.persist(local).map_err(|e| {
            ClientError::local(format!("Failed to move the download to {}", local.display()), e.error)
        })?;

        Ok(Transfer { bytes, sha256 })
    }

    /// Uploads exactly `len` bytes from `source` to `remote`
    pub fn upload_from<R: Read>(&self, source: &mut R, len: u64, remote: &str) -> Result<u64, ClientError> {
        let filename = pad_field(remote, FILENAME_WIDTH, "filename")?;
        let declared = to_len64(len)?;
        let mut stream = self.open(Command::Upload)?;

        tracing::debug!("Sending file size {}", len);
        write_len64(&mut stream, declared)?;
        expect_ok(&mut stream)?;

        tracing::debug!("Sending filename {:?}", remote);
        stream.write_all(&filename).map_err(TransferError::from)?;
        expect_ok(&mut stream)?;

        copy_exact(source, &mut stream, len)?;
        expect_ok(&mut stream)?;

        tracing::debug!("Upload complete");
        Ok(len)
    }

    /// Uploads the local file `local` to `remote`
    pub fn upload(&self, local: &Path, remote: &str) -> Result<Transfer, ClientError> {
        let file = File::open(local)
            .map_err(|e| ClientError::local(format!("Failed to open {}", local.display()), e))?;
        let len = file
            .metadata()
            .map_err(|e| ClientError::local(format!("Failed to stat {}", local.display()), e))?
            .len();

        let mut source = HashingReader::new(file);
        let bytes = self.upload_from(&mut source, len, remote)?;
        Ok(Transfer {
            bytes,
            sha256: source.finish(),
        })
    }

    /// Runs `command` on the device and returns its standard output
    pub fn execute(&self, command: &str) -> Result<String, ClientError> {
        let command_field = pad_field(command, COMMAND_WIDTH, "command")?;
        let mut stream = self.open(Command::Execute)?;

        tracing::debug!("Sending command {:?}", command);
        stream.write_all(&command_field).map_err(TransferError::from)?;

        let len = match read_len32_reply(&mut stream)? {
            Reply::Value(len) => len,
            Reply::Status(byte) => return Err(status_error(byte)),
        };

        write_status(&mut stream, ResponseCode::Ok)?;
        if len == 0 {
            tracing::debug!("Response is empty");
            return Ok(String::new());
        }

        let mut output = Vec::new();
        copy_exact(&mut stream, &mut output, u64::from(len))?;
        write_status(&mut stream, ResponseCode::Ok)?;

        Ok(String::from_utf8_lossy(&output).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn over_wide_fields_fail_before_connecting() {
        // Nothing listens here; the width check must come first
        let client = DeviceClient::new(
            ClientConfig::new().with_address(SocketAddress::parse("/nonexistent/dtf.sock")),
        );

        let err = client.execute(&"x".repeat(COMMAND_WIDTH + 1)).unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::FieldTooLong { width: COMMAND_WIDTH, .. })
        ));

        let mut sink = Vec::new();
        let err = client
            .download_to(&"/".repeat(FILENAME_WIDTH + 1), &mut sink)
            .unwrap_err();
        assert!(matches!(err, ClientError::Protocol(ProtocolError::FieldTooLong { .. })));
    }

    #[test]
    fn unreachable_agent_is_a_connect_error() {
        let client = DeviceClient::new(
            ClientConfig::new().with_address(SocketAddress::parse("/nonexistent/dtf.sock")),
        );
        assert!(matches!(client.execute("id"), Err(ClientError::Connect(_))));
    }

    #[test]
    fn failed_pull_leaves_an_existing_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("important");
        fs::write(&local, b"precious").unwrap();

        let client = DeviceClient::new(
            ClientConfig::new().with_address(SocketAddress::parse("/nonexistent/dtf.sock")),
        );
        assert!(matches!(
            client.download("/remote/file", &local),
            Err(ClientError::Connect(_))
        ));

        assert_eq!(fs::read(&local).unwrap(), b"precious");
        // No staging file is left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn explicit_address_drops_the_fallback() {
        let config = ClientConfig::new()
            .with_fallback(Some(SocketAddress::filesystem_fallback()))
            .with_address(SocketAddress::parse("@custom"));
        assert_eq!(config.fallback, None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn default_abstract_address_falls_back_to_the_socket_file() {
        if std::env::var_os(dtf_common::config::SOCKET_ENV).is_some() {
            return;
        }
        let config = ClientConfig::default();
        assert!(config.address.is_abstract());
        assert_eq!(config.fallback, Some(SocketAddress::filesystem_fallback()));
    }

    #[test]
    fn status_bytes_map_to_codes() {
        assert_eq!(
            status_error(0xfd).response_code(),
            Some(ResponseCode::AlreadyExists)
        );
        assert!(matches!(status_error(0x42), ClientError::UnexpectedStatus(0x42)));
    }
}
