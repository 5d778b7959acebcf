use std::fmt;

use crate::error::ProtocolError;

/// Width of the NUL padded filename field
pub const FILENAME_WIDTH: usize = 256;

/// Width of the NUL padded shell command field
pub const COMMAND_WIDTH: usize = 512;

/// Largest chunk moved per read/write during bulk transfers
pub const CHUNK_SIZE: usize = 1024;

/// Width of file and payload lengths
pub const SIZE_LONG: usize = 8;

/// Width of the command output length
pub const SIZE_INTEGER: usize = 4;

/// Command selected by the first byte of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Send a device file to the peer
    Download,
    /// Receive a file from the peer
    Upload,
    /// Run a shell command and return its output
    Execute,
    /// Any other byte
    Unknown(u8),
}

impl Command {
    /// Wire byte for [`Command::Download`]
    pub const DOWNLOAD: u8 = b'd';
    /// Wire byte for [`Command::Upload`]
    pub const UPLOAD: u8 = b'u';
    /// Wire byte for [`Command::Execute`]
    pub const EXECUTE: u8 = b'e';

    pub fn from_byte(byte: u8) -> Self {
        match byte {
            Self::DOWNLOAD => Self::Download,
            Self::UPLOAD => Self::Upload,
            Self::EXECUTE => Self::Execute,
            other => Self::Unknown(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Download => Self::DOWNLOAD,
            Self::Upload => Self::UPLOAD,
            Self::Execute => Self::EXECUTE,
            Self::Unknown(byte) => byte,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Download => f.write_str("download"),
            Self::Upload => f.write_str("upload"),
            Self::Execute => f.write_str("execute"),
            Self::Unknown(byte) => write!(f, "unknown({byte:#04x})"),
        }
    }
}

/// Status written as a single signed byte at each protocol checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum ResponseCode {
    Ok = 0,
    GenericError = 1,
    NotFound = -1,
    NoReadPermission = -2,
    AlreadyExists = -3,
    NoWritePermission = -4,
}

impl ResponseCode {
    /// The code as it appears on the wire.
    pub fn as_byte(self) -> u8 {
        self as i8 as u8
    }

    /// Decodes a wire byte, rejecting values outside the code set.
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        Self::try_from(byte as i8)
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl TryFrom<i8> for ResponseCode {
    type Error = ProtocolError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::GenericError),
            -1 => Ok(Self::NotFound),
            -2 => Ok(Self::NoReadPermission),
            -3 => Ok(Self::AlreadyExists),
            -4 => Ok(Self::NoWritePermission),
            other => Err(ProtocolError::UnknownResponse(other)),
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Ok => "ok",
            Self::GenericError => "error",
            Self::NotFound => "no such file",
            Self::NoReadPermission => "no read permission",
            Self::AlreadyExists => "file already exists",
            Self::NoWritePermission => "no write permission",
        };
        write!(f, "{text} ({})", *self as i8)
    }
}
