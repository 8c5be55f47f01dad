//! Block device error types
//!
//! Error types for the user-space block device server.

use std::io;

use thiserror::Error;

/// Block device result type
pub type BlockResult<T> = Result<T, BlockError>;

/// Block device error types
#[derive(Debug, Error)]
pub enum BlockError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A device-control call was rejected by the kernel
    #[error("{op} failed: {source}")]
    Control {
        /// Name of the control call
        op: &'static str,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Device node could not be opened
    #[error("Cannot open {path}, make sure the nbd kernel module is loaded: {source}")]
    DeviceOpen {
        /// Device node path
        path: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Invalid offset
    #[error("Invalid offset: {offset} (device size: {size})")]
    InvalidOffset {
        /// First byte of the rejected range
        offset: u64,
        /// Device size in bytes
        size: u64,
    },

    /// Read-only device
    #[error("Device is read-only")]
    ReadOnly,

    /// Device already connected or torn down
    #[error("Device is not in a connectable state: {0}")]
    InvalidState(&'static str),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unsupported feature
    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

impl BlockError {
    /// Wrap an OS error from a named control call
    pub fn control(op: &'static str, source: io::Error) -> Self {
        Self::Control { op, source }
    }

    /// Convert to NBD error code
    pub fn to_nbd_error(&self) -> NbdError {
        match self {
            BlockError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => NbdError::NoSuchDevice,
                io::ErrorKind::PermissionDenied => NbdError::Perm,
                io::ErrorKind::OutOfMemory => NbdError::NoMem,
                io::ErrorKind::InvalidInput => NbdError::Inval,
                _ => NbdError::Io,
            },
            BlockError::InvalidOffset { .. } => NbdError::Inval,
            BlockError::ReadOnly => NbdError::Rofs,
            BlockError::Unsupported(_) => NbdError::NotSup,
            _ => NbdError::Io,
        }
    }
}

/// NBD error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NbdError {
    /// Success
    Ok = 0,
    /// Permission denied
    Perm = 1,
    /// I/O error
    Io = 5,
    /// Out of memory
    NoMem = 12,
    /// Invalid argument
    Inval = 22,
    /// Function not implemented
    NotSup = 95,
    /// Device not found
    NoSuchDevice = 19,
    /// Read-only filesystem
    Rofs = 30,
}

impl NbdError {
    /// Code sent to the kernel whenever the backend reports a failure.
    pub const BACKEND_FAILURE: NbdError = NbdError::Perm;

    /// Get the error code
    pub fn code(&self) -> u32 {
        *self as u32
    }
}

impl std::fmt::Display for NbdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NbdError::Ok => write!(f, "Success"),
            NbdError::Perm => write!(f, "Permission denied"),
            NbdError::Io => write!(f, "I/O error"),
            NbdError::NoMem => write!(f, "Out of memory"),
            NbdError::Inval => write!(f, "Invalid argument"),
            NbdError::NotSup => write!(f, "Not supported"),
            NbdError::NoSuchDevice => write!(f, "No such device"),
            NbdError::Rofs => write!(f, "Read-only"),
        }
    }
}
