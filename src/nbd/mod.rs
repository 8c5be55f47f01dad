//! NBD (Network Block Device) kernel protocol
//!
//! Request and reply framing used between the Linux `nbd` driver and the
//! user-space server once a socket has been handed to the kernel with
//! `NBD_SET_SOCK`. There is no handshake on this path: the kernel starts
//! sending requests as soon as `NBD_DO_IT` runs.
//!
//! All header fields travel in network byte order (big-endian). The order is
//! fixed by the protocol and never depends on the host.

pub mod connection;
pub mod ioctl;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{BlockError, BlockResult, NbdError};

/// Magic carried by every request header
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
/// Magic carried by every reply header
pub const NBD_REPLY_MAGIC: u32 = 0x67446698;

/// Handle length (opaque cookie copied from request to reply)
pub const HANDLE_LEN: usize = 8;

/// Opaque correlation token assigned by the kernel
pub type Handle = [u8; HANDLE_LEN];

/// NBD transmission flags, as passed to `NBD_SET_FLAGS`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmissionFlags(u32);

impl TransmissionFlags {
    /// Has flags
    pub const HAS_FLAGS: u32 = 1 << 0;
    /// Read-only export
    pub const READ_ONLY: u32 = 1 << 1;
    /// Send FLUSH command
    pub const SEND_FLUSH: u32 = 1 << 2;
    /// Send FUA (Force Unit Access)
    pub const SEND_FUA: u32 = 1 << 3;
    /// Rotational media (not SSD)
    pub const ROTATIONAL: u32 = 1 << 4;
    /// Send TRIM command
    pub const SEND_TRIM: u32 = 1 << 5;

    /// Create new flags
    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    /// Get raw value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Check whether every bit in `flag` is set
    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }
}

/// NBD command types understood by this server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NbdCommand {
    /// Read
    Read = 0,
    /// Write
    Write = 1,
    /// Disconnect
    Disc = 2,
    /// Flush
    Flush = 3,
    /// Trim
    Trim = 4,
}

impl TryFrom<u16> for NbdCommand {
    type Error = BlockError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::Disc),
            3 => Ok(Self::Flush),
            4 => Ok(Self::Trim),
            _ => Err(BlockError::Protocol(format!("Unknown command: {}", value))),
        }
    }
}

/// NBD command flags (upper half of the request `type` word)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFlags(u16);

impl CommandFlags {
    /// Force unit access (write-through)
    pub const FUA: u16 = 1 << 0;

    /// Create new flags
    pub fn new(flags: u16) -> Self {
        Self(flags)
    }

    /// Get raw value
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Check FUA flag
    pub fn has_fua(&self) -> bool {
        self.0 & Self::FUA != 0
    }
}

/// NBD request header
///
/// Fields are kept as they appear on the wire so that a header with a bad
/// magic or an unknown command can still be decoded, reported and answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdRequest {
    /// Magic (should be [`NBD_REQUEST_MAGIC`])
    pub magic: u32,
    /// Command type in the low 16 bits, command flags in the high 16 bits
    pub kind: u32,
    /// Handle (cookie for matching reply)
    pub handle: Handle,
    /// Offset
    pub from: u64,
    /// Length
    pub length: u32,
}

impl NbdRequest {
    /// Request size (always 28 bytes)
    pub const SIZE: usize = 28;

    /// Build a well-formed request header
    pub fn new(command: NbdCommand, handle: Handle, from: u64, length: u32) -> Self {
        Self {
            magic: NBD_REQUEST_MAGIC,
            kind: command as u32,
            handle,
            from,
            length,
        }
    }

    /// Set command flags
    pub fn with_flags(mut self, flags: CommandFlags) -> Self {
        self.kind = (self.kind & 0xffff) | ((flags.bits() as u32) << 16);
        self
    }

    /// Parse from bytes
    ///
    /// Only a short buffer is an error. The magic is not validated here; see
    /// [`NbdRequest::has_valid_magic`].
    pub fn parse(data: &[u8]) -> BlockResult<Self> {
        if data.len() < Self::SIZE {
            return Err(BlockError::Protocol(format!(
                "Request too short: {} bytes",
                data.len()
            )));
        }

        let mut buf = data;
        let magic = buf.get_u32();
        let kind = buf.get_u32();
        let mut handle = [0u8; HANDLE_LEN];
        buf.copy_to_slice(&mut handle);
        let from = buf.get_u64();
        let length = buf.get_u32();

        Ok(Self {
            magic,
            kind,
            handle,
            from,
            length,
        })
    }

    /// Encode to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.magic);
        buf.put_u32(self.kind);
        buf.put_slice(&self.handle);
        buf.put_u64(self.from);
        buf.put_u32(self.length);
    }

    /// Whether the magic matches the request magic
    pub fn has_valid_magic(&self) -> bool {
        self.magic == NBD_REQUEST_MAGIC
    }

    /// Decode the command from the low half of `kind`
    pub fn command(&self) -> BlockResult<NbdCommand> {
        NbdCommand::try_from((self.kind & 0xffff) as u16)
    }

    /// Command flags from the high half of `kind`
    pub fn flags(&self) -> CommandFlags {
        CommandFlags::new((self.kind >> 16) as u16)
    }
}

/// NBD simple reply header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdReply {
    /// Error code
    pub error: u32,
    /// Handle (matches request)
    pub handle: Handle,
}

impl NbdReply {
    /// Reply size (always 16 bytes)
    pub const SIZE: usize = 16;

    /// Create a new reply
    pub fn new(handle: Handle, error: NbdError) -> Self {
        Self {
            error: error.code(),
            handle,
        }
    }

    /// Create a success reply
    pub fn ok(handle: Handle) -> Self {
        Self::new(handle, NbdError::Ok)
    }

    /// Reply for `request` with a cleared error
    pub fn for_request(request: &NbdRequest) -> Self {
        Self::ok(request.handle)
    }

    /// Mark the reply as failed
    pub fn fail(&mut self, error: NbdError) {
        self.error = error.code();
    }

    /// Encode to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(NBD_REPLY_MAGIC);
        buf.put_u32(self.error);
        buf.put_slice(&self.handle);
    }

    /// Parse from bytes, checking the reply magic
    pub fn parse(data: &[u8]) -> BlockResult<Self> {
        if data.len() < Self::SIZE {
            return Err(BlockError::Protocol("Reply too short".to_string()));
        }

        let mut buf = data;
        let magic = buf.get_u32();
        if magic != NBD_REPLY_MAGIC {
            return Err(BlockError::Protocol(format!(
                "Invalid reply magic: {:08x}",
                magic
            )));
        }
        let error = buf.get_u32();
        let mut handle = [0u8; HANDLE_LEN];
        buf.copy_to_slice(&mut handle);

        Ok(Self { error, handle })
    }
}
