//! NBD device-control calls
//!
//! Control codes mirror `<linux/nbd.h>`: every request is `_IO(0xab, n)`
//! and takes its argument by value.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::error::{BlockError, BlockResult};

const NBD_IOCTL_TYPE: u8 = 0xab;

/// Bind the kernel side of the socket
pub const NBD_SET_SOCK: u32 = nix::request_code_none!(NBD_IOCTL_TYPE, 0) as u32;
/// Set the logical block size
pub const NBD_SET_BLKSIZE: u32 = nix::request_code_none!(NBD_IOCTL_TYPE, 1) as u32;
/// Set the device size in bytes
pub const NBD_SET_SIZE: u32 = nix::request_code_none!(NBD_IOCTL_TYPE, 2) as u32;
/// Serve the device; blocks until disconnect
pub const NBD_DO_IT: u32 = nix::request_code_none!(NBD_IOCTL_TYPE, 3) as u32;
/// Drop the socket binding
pub const NBD_CLEAR_SOCK: u32 = nix::request_code_none!(NBD_IOCTL_TYPE, 4) as u32;
/// Fail all queued requests
pub const NBD_CLEAR_QUE: u32 = nix::request_code_none!(NBD_IOCTL_TYPE, 5) as u32;
/// Dump driver state to the kernel log
pub const NBD_PRINT_DEBUG: u32 = nix::request_code_none!(NBD_IOCTL_TYPE, 6) as u32;
/// Set the device size in blocks
pub const NBD_SET_SIZE_BLOCKS: u32 = nix::request_code_none!(NBD_IOCTL_TYPE, 7) as u32;
/// Ask the driver to send a disconnect and stop
pub const NBD_DISCONNECT: u32 = nix::request_code_none!(NBD_IOCTL_TYPE, 8) as u32;
/// Set the request timeout in seconds
pub const NBD_SET_TIMEOUT: u32 = nix::request_code_none!(NBD_IOCTL_TYPE, 9) as u32;
/// Set transmission flags
pub const NBD_SET_FLAGS: u32 = nix::request_code_none!(NBD_IOCTL_TYPE, 10) as u32;

/// Raw control calls. All take their argument by value, never a pointer.
mod sys {
    use super::*;

    nix::ioctl_write_int_bad!(set_sock, NBD_SET_SOCK);
    nix::ioctl_write_int_bad!(set_blksize, NBD_SET_BLKSIZE);
    nix::ioctl_write_int_bad!(set_timeout, NBD_SET_TIMEOUT);
    nix::ioctl_write_int_bad!(set_flags, NBD_SET_FLAGS);
    nix::ioctl_none_bad!(do_it, NBD_DO_IT);
    nix::ioctl_none_bad!(clear_sock, NBD_CLEAR_SOCK);
    nix::ioctl_none_bad!(clear_que, NBD_CLEAR_QUE);
    nix::ioctl_none_bad!(disconnect, NBD_DISCONNECT);

    /// `NBD_SET_SIZE` takes a full `unsigned long`, which the int wrappers
    /// above would truncate to a `c_int`.
    pub unsafe fn set_size(fd: libc::c_int, size: libc::c_ulong) -> nix::Result<libc::c_int> {
        nix::errno::Errno::result(unsafe { libc::ioctl(fd, NBD_SET_SIZE as _, size) })
    }
}

fn int_arg(name: &'static str, value: u64) -> BlockResult<libc::c_int> {
    libc::c_int::try_from(value)
        .map_err(|_| BlockError::Config(format!("{} argument out of range: {}", name, value)))
}

/// Kernel-facing control surface of one NBD device node.
///
/// Every method maps to a single control call except [`DeviceControl::rescan`],
/// which opens the node once so the kernel re-reads its partition table.
/// Implementations must tolerate `do_it` blocking on one thread while the
/// other methods are called from another.
pub trait DeviceControl: Send + Sync + 'static {
    /// `NBD_SET_BLKSIZE`
    fn set_block_size(&self, block_size: u32) -> BlockResult<()>;
    /// `NBD_SET_SIZE`
    fn set_size(&self, size: u64) -> BlockResult<()>;
    /// `NBD_SET_TIMEOUT`
    fn set_timeout(&self, secs: u64) -> BlockResult<()>;
    /// `NBD_CLEAR_QUE`
    fn clear_queue(&self) -> BlockResult<()>;
    /// `NBD_CLEAR_SOCK`
    fn clear_sock(&self) -> BlockResult<()>;
    /// `NBD_SET_SOCK`
    fn set_sock(&self, sock: BorrowedFd<'_>) -> BlockResult<()>;
    /// `NBD_SET_FLAGS`
    fn set_flags(&self, flags: u32) -> BlockResult<()>;
    /// `NBD_DO_IT`, returns once the device is detached
    fn do_it(&self) -> BlockResult<()>;
    /// `NBD_DISCONNECT`
    fn disconnect(&self) -> BlockResult<()>;
    /// Open and close the device node
    fn rescan(&self) -> BlockResult<()>;
}

/// An opened `/dev/nbdX` node
#[derive(Debug)]
pub struct NbdDevice {
    path: PathBuf,
    file: File,
}

impl NbdDevice {
    /// Open the device node read/write
    pub fn open(path: impl AsRef<Path>) -> BlockResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| BlockError::DeviceOpen {
                path: path.display().to_string(),
                source,
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Device node path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ioctl<F>(&self, name: &'static str, call: F) -> BlockResult<()>
    where
        F: FnOnce(RawFd) -> nix::Result<libc::c_int>,
    {
        trace!(op = name, "ioctl");
        call(self.file.as_raw_fd())
            .map(drop)
            .map_err(|errno| BlockError::control(name, errno.into()))
    }
}

// SAFETY (all calls below): `fd` is the open device node owned by `self`,
// and every NBD request takes a plain integer argument.
impl DeviceControl for NbdDevice {
    fn set_block_size(&self, block_size: u32) -> BlockResult<()> {
        let arg = int_arg("NBD_SET_BLKSIZE", block_size.into())?;
        self.ioctl("NBD_SET_BLKSIZE", |fd| unsafe { sys::set_blksize(fd, arg) })
    }

    fn set_size(&self, size: u64) -> BlockResult<()> {
        self.ioctl("NBD_SET_SIZE", |fd| unsafe { sys::set_size(fd, size as libc::c_ulong) })
    }

    fn set_timeout(&self, secs: u64) -> BlockResult<()> {
        let arg = int_arg("NBD_SET_TIMEOUT", secs)?;
        self.ioctl("NBD_SET_TIMEOUT", |fd| unsafe { sys::set_timeout(fd, arg) })
    }

    fn clear_queue(&self) -> BlockResult<()> {
        self.ioctl("NBD_CLEAR_QUE", |fd| unsafe { sys::clear_que(fd) })
    }

    fn clear_sock(&self) -> BlockResult<()> {
        self.ioctl("NBD_CLEAR_SOCK", |fd| unsafe { sys::clear_sock(fd) })
    }

    fn set_sock(&self, sock: BorrowedFd<'_>) -> BlockResult<()> {
        let sock = sock.as_raw_fd();
        self.ioctl("NBD_SET_SOCK", |fd| unsafe { sys::set_sock(fd, sock) })
    }

    fn set_flags(&self, flags: u32) -> BlockResult<()> {
        let arg = int_arg("NBD_SET_FLAGS", flags.into())?;
        self.ioctl("NBD_SET_FLAGS", |fd| unsafe { sys::set_flags(fd, arg) })
    }

    fn do_it(&self) -> BlockResult<()> {
        self.ioctl("NBD_DO_IT", |fd| unsafe { sys::do_it(fd) })
    }

    fn disconnect(&self) -> BlockResult<()> {
        self.ioctl("NBD_DISCONNECT", |fd| unsafe { sys::disconnect(fd) })
    }

    fn rescan(&self) -> BlockResult<()> {
        File::open(&self.path)
            .map(drop)
            .map_err(|source| BlockError::DeviceOpen {
                path: self.path.display().to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_codes_match_kernel_header() {
        assert_eq!(NBD_SET_SOCK, 0xab00);
        assert_eq!(NBD_SET_SIZE, 0xab02);
        assert_eq!(NBD_DO_IT, 0xab03);
        assert_eq!(NBD_CLEAR_SOCK, 0xab04);
        assert_eq!(NBD_CLEAR_QUE, 0xab05);
        assert_eq!(NBD_DISCONNECT, 0xab08);
        assert_eq!(NBD_SET_FLAGS, 0xab0a);
    }

    #[test]
    fn test_open_missing_node() {
        let err = NbdDevice::open("/nonexistent/nbd0").unwrap_err();
        assert!(matches!(err, BlockError::DeviceOpen { .. }));
    }

    #[test]
    fn test_ioctl_on_regular_file_is_rejected() {
        let file = tempfile::tempfile().unwrap();
        assert!(unsafe { sys::clear_que(file.as_raw_fd()) }.is_err());
        assert!(unsafe { sys::set_size(file.as_raw_fd(), 1 << 33) }.is_err());
    }

    #[test]
    fn test_device_control_maps_errors() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let device = NbdDevice::open(file.path()).unwrap();

        let err = device.clear_queue().unwrap_err();
        assert!(matches!(err, BlockError::Control { op: "NBD_CLEAR_QUE", .. }));

        let err = device.set_timeout(u64::MAX).unwrap_err();
        assert!(matches!(err, BlockError::Config(_)));

        // Opening a regular file succeeds, so rescan does too.
        assert!(device.rescan().is_ok());
    }
}
