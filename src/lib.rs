//! Block Device in User Space for WARP
//!
//! This crate lets a user-space program serve a Linux block device through
//! the kernel `nbd` driver, without a kernel module of its own. Requests the
//! kernel issues against `/dev/nbdX` arrive over a local socket pair and are
//! answered from a pluggable [`BlockBackend`].
//!
//! # Features
//!
//! - Kernel NBD request/reply framing
//! - READ, WRITE, FLUSH, TRIM and DISCONNECT dispatch
//! - Device lifecycle through NBD control calls
//! - Idempotent teardown under racing disconnects
//! - In-memory and file-backed storage
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  control calls   ┌──────────────┐
//! │ Linux nbd driver │◄─────────────────┤    Device    │
//! │   (/dev/nbdX)    │                  │ AttachMonitor│
//! └────────┬─────────┘                  └──────┬───────┘
//!          │ socket pair                       │
//! ┌────────▼─────────┐                         │
//! │  NbdConnection   │◄────────────────────────┘
//! │  (request loop)  │
//! └────────┬─────────┘
//!          │
//!   ┌──────▼───────┐
//!   │ BlockBackend │
//!   └──────────────┘
//! ```

#![warn(missing_docs)]

pub mod attach;
pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod nbd;

pub use attach::{disconnect_signal, AttachMonitor, DisconnectListener, DisconnectSignal};
pub use backend::{BlockBackend, FileBackend, MemoryBackend};
pub use config::DeviceConfig;
pub use device::{Device, DeviceState};
pub use error::{BlockError, BlockResult, NbdError};
pub use nbd::connection::{ConnectionState, LoopExit, NbdConnection, RequestStats};
pub use nbd::ioctl::{DeviceControl, NbdDevice};
pub use nbd::{NbdCommand, NbdReply, NbdRequest, TransmissionFlags};
