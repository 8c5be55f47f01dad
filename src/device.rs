//! Device controller
//!
//! Owns the kernel device node and the socket pair for one virtual block
//! device, and brackets the request loop with the kernel setup and
//! teardown calls.
//!
//! Teardown always runs in the same order: fire the disconnect signal,
//! clear the kernel queue and socket (best-effort), close both socket ends,
//! close the device node. It runs at most once per device no matter how many
//! paths race to trigger it.

use std::net::Shutdown;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::attach::{disconnect_signal, AttachMonitor, DisconnectListener, DisconnectSignal};
use crate::backend::BlockBackend;
use crate::config::DeviceConfig;
use crate::error::{BlockError, BlockResult};
use crate::nbd::connection::{LoopExit, NbdConnection};
use crate::nbd::ioctl::{DeviceControl, NbdDevice};

/// Device lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Size registered, socket pair allocated
    Created,
    /// Socket handed to the kernel, requests being served
    Connected,
    /// All resources released
    Disconnected,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Who started a teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Initiator {
    /// The request loop stopped
    Loop,
    /// A caller asked to disconnect
    External,
    /// `NBD_DO_IT` returned
    Kernel,
    /// The device was dropped
    Drop,
}

/// Descriptors released by teardown
struct Resources<C> {
    control: Arc<C>,
    user: UnixStream,
    kernel: UnixStream,
}

struct Inner<C> {
    state: DeviceState,
    /// Who ran teardown, once it has run
    initiator: Option<Initiator>,
    resources: Option<Resources<C>>,
    listener: Option<DisconnectListener>,
}

struct Shared<C> {
    inner: Mutex<Inner<C>>,
    signal: DisconnectSignal,
}

impl<C: DeviceControl> Shared<C> {
    /// Run teardown if nobody has yet. Returns whether this call did it.
    ///
    /// The lock is held for the whole sequence so a losing caller only
    /// returns once the resources are actually gone.
    fn teardown(&self, initiator: Initiator) -> bool {
        let mut inner = self.inner.lock();
        let Some(resources) = inner.resources.take() else {
            return false;
        };
        inner.state = DeviceState::Disconnected;
        inner.initiator = Some(initiator);
        inner.listener = None;
        debug!(?initiator, "Tearing down NBD device");

        self.signal.fire();

        let Resources {
            control,
            user,
            kernel,
        } = resources;

        if initiator == Initiator::External {
            if let Err(e) = control.disconnect() {
                debug!("Ignoring disconnect failure: {}", e);
            }
        }
        if let Err(e) = control.clear_queue() {
            debug!("Ignoring clear queue failure: {}", e);
        }
        if let Err(e) = control.clear_sock() {
            debug!("Ignoring clear socket failure: {}", e);
        }

        // Shutdown reaches the request loop's duplicate of this end too.
        let _ = user.shutdown(Shutdown::Both);
        drop(user);
        drop(kernel);
        drop(control);

        info!("NBD client disconnected");
        true
    }
}

/// Hand the kernel its socket end and open the loop's side as an async stream
fn bind_channel<C: DeviceControl>(
    resources: &Resources<C>,
    config: &DeviceConfig,
) -> BlockResult<tokio::net::UnixStream> {
    resources.control.set_sock(resources.kernel.as_fd())?;
    // Older kernels reject NBD_SET_FLAGS; the device still works.
    if let Err(e) = resources.control.set_flags(config.transmission_flags().bits()) {
        debug!("Ignoring set flags failure: {}", e);
    }

    let user = resources.user.try_clone()?;
    user.set_nonblocking(true)?;
    Ok(tokio::net::UnixStream::from_std(user)?)
}

/// A user-space block device served through the kernel NBD driver
pub struct Device<B, C = NbdDevice>
where
    B: BlockBackend,
    C: DeviceControl,
{
    size: u64,
    config: DeviceConfig,
    backend: B,
    shared: Arc<Shared<C>>,
}

impl<B: BlockBackend> Device<B, NbdDevice> {
    /// Open `path` and register a device of `size` bytes with default settings
    pub fn create(path: impl AsRef<Path>, size: u64, backend: B) -> BlockResult<Self> {
        Self::create_with_config(path, size, backend, DeviceConfig::default())
    }

    /// Open `path` and register a device of `size` bytes
    pub fn create_with_config(
        path: impl AsRef<Path>,
        size: u64,
        backend: B,
        config: DeviceConfig,
    ) -> BlockResult<Self> {
        config.validate()?;
        let control = NbdDevice::open(path)?;
        Self::with_control(control, size, backend, config)
    }
}

impl<B, C> Device<B, C>
where
    B: BlockBackend,
    C: DeviceControl,
{
    /// Register a device through an already opened control surface.
    ///
    /// Pushes the size, clears queue and socket state left by a previous
    /// session and allocates the socket pair. Any failure drops the control
    /// surface, so no half-built device survives.
    pub fn with_control(
        control: C,
        size: u64,
        backend: B,
        config: DeviceConfig,
    ) -> BlockResult<Self> {
        config.validate()?;

        if let Some(block_size) = config.block_size {
            control.set_block_size(block_size)?;
        }
        control.set_size(size)?;
        if let Some(secs) = config.timeout_secs {
            control.set_timeout(secs)?;
        }
        control.clear_queue()?;
        control.clear_sock()?;

        let (user, kernel) = UnixStream::pair()?;
        let (signal, listener) = disconnect_signal();
        debug!(size, "Created NBD device");

        Ok(Self {
            size,
            config,
            backend,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: DeviceState::Created,
                    initiator: None,
                    resources: Some(Resources {
                        control: Arc::new(control),
                        user,
                        kernel,
                    }),
                    listener: Some(listener),
                }),
                signal,
            }),
        })
    }

    /// Virtual device size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Device configuration
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Storage backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Current lifecycle state
    pub fn state(&self) -> DeviceState {
        self.shared.inner.lock().state
    }

    /// Attach the device to the kernel and serve requests.
    ///
    /// Returns once the device has disconnected by any path. The socket pair
    /// is closed by then; the device node itself stays open until the
    /// kernel's `NBD_DO_IT` call returns on the attach thread, which may be
    /// slightly later.
    ///
    /// Errors are setup failures or a request stream that could not be kept
    /// in sync. A stream broken by [`Device::disconnect`] is not an error.
    pub async fn connect(&self) -> BlockResult<()> {
        let attached = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                DeviceState::Created => {}
                DeviceState::Connected => {
                    return Err(BlockError::InvalidState("already connected"))
                }
                DeviceState::Disconnected => return Err(BlockError::InvalidState("disconnected")),
            }
            inner.state = DeviceState::Connected;
            let listener = inner.listener.take();
            match (inner.resources.as_ref(), listener) {
                (Some(resources), Some(listener)) => bind_channel(resources, &self.config)
                    .map(|stream| (resources.control.clone(), stream, listener)),
                _ => Err(BlockError::InvalidState("disconnected")),
            }
        };
        let (control, stream, listener) = match attached {
            Ok(parts) => parts,
            Err(e) => {
                self.shared.teardown(Initiator::Loop);
                return Err(e);
            }
        };

        let shared = self.shared.clone();
        let monitor = match AttachMonitor::start(control.clone(), listener, move || {
            shared.teardown(Initiator::Kernel);
        }) {
            Ok(monitor) => monitor,
            Err(e) => {
                self.shared.teardown(Initiator::Loop);
                return Err(e);
            }
        };

        // Opening the node makes the kernel re-read the partition table,
        // which needs the request loop running to complete.
        let rescan = thread::Builder::new()
            .name("nbd-rescan".to_string())
            .spawn(move || {
                if let Err(e) = control.rescan() {
                    warn!("Cannot reach the device: {}", e);
                }
            });
        if let Err(e) = rescan {
            warn!("Cannot start partition rescan: {}", e);
        }

        let mut connection = NbdConnection::new(stream).read_only(self.config.read_only);
        let result = connection.run(&self.backend).await;
        let requested = self.shared.inner.lock().initiator == Some(Initiator::External);
        let result = match result {
            Err(e) if requested => {
                debug!("Request loop cut short by disconnect: {}", e);
                Ok(LoopExit::ChannelClosed)
            }
            other => other,
        };
        match &result {
            Ok(LoopExit::ChannelClosed) => debug!("Kernel closed the channel"),
            Ok(LoopExit::Disconnect) => debug!("Kernel requested disconnect"),
            Err(e) => warn!("NBD request loop aborted: {}", e),
        }
        debug!(stats = ?connection.stats(), "NBD request loop finished");
        drop(connection);

        self.shared.teardown(Initiator::Loop);
        monitor.join().await;
        result.map(drop)
    }

    /// Disconnect the device from the kernel.
    ///
    /// Safe to call from any thread, any number of times, concurrently with
    /// [`Device::connect`].
    pub fn disconnect(&self) {
        if !self.shared.teardown(Initiator::External) {
            debug!("NBD device already disconnected");
        }
    }
}

impl<B, C> Drop for Device<B, C>
where
    B: BlockBackend,
    C: DeviceControl,
{
    fn drop(&mut self) {
        self.shared.teardown(Initiator::Drop);
    }
}
