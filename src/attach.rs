//! Kernel attach monitor
//!
//! `NBD_DO_IT` blocks its caller for as long as the kernel serves the
//! device, so it runs on a dedicated OS thread while the request loop runs on
//! the async runtime. The only state shared between the two is a one-shot
//! [`DisconnectSignal`].

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::BlockResult;
use crate::nbd::ioctl::DeviceControl;

/// Sending half of the one-shot disconnect signal.
///
/// Firing is idempotent: only the first call delivers the signal.
#[derive(Debug)]
pub struct DisconnectSignal {
    tx: Mutex<Option<oneshot::Sender<()>>>,
}

/// Receiving half of the disconnect signal
#[derive(Debug)]
pub struct DisconnectListener {
    rx: oneshot::Receiver<()>,
}

/// Create a connected signal/listener pair
pub fn disconnect_signal() -> (DisconnectSignal, DisconnectListener) {
    let (tx, rx) = oneshot::channel();
    (
        DisconnectSignal {
            tx: Mutex::new(Some(tx)),
        },
        DisconnectListener { rx },
    )
}

impl DisconnectSignal {
    /// Deliver the signal. Returns `false` if it had already been fired.
    pub fn fire(&self) -> bool {
        match self.tx.lock().take() {
            Some(tx) => {
                // The listener may already be gone; the signal is still spent.
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Whether the signal has been fired
    pub fn is_fired(&self) -> bool {
        self.tx.lock().is_none()
    }
}

impl DisconnectListener {
    /// Wait for the signal. A dropped sender counts as fired.
    pub async fn wait(self) {
        let _ = self.rx.await;
    }
}

/// Monitor for one kernel attach
pub struct AttachMonitor {
    task: JoinHandle<()>,
}

impl AttachMonitor {
    /// Start `NBD_DO_IT` on its own thread and a task waiting on `listener`.
    ///
    /// `on_detach` runs on the attach thread once `NBD_DO_IT` returns, which
    /// happens after teardown or when the kernel drops the device on its own.
    pub fn start<C, F>(
        control: Arc<C>,
        listener: DisconnectListener,
        on_detach: F,
    ) -> BlockResult<Self>
    where
        C: DeviceControl,
        F: FnOnce() + Send + 'static,
    {
        let kernel = thread::Builder::new()
            .name("nbd-attach".to_string())
            .spawn(move || {
                info!("Starting NBD client...");
                match control.do_it() {
                    Ok(()) => debug!("Kernel attach returned"),
                    Err(e) => warn!("Kernel attach ended with an error: {}", e),
                }
                drop(control);
                on_detach();
            })?;

        let task = tokio::spawn(async move {
            listener.wait().await;
            if kernel.is_finished() {
                let _ = kernel.join();
            } else {
                // Detached; it ends once the kernel lets go of the socket.
                debug!("Kernel attach still draining");
            }
        });

        Ok(Self { task })
    }

    /// Wait until the monitor has observed the disconnect signal
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("Attach monitor task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BlockError;
    use std::os::fd::BorrowedFd;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_signal_fires_once() {
        let (signal, _listener) = disconnect_signal();
        assert!(!signal.is_fired());
        assert!(signal.fire());
        assert!(signal.is_fired());
        assert!(!signal.fire());
    }

    #[tokio::test]
    async fn test_listener_wakes() {
        let (signal, listener) = disconnect_signal();
        let waiter = tokio::spawn(listener.wait());
        signal.fire();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_signal_releases_listener() {
        let (signal, listener) = disconnect_signal();
        drop(signal);
        listener.wait().await;
    }

    /// Control whose attach call returns immediately
    struct InstantAttach;

    impl DeviceControl for InstantAttach {
        fn set_block_size(&self, _: u32) -> BlockResult<()> {
            Ok(())
        }
        fn set_size(&self, _: u64) -> BlockResult<()> {
            Ok(())
        }
        fn set_timeout(&self, _: u64) -> BlockResult<()> {
            Ok(())
        }
        fn clear_queue(&self) -> BlockResult<()> {
            Ok(())
        }
        fn clear_sock(&self) -> BlockResult<()> {
            Ok(())
        }
        fn set_sock(&self, _: BorrowedFd<'_>) -> BlockResult<()> {
            Ok(())
        }
        fn set_flags(&self, _: u32) -> BlockResult<()> {
            Ok(())
        }
        fn do_it(&self) -> BlockResult<()> {
            Err(BlockError::Unsupported("no kernel".to_string()))
        }
        fn disconnect(&self) -> BlockResult<()> {
            Ok(())
        }
        fn rescan(&self) -> BlockResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_monitor_runs_on_detach_and_waits_for_signal() {
        let (signal, listener) = disconnect_signal();
        let signal = Arc::new(signal);
        let detached = Arc::new(AtomicBool::new(false));

        let monitor = {
            let signal = signal.clone();
            let detached = detached.clone();
            AttachMonitor::start(Arc::new(InstantAttach), listener, move || {
                detached.store(true, Ordering::SeqCst);
                signal.fire();
            })
            .unwrap()
        };

        monitor.join().await;
        assert!(detached.load(Ordering::SeqCst));
        assert!(signal.is_fired());
    }
}
