//! Storage backends
//!
//! The server only ever talks to storage through [`BlockBackend`]. It calls
//! the backend from a single task, one request at a time.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{BlockError, BlockResult};

/// Block I/O capability consumed by the protocol loop
#[async_trait]
pub trait BlockBackend: Send + Sync {
    /// Fill `buf` with the bytes stored at `offset`
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> BlockResult<()>;
    /// Store `buf` at `offset`
    async fn write_at(&self, buf: &[u8], offset: u64) -> BlockResult<()>;
    /// Flush pending writes
    async fn flush(&self) -> BlockResult<()>;
    /// Trim/discard a range
    async fn trim(&self, offset: u64, length: u32) -> BlockResult<()>;
    /// Called when the kernel asks to disconnect
    async fn disconnect(&self) {}
}

fn check_range(offset: u64, len: usize, size: u64) -> BlockResult<(usize, usize)> {
    let end = offset
        .checked_add(len as u64)
        .filter(|&end| end <= size)
        .ok_or(BlockError::InvalidOffset { offset, size })?;
    Ok((offset as usize, end as usize))
}

/// Backend keeping the whole device in memory
pub struct MemoryBackend {
    data: RwLock<Vec<u8>>,
    flush_count: AtomicU64,
    disconnect_count: AtomicU64,
}

impl MemoryBackend {
    /// Create a zero-filled backend of `size` bytes
    pub fn new(size: u64) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size as usize]),
            flush_count: AtomicU64::new(0),
            disconnect_count: AtomicU64::new(0),
        }
    }

    /// Device size in bytes
    pub fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    /// Number of completed flushes
    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::Relaxed)
    }

    /// Number of disconnect notifications received
    pub fn disconnect_count(&self) -> u64 {
        self.disconnect_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BlockBackend for MemoryBackend {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> BlockResult<()> {
        let data = self.data.read();
        let (start, end) = check_range(offset, buf.len(), data.len() as u64)?;
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> BlockResult<()> {
        let mut data = self.data.write();
        let (start, end) = check_range(offset, buf.len(), data.len() as u64)?;
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    async fn flush(&self) -> BlockResult<()> {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn trim(&self, offset: u64, length: u32) -> BlockResult<()> {
        let mut data = self.data.write();
        let (start, end) = check_range(offset, length as usize, data.len() as u64)?;
        data[start..end].fill(0);
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnect_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Backend storing the device in a regular file.
///
/// File I/O runs on the blocking pool so a slow disk never stalls the
/// runtime worker driving the request loop.
pub struct FileBackend {
    file: Arc<File>,
    size: u64,
}

impl FileBackend {
    /// Open (or create) `path` and size it to exactly `size` bytes
    pub fn create(path: impl AsRef<Path>, size: u64) -> BlockResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(size)?;
        Ok(Self {
            file: Arc::new(file),
            size,
        })
    }

    /// Use an existing file, sized as it is now
    pub fn open(path: impl AsRef<Path>) -> BlockResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            size,
        })
    }

    /// Device size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    async fn blocking<T, F>(&self, op: F) -> BlockResult<T>
    where
        F: FnOnce(&File) -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let file = self.file.clone();
        let result = tokio::task::spawn_blocking(move || op(&file))
            .await
            .map_err(io::Error::other)?;
        Ok(result?)
    }
}

#[async_trait]
impl BlockBackend for FileBackend {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> BlockResult<()> {
        check_range(offset, buf.len(), self.size)?;
        let len = buf.len();
        let chunk = self
            .blocking(move |file| {
                let mut chunk = vec![0u8; len];
                file.read_exact_at(&mut chunk, offset)?;
                Ok(chunk)
            })
            .await?;
        buf.copy_from_slice(&chunk);
        Ok(())
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> BlockResult<()> {
        check_range(offset, buf.len(), self.size)?;
        let chunk = buf.to_vec();
        self.blocking(move |file| file.write_all_at(&chunk, offset)).await
    }

    async fn flush(&self) -> BlockResult<()> {
        self.blocking(|file| file.sync_data()).await
    }

    async fn trim(&self, offset: u64, length: u32) -> BlockResult<()> {
        check_range(offset, length as usize, self.size)?;
        Ok(())
    }
}
