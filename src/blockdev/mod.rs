//! Concrete storage backends for the bottom of a device stack.

mod blockdev_trait;
#[cfg(unix)]
mod mmap;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

// Re-export the block device trait and related types
pub use self::blockdev_trait::{BlockDevice, DeviceError, Result};
#[cfg(unix)]
pub use self::mmap::MmapBlockDevice;

/// An ephemeral block device backed by an in-process byte buffer.
///
/// Cloning yields a second handle to the same buffer, which is useful for
/// composing several views (slices, stripes) of one device and for
/// inspecting a layer's base in tests.
#[derive(Clone)]
pub struct MemBlockDevice {
    data: Arc<Mutex<Vec<u8>>>,
    block_size: usize,
    block_count: u64,
}

impl MemBlockDevice {
    /// Create a zero-filled in-memory device.
    pub fn new(block_size: usize, block_count: u64) -> Result<Self> {
        assert!(block_size.is_power_of_two(), "block size must be a power of two");

        let bytes = block_size
            .checked_mul(block_count as usize)
            .ok_or(DeviceError::OutOfSpace)?;
        let mut data = Vec::new();
        data.try_reserve_exact(bytes)
            .map_err(|_| DeviceError::OutOfSpace)?;
        data.resize(bytes, 0);

        Ok(Self {
            data: Arc::new(Mutex::new(data)),
            block_size,
            block_count,
        })
    }
}

#[async_trait]
impl BlockDevice for MemBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn name(&self) -> &'static str {
        "mem"
    }

    async fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<()> {
        assert!(index < self.block_count, "block index out of range");
        assert_eq!(buf.len(), self.block_size, "buffer is not one block long");

        let data = self.data.lock();
        let offset = index as usize * self.block_size;
        buf.copy_from_slice(&data[offset..offset + self.block_size]);
        Ok(())
    }

    async fn write_block(&self, index: u64, data: &[u8]) -> Result<()> {
        assert!(index < self.block_count, "block index out of range");
        assert_eq!(data.len(), self.block_size, "buffer is not one block long");

        let mut guard = self.data.lock();
        let offset = index as usize * self.block_size;
        guard[offset..offset + self.block_size].copy_from_slice(data);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn clear_caches(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A block device backed by a file, addressed with positioned reads and
/// writes at `byte_offset + index × block_size`.
///
/// Short reads past the end of the file are zero-padded; short writes fail.
pub struct FileBlockDevice {
    file: tokio::sync::Mutex<Option<File>>,
    path: PathBuf,
    offset: u64,
    block_size: usize,
    block_count: u64,
}

impl FileBlockDevice {
    /// Create a new device file of `block_size × block_count` bytes,
    /// truncating anything already at `path`.
    pub async fn create(
        path: impl AsRef<Path>,
        block_size: usize,
        block_count: u64,
    ) -> Result<Self> {
        assert!(block_size.is_power_of_two(), "block size must be a power of two");

        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.set_len(block_size as u64 * block_count).await?;

        Ok(Self {
            file: tokio::sync::Mutex::new(Some(file)),
            path,
            offset: 0,
            block_size,
            block_count,
        })
    }

    /// Open an existing file. The block count is derived from the file
    /// length past `offset`, rounding down to whole blocks.
    pub async fn open(path: impl AsRef<Path>, block_size: usize, offset: u64) -> Result<Self> {
        assert!(block_size.is_power_of_two(), "block size must be a power of two");

        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path).await?;

        let len = file.metadata().await?.len();
        if len < offset {
            return Err(DeviceError::BadGeometry(format!(
                "file {} is {} bytes, shorter than the requested offset {}",
                path.display(),
                len,
                offset
            )));
        }
        let block_count = (len - offset) / block_size as u64;

        Ok(Self {
            file: tokio::sync::Mutex::new(Some(file)),
            path,
            offset,
            block_size,
            block_count,
        })
    }

    /// Path this device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BlockDevice for FileBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn name(&self) -> &'static str {
        "file"
    }

    async fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<()> {
        assert!(index < self.block_count, "block index out of range");
        assert_eq!(buf.len(), self.block_size, "buffer is not one block long");

        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(DeviceError::Closed)?;

        file.seek(SeekFrom::Start(self.offset + index * self.block_size as u64))
            .await?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        // Reads past the end of the file zero-pad the tail.
        buf[filled..].fill(0);
        Ok(())
    }

    async fn write_block(&self, index: u64, data: &[u8]) -> Result<()> {
        assert!(index < self.block_count, "block index out of range");
        assert_eq!(data.len(), self.block_size, "buffer is not one block long");

        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(DeviceError::Closed)?;

        file.seek(SeekFrom::Start(self.offset + index * self.block_size as u64))
            .await?;
        file.write_all(data).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(DeviceError::Closed)?;
        file.flush().await?;
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(DeviceError::Closed)?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn clear_caches(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut guard = self.file.lock().await;
        match guard.take() {
            Some(mut file) => {
                file.flush().await?;
                Ok(())
            }
            None => Err(DeviceError::Closed),
        }
    }
}
