//! Shared-mapping file backend (unix only).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;

use super::{BlockDevice, DeviceError, Result};

/// A shared memory mapping. The pointer stays valid for the lifetime of the
/// owning device (the mapped file handle is held alongside it), and all
/// access goes through the device's lock.
struct Mapping {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn unmap(&mut self) -> Result<()> {
        let rc = unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

/// A block device backed by a shared file mapping.
///
/// `flush` requests an asynchronous writeback of the mapping, `sync` a
/// synchronous one, and `clear_caches` invalidates cached pages so the next
/// access re-reads from storage.
pub struct MmapBlockDevice {
    map: Mutex<Option<Mapping>>,
    // Keeps the descriptor behind the mapping alive until close.
    _file: std::fs::File,
    block_size: usize,
    block_count: u64,
}

impl MmapBlockDevice {
    /// Create a file of `block_size × block_count` bytes and map it.
    pub fn create(path: impl AsRef<Path>, block_size: usize, block_count: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(block_size as u64 * block_count)?;
        Self::map_file(file, block_size, block_count, 0)
    }

    /// Map `block_size × block_count` bytes of an existing file, starting at
    /// `offset`. The offset must be page-aligned.
    pub fn open(
        path: impl AsRef<Path>,
        block_size: usize,
        block_count: u64,
        offset: u64,
    ) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let needed = offset + block_size as u64 * block_count;
        let len = file.metadata()?.len();
        if len < needed {
            return Err(DeviceError::BadGeometry(format!(
                "file is {} bytes but the mapping needs {}",
                len, needed
            )));
        }
        Self::map_file(file, block_size, block_count, offset)
    }

    fn map_file(
        file: std::fs::File,
        block_size: usize,
        block_count: u64,
        offset: u64,
    ) -> Result<Self> {
        assert!(block_size.is_power_of_two(), "block size must be a power of two");

        let len = block_size * block_count as usize;
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }

        Ok(Self {
            map: Mutex::new(Some(Mapping {
                ptr: ptr as *mut u8,
                len,
            })),
            _file: file,
            block_size,
            block_count,
        })
    }

    fn msync(&self, flags: libc::c_int) -> Result<()> {
        let guard = self.map.lock();
        let map = guard.as_ref().ok_or(DeviceError::Closed)?;
        let rc = unsafe { libc::msync(map.ptr as *mut libc::c_void, map.len, flags) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

#[async_trait]
impl BlockDevice for MmapBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn name(&self) -> &'static str {
        "mmap"
    }

    async fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<()> {
        assert!(index < self.block_count, "block index out of range");
        assert_eq!(buf.len(), self.block_size, "buffer is not one block long");

        let guard = self.map.lock();
        let map = guard.as_ref().ok_or(DeviceError::Closed)?;
        unsafe {
            ptr::copy_nonoverlapping(
                map.ptr.add(index as usize * self.block_size),
                buf.as_mut_ptr(),
                self.block_size,
            );
        }
        Ok(())
    }

    async fn write_block(&self, index: u64, data: &[u8]) -> Result<()> {
        assert!(index < self.block_count, "block index out of range");
        assert_eq!(data.len(), self.block_size, "buffer is not one block long");

        let guard = self.map.lock();
        let map = guard.as_ref().ok_or(DeviceError::Closed)?;
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                map.ptr.add(index as usize * self.block_size),
                self.block_size,
            );
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.msync(libc::MS_ASYNC)
    }

    async fn sync(&self) -> Result<()> {
        self.msync(libc::MS_SYNC)
    }

    async fn clear_caches(&self) -> Result<()> {
        self.msync(libc::MS_INVALIDATE)
    }

    async fn close(&mut self) -> Result<()> {
        let mut guard = self.map.lock();
        match guard.take() {
            Some(mut map) => map.unmap(),
            None => Err(DeviceError::Closed),
        }
    }
}

impl Drop for MmapBlockDevice {
    fn drop(&mut self) {
        if let Some(mut map) = self.map.lock().take() {
            let _ = map.unmap();
        }
    }
}
