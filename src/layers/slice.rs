//! A contiguous sub-range view of a base device.

use async_trait::async_trait;

use crate::blockdev::{BlockDevice, DeviceError, Result};

/// A device exposing blocks `start..start + len` of its base, preserving
/// the block size.
///
/// A slice covering the whole base is an ordinary (thin) wrapper too, so
/// `close` stays unambiguous: the slice always owns its base.
pub struct SliceDevice {
    base: Box<dyn BlockDevice>,
    start: u64,
    len: u64,
    block_size: usize,
}

impl SliceDevice {
    /// View `len` blocks of `base` starting at block `start`.
    pub fn open(base: Box<dyn BlockDevice>, start: u64, len: u64) -> Result<Self> {
        if len == 0 {
            return Err(DeviceError::BadGeometry("slice length must be non-zero".into()));
        }
        if start + len > base.block_count() {
            return Err(DeviceError::BadGeometry(format!(
                "slice [{}, {}) does not fit in a {}-block device",
                start,
                start + len,
                base.block_count()
            )));
        }

        let block_size = base.block_size();
        Ok(Self {
            base,
            start,
            len,
            block_size,
        })
    }
}

#[async_trait]
impl BlockDevice for SliceDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.len
    }

    fn name(&self) -> &'static str {
        "slice"
    }

    async fn read_block(&self, which: u64, buf: &mut [u8]) -> Result<()> {
        assert!(which < self.len, "block index out of range");
        self.base.read_block(self.start + which, buf).await
    }

    async fn write_block(&self, which: u64, data: &[u8]) -> Result<()> {
        assert!(which < self.len, "block index out of range");
        self.base.write_block(self.start + which, data).await
    }

    async fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        assert!(
            offset + buf.len() as u64 <= self.len * self.block_size as u64,
            "byte read past end of slice"
        );
        self.base
            .read_bytes(offset + self.start * self.block_size as u64, buf)
            .await
    }

    async fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        assert!(
            offset + data.len() as u64 <= self.len * self.block_size as u64,
            "byte write past end of slice"
        );
        self.base
            .write_bytes(offset + self.start * self.block_size as u64, data)
            .await
    }

    async fn flush(&self) -> Result<()> {
        self.base.flush().await
    }

    async fn sync(&self) -> Result<()> {
        self.base.sync().await
    }

    async fn clear_caches(&self) -> Result<()> {
        self.base.clear_caches().await
    }

    async fn close(&mut self) -> Result<()> {
        self.base.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;

    #[tokio::test]
    async fn block_io_translates_offsets() {
        let base = MemBlockDevice::new(32, 16).unwrap();
        let dev = SliceDevice::open(Box::new(base.clone()), 4, 8).unwrap();
        assert_eq!(dev.block_count(), 8);

        dev.write_block(0, &[0xA1; 32]).await.unwrap();
        dev.write_block(7, &[0xA8; 32]).await.unwrap();

        let mut buf = vec![0u8; 32];
        base.read_block(4, &mut buf).await.unwrap();
        assert_eq!(buf, vec![0xA1; 32]);
        base.read_block(11, &mut buf).await.unwrap();
        assert_eq!(buf, vec![0xA8; 32]);

        // Blocks outside the slice untouched.
        base.read_block(3, &mut buf).await.unwrap();
        assert_eq!(buf, vec![0u8; 32]);
        base.read_block(12, &mut buf).await.unwrap();
        assert_eq!(buf, vec![0u8; 32]);
    }

    #[tokio::test]
    async fn byte_io_translates_offsets() {
        let base = MemBlockDevice::new(32, 16).unwrap();
        let dev = SliceDevice::open(Box::new(base.clone()), 2, 4).unwrap();

        dev.write_bytes(10, b"sliced bytes").await.unwrap();

        let mut direct = vec![0u8; 12];
        base.read_bytes(2 * 32 + 10, &mut direct).await.unwrap();
        assert_eq!(&direct, b"sliced bytes");

        let mut back = vec![0u8; 12];
        dev.read_bytes(10, &mut back).await.unwrap();
        assert_eq!(&back, b"sliced bytes");
    }

    #[tokio::test]
    async fn whole_range_slice_still_wraps() {
        let base = MemBlockDevice::new(32, 8).unwrap();
        let mut dev = SliceDevice::open(Box::new(base.clone()), 0, 8).unwrap();
        assert_eq!(dev.block_count(), 8);
        assert_eq!(dev.name(), "slice");

        dev.write_block(3, &[0x77; 32]).await.unwrap();
        let mut buf = vec![0u8; 32];
        base.read_block(3, &mut buf).await.unwrap();
        assert_eq!(buf, vec![0x77; 32]);

        dev.close().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_ranges_past_the_end() {
        let base = MemBlockDevice::new(32, 8).unwrap();
        assert!(matches!(
            SliceDevice::open(Box::new(base.clone()), 4, 8),
            Err(DeviceError::BadGeometry(_))
        ));
        assert!(matches!(
            SliceDevice::open(Box::new(base), 0, 0),
            Err(DeviceError::BadGeometry(_))
        ));
    }
}
