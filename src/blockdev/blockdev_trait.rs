//! Block device trait definition for the strata stack.

use async_trait::async_trait;

pub use crate::error::{DeviceError, Result};

/// Uniform contract implemented by every backend and layer in the stack.
///
/// A block device exposes a fixed block size and block count, exact-size
/// block I/O, byte-granular I/O, and a small set of maintenance operations.
/// Layers own the device(s) beneath them and forward `flush`, `sync`,
/// `clear_caches` and `close` downward.
///
/// Each device is designed for use by one logical caller at a time; internal
/// caches assume serial access.
#[async_trait]
pub trait BlockDevice: Send + Sync + 'static {
    /// Block size in bytes. A power of two for backends; layers preserve
    /// the block size of their base (stripe/concat require matching sizes).
    fn block_size(&self) -> usize;

    /// Total number of addressable blocks.
    fn block_count(&self) -> u64;

    /// Short printable name of the device kind, for diagnostics.
    fn name(&self) -> &'static str;

    /// Read block `index` into `buf`. `buf` must be exactly one block long
    /// and `index` must be in range; violations are caller bugs.
    async fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` (exactly one block) to block `index`.
    async fn write_block(&self, index: u64, data: &[u8]) -> Result<()>;

    /// Make pending writes visible to the next layer down. Best-effort with
    /// respect to kernel caches; use [`BlockDevice::sync`] for durability.
    async fn flush(&self) -> Result<()>;

    /// Flush and durably persist to stable storage.
    async fn sync(&self) -> Result<()>;

    /// Drop internal read/write caches. The next read re-fetches from the
    /// underlying device.
    async fn clear_caches(&self) -> Result<()>;

    /// Release the device. Closes owned base devices recursively; the
    /// handle must not be used afterwards.
    async fn close(&mut self) -> Result<()>;

    /// Read `buf.len()` bytes starting at byte `offset`.
    ///
    /// The generic implementation splits the range on block boundaries,
    /// reading partial head/tail blocks through a scratch buffer and full
    /// interior blocks directly into place.
    async fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let bs = self.block_size() as u64;
        assert!(
            offset + buf.len() as u64 <= bs * self.block_count(),
            "byte read past end of device"
        );

        let end_block = (offset + buf.len() as u64 - 1) / bs;
        let mut block = offset / bs;
        let mut skip = (offset % bs) as usize;
        let mut scratch = vec![0u8; bs as usize];
        let mut pos = 0usize;

        while pos < buf.len() {
            let remaining = buf.len() - pos;
            if block == end_block {
                self.read_block(block, &mut scratch).await?;
                buf[pos..].copy_from_slice(&scratch[skip..skip + remaining]);
                return Ok(());
            } else if skip != 0 {
                self.read_block(block, &mut scratch).await?;
                let take = bs as usize - skip;
                buf[pos..pos + take].copy_from_slice(&scratch[skip..]);
                pos += take;
                skip = 0;
                block += 1;
            } else {
                self.read_block(block, &mut buf[pos..pos + bs as usize])
                    .await?;
                pos += bs as usize;
                block += 1;
            }
        }
        Ok(())
    }

    /// Write `data` starting at byte `offset`.
    ///
    /// Partially covered blocks are read-modified-written through a scratch
    /// buffer; fully covered blocks are written directly.
    async fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let bs = self.block_size() as u64;
        assert!(
            offset + data.len() as u64 <= bs * self.block_count(),
            "byte write past end of device"
        );

        let end_block = (offset + data.len() as u64 - 1) / bs;
        let mut block = offset / bs;
        let mut skip = (offset % bs) as usize;
        let mut scratch = vec![0u8; bs as usize];
        let mut pos = 0usize;

        while pos < data.len() {
            let remaining = data.len() - pos;
            if skip != 0 || block == end_block {
                self.read_block(block, &mut scratch).await?;
                let take = (bs as usize - skip).min(remaining);
                scratch[skip..skip + take].copy_from_slice(&data[pos..pos + take]);
                self.write_block(block, &scratch).await?;
                pos += take;
                skip = 0;
                block += 1;
            } else {
                self.write_block(block, &data[pos..pos + bs as usize]).await?;
                pos += bs as usize;
                block += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::blockdev::MemBlockDevice;
    use crate::BlockDevice;

    #[tokio::test]
    async fn byte_io_straddles_blocks() {
        let dev = MemBlockDevice::new(16, 8).unwrap();

        // Span three blocks with unaligned head and tail.
        let pattern: Vec<u8> = (0..40).map(|i| i as u8 ^ 0xA5).collect();
        dev.write_bytes(10, &pattern).await.unwrap();

        let mut back = vec![0u8; 40];
        dev.read_bytes(10, &mut back).await.unwrap();
        assert_eq!(back, pattern);

        // Neighbouring bytes untouched.
        let mut head = vec![0u8; 10];
        dev.read_bytes(0, &mut head).await.unwrap();
        assert_eq!(head, vec![0u8; 10]);

        let mut tail = vec![0u8; 16 * 8 - 50];
        dev.read_bytes(50, &mut tail).await.unwrap();
        assert_eq!(tail, vec![0u8; 16 * 8 - 50]);
    }

    #[tokio::test]
    async fn byte_io_interior_of_one_block() {
        let dev = MemBlockDevice::new(64, 4).unwrap();
        dev.write_bytes(70, b"interior").await.unwrap();

        let mut whole = vec![0u8; 64];
        dev.read_block(1, &mut whole).await.unwrap();
        assert_eq!(&whole[6..14], b"interior");
        assert_eq!(whole[5], 0);
        assert_eq!(whole[14], 0);
    }

    #[tokio::test]
    async fn byte_io_matches_model_at_many_block_sizes() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        for shift in 0..8 {
            let bs = 1usize << shift;
            let dev = MemBlockDevice::new(bs, 32).unwrap();
            let total = bs * 32;
            let mut model = vec![0u8; total];

            for _ in 0..64 {
                let off = rng.gen_range(0..total);
                let len = rng.gen_range(0..=(total - off).min(3 * bs + 1));
                let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                dev.write_bytes(off as u64, &data).await.unwrap();
                model[off..off + len].copy_from_slice(&data);
            }

            let mut back = vec![0u8; total];
            dev.read_bytes(0, &mut back).await.unwrap();
            assert_eq!(back, model, "mismatch at block size {}", bs);
        }
    }

    #[tokio::test]
    async fn empty_byte_io_is_a_noop() {
        let dev = MemBlockDevice::new(32, 2).unwrap();
        dev.write_bytes(64, &[]).await.unwrap();
        let mut buf = [];
        dev.read_bytes(64, &mut buf).await.unwrap();
    }
}
