//! Lazily zeroed device: a header bitmap records which chunks of the data
//! region have ever been written.
//!
//! On-disk layout: block 0 is the header, blocks `1..=bitmap_blocks` hold a
//! packed bit vector with one bit per data chunk, and the rest is data. A
//! clear bit means the chunk has never been initialized and reads as zeros;
//! the first write to such a chunk zeroes it on the base device before the
//! bit is set. An interruption between the zeroing and the bit update
//! leaves the bit clear, and the partial zeros are indistinguishable from
//! never-written zeros, so the format is crash-safe by construction.

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};

use crate::blockdev::{BlockDevice, DeviceError, Result};
use crate::cache::BlockCache;
use crate::bits;

const MAGIC: &[u8; 8] = b"LAZY0000";
const HEADER_LEN: usize = 32;
const BITMAP_CACHE_SLOTS: usize = 16;

/// Data chunk size in blocks. Sized for terabyte-class devices at small
/// block sizes; a bigger device wants a bigger chunk.
const CHUNK_SIZE: u64 = 1024;

struct Header {
    total_blocks: u64,
    bitmap_blocks: u64,
    chunk_size: u64,
}

impl Header {
    fn encode(&self, block: &mut [u8]) {
        block.fill(0);
        block[..8].copy_from_slice(MAGIC);
        BigEndian::write_u64(&mut block[8..16], self.total_blocks);
        BigEndian::write_u64(&mut block[16..24], self.bitmap_blocks);
        BigEndian::write_u64(&mut block[24..32], self.chunk_size);
    }

    fn decode(block: &[u8]) -> Result<Self> {
        if &block[..8] != MAGIC {
            return Err(DeviceError::BadMagic { layer: "lazyzero" });
        }
        Ok(Self {
            total_blocks: BigEndian::read_u64(&block[8..16]),
            bitmap_blocks: BigEndian::read_u64(&block[16..24]),
            chunk_size: BigEndian::read_u64(&block[24..32]),
        })
    }
}

fn check_geometry(block_size: usize, block_count: u64) -> Result<()> {
    if block_size < HEADER_LEN {
        return Err(DeviceError::BadGeometry(format!(
            "lazyzero needs a block size of at least {} bytes, got {}",
            HEADER_LEN, block_size
        )));
    }
    if block_count < 3 {
        return Err(DeviceError::BadGeometry(format!(
            "lazyzero needs a base of at least 3 blocks, got {}",
            block_count
        )));
    }
    Ok(())
}

/// A device that presents a zero-initialized view of its base, paying the
/// zeroing cost lazily, one chunk at a time, on first write.
pub struct LazyZeroDevice {
    base: Box<dyn BlockDevice>,
    block_size: usize,
    block_count: u64,
    bitmap_blocks: u64,
    chunk_size: u64,
    bits_per_block: u64,
    bitmap: tokio::sync::Mutex<BlockCache>,
}

impl LazyZeroDevice {
    /// Write a fresh header and an all-clear bitmap to `base`. Data blocks
    /// are left untouched; that is the point of the layer.
    pub async fn format(base: &dyn BlockDevice) -> Result<()> {
        check_geometry(base.block_size(), base.block_count())?;

        let bits_per_block = base.block_size() as u64 * 8;
        let bitmap_bits = (base.block_count() - 1 + CHUNK_SIZE - 1) / CHUNK_SIZE;
        let bitmap_blocks = (bitmap_bits + bits_per_block - 1) / bits_per_block;

        let mut block = vec![0u8; base.block_size()];
        Header {
            total_blocks: base.block_count(),
            bitmap_blocks,
            chunk_size: CHUNK_SIZE,
        }
        .encode(&mut block);
        base.write_block(0, &block).await?;

        block.fill(0);
        for i in 1..=bitmap_blocks {
            base.write_block(i, &block).await?;
        }
        Ok(())
    }

    /// Open a formatted base device.
    pub async fn open(base: Box<dyn BlockDevice>) -> Result<Self> {
        check_geometry(base.block_size(), base.block_count())?;

        let mut block = vec![0u8; base.block_size()];
        base.read_block(0, &mut block).await?;
        let header = Header::decode(&block)?;

        if header.total_blocks != base.block_count() {
            return Err(DeviceError::BadGeometry(format!(
                "device was initialized for {} blocks but is now {} blocks",
                header.total_blocks,
                base.block_count()
            )));
        }

        let bits_per_block = base.block_size() as u64 * 8;
        if header.bitmap_blocks * bits_per_block
            < base.block_count() - 1 - header.bitmap_blocks
        {
            return Err(DeviceError::BadGeometry(
                "not enough bitmap blocks for this device size".into(),
            ));
        }

        let block_size = base.block_size();
        let block_count = base.block_count() - 1 - header.bitmap_blocks;

        Ok(Self {
            base,
            block_size,
            block_count,
            bitmap_blocks: header.bitmap_blocks,
            chunk_size: header.chunk_size,
            bits_per_block,
            bitmap: tokio::sync::Mutex::new(BlockCache::new(block_size, BITMAP_CACHE_SLOTS)),
        })
    }

    fn chunk_count(&self) -> u64 {
        (self.block_count + self.chunk_size - 1) / self.chunk_size
    }

    async fn chunk_written(&self, bitmap: &mut BlockCache, chunk: u64) -> Result<bool> {
        assert!(chunk < self.chunk_count());
        let block = 1 + chunk / self.bits_per_block;
        let data = bitmap.read(&*self.base, block).await?;
        Ok(bits::get(data, chunk % self.bits_per_block))
    }

    async fn set_chunk_written(&self, bitmap: &mut BlockCache, chunk: u64) -> Result<()> {
        assert!(chunk < self.chunk_count());
        let block = 1 + chunk / self.bits_per_block;
        let data = bitmap.read(&*self.base, block).await?;
        bits::set(data, chunk % self.bits_per_block);
        bitmap.mark_dirty(block);
        Ok(())
    }

    /// Physically zero every base block of `chunk` (the final chunk may be
    /// short).
    async fn zero_chunk(&self, chunk: u64) -> Result<()> {
        let zeros = vec![0u8; self.block_size];
        let first = chunk * self.chunk_size + self.bitmap_blocks + 1;
        for i in 0..self.chunk_size {
            if first + i < self.base.block_count() {
                self.base.write_block(first + i, &zeros).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlockDevice for LazyZeroDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn name(&self) -> &'static str {
        "lazyzero"
    }

    async fn read_block(&self, which: u64, buf: &mut [u8]) -> Result<()> {
        assert!(which < self.block_count, "block index out of range");
        assert_eq!(buf.len(), self.block_size, "buffer is not one block long");

        let chunk = which / self.chunk_size;
        let mut bitmap = self.bitmap.lock().await;
        if !self.chunk_written(&mut bitmap, chunk).await? {
            buf.fill(0);
            return Ok(());
        }
        drop(bitmap);

        self.base
            .read_block(which + 1 + self.bitmap_blocks, buf)
            .await
    }

    async fn write_block(&self, which: u64, data: &[u8]) -> Result<()> {
        assert!(which < self.block_count, "block index out of range");
        assert_eq!(data.len(), self.block_size, "buffer is not one block long");

        let chunk = which / self.chunk_size;
        let mut bitmap = self.bitmap.lock().await;
        if !self.chunk_written(&mut bitmap, chunk).await? {
            // Zero first, then set the bit. If we are interrupted in
            // between, the clear bit still reads the chunk as zeros.
            self.zero_chunk(chunk).await?;
            self.set_chunk_written(&mut bitmap, chunk).await?;
        }
        drop(bitmap);

        self.base
            .write_block(which + 1 + self.bitmap_blocks, data)
            .await
    }

    async fn flush(&self) -> Result<()> {
        self.bitmap.lock().await.flush(&*self.base).await;
        self.base.flush().await
    }

    async fn sync(&self) -> Result<()> {
        self.bitmap.lock().await.flush(&*self.base).await;
        self.base.sync().await
    }

    async fn clear_caches(&self) -> Result<()> {
        self.bitmap.lock().await.flush(&*self.base).await;
        self.base.clear_caches().await
    }

    async fn close(&mut self) -> Result<()> {
        self.bitmap.lock().await.flush(&*self.base).await;
        self.base.close().await
    }
}
