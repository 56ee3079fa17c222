//! Corruption-detecting layer: per-block CRC-32 kept in interleaved hash
//! blocks.
//!
//! There is no header; the physical layout repeats `H d d … d`, where each
//! hash block `H` holds one big-endian CRC-32 per following data block
//! (`block_size / 4` of them). Every stored CRC is XORed with the CRC of an
//! all-zero block, so an all-zero base device is a valid, empty verify
//! device. A trailing hash block that covers no data is wasted space.

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};

use crate::blockdev::{BlockDevice, DeviceError, Result};

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

struct HashBlockCache {
    block: Vec<u8>,
    which: Option<u64>,
}

/// A device that verifies a CRC-32 of every block on read and maintains the
/// CRCs on write. Detected corruption surfaces as
/// [`DeviceError::VerifyMismatch`].
pub struct VerifyDevice {
    base: Box<dyn BlockDevice>,
    block_size: usize,
    block_count: u64,
    hashes_per_block: u64,
    zero_crc: u32,
    state: tokio::sync::Mutex<HashBlockCache>,
}

impl VerifyDevice {
    /// Wrap `base` in a verify layer. An all-zero base is a valid empty
    /// device, so there is no separate format step.
    pub fn open(base: Box<dyn BlockDevice>) -> Result<Self> {
        if base.block_size() < 4 {
            return Err(DeviceError::BadGeometry(format!(
                "verify needs a block size of at least 4 bytes, got {}",
                base.block_size()
            )));
        }
        if base.block_count() < 2 {
            return Err(DeviceError::BadGeometry(format!(
                "verify needs a base of at least 2 blocks, got {}",
                base.block_count()
            )));
        }

        let block_size = base.block_size();
        let hashes_per_block = (block_size / 4) as u64;
        let hash_block_count =
            (base.block_count() + hashes_per_block) / (hashes_per_block + 1);
        // A trailing hash block covers no data; it is counted above and thus
        // already excluded from the exposed block count.
        let block_count = base.block_count() - hash_block_count;

        let zero_crc = crc32(&vec![0u8; block_size]);

        Ok(Self {
            base,
            block_size,
            block_count,
            hashes_per_block,
            zero_crc,
            state: tokio::sync::Mutex::new(HashBlockCache {
                block: vec![0u8; block_size],
                which: None,
            }),
        })
    }

    /// Base-device coordinates of logical block `which`: its hash block,
    /// its data block, and the byte offset of its CRC slot.
    fn locate(&self, which: u64) -> (u64, u64, usize) {
        let chunk = which / self.hashes_per_block;
        let hash_block = chunk * (self.hashes_per_block + 1);
        let data_block = which + chunk + 1;
        let slot = ((which % self.hashes_per_block) * 4) as usize;
        (hash_block, data_block, slot)
    }
}

#[async_trait]
impl BlockDevice for VerifyDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn name(&self) -> &'static str {
        "verify"
    }

    async fn read_block(&self, which: u64, buf: &mut [u8]) -> Result<()> {
        assert!(which < self.block_count, "block index out of range");
        assert_eq!(buf.len(), self.block_size, "buffer is not one block long");

        let (hash_block, data_block, slot) = self.locate(which);

        let mut state = self.state.lock().await;
        if state.which != Some(hash_block) {
            state.which = None;
            self.base.read_block(hash_block, &mut state.block).await?;
            state.which = Some(hash_block);
        }
        let expected = BigEndian::read_u32(&state.block[slot..slot + 4]) ^ self.zero_crc;
        drop(state);

        self.base.read_block(data_block, buf).await?;

        let actual = crc32(buf);
        if actual != expected {
            log::debug!(
                "verify: CRC error on block {} (mapped {}): {:#010x} != {:#010x}",
                data_block,
                which,
                actual,
                expected
            );
            return Err(DeviceError::VerifyMismatch { block: which });
        }
        Ok(())
    }

    async fn write_block(&self, which: u64, data: &[u8]) -> Result<()> {
        assert!(which < self.block_count, "block index out of range");
        assert_eq!(data.len(), self.block_size, "buffer is not one block long");

        let (hash_block, data_block, slot) = self.locate(which);

        let mut state = self.state.lock().await;
        if state.which != Some(hash_block) {
            if self.base.read_block(hash_block, &mut state.block).await.is_err() {
                // The hash block is unreadable. Continue from zeros: the
                // blocks it covered are lost already, and overwriting it
                // keeps the device writable.
                log::warn!(
                    "verify: hash block {} unreadable, rewriting it from scratch",
                    hash_block
                );
                state.block.fill(0);
            }
            state.which = Some(hash_block);
        }

        let crc = crc32(data) ^ self.zero_crc;
        BigEndian::write_u32(&mut state.block[slot..slot + 4], crc);
        self.base.write_block(hash_block, &state.block).await?;

        self.base.write_block(data_block, data).await
    }

    async fn flush(&self) -> Result<()> {
        self.base.flush().await
    }

    async fn sync(&self) -> Result<()> {
        self.base.sync().await
    }

    async fn clear_caches(&self) -> Result<()> {
        self.state.lock().await.which = None;
        self.base.clear_caches().await
    }

    async fn close(&mut self) -> Result<()> {
        self.base.close().await
    }
}
