//! Remapping partitioner: carves a base device into up to 61 partitions
//! whose blocks are allocated on first write.
//!
//! On-disk layout: block 0 is the header (`"PART0000"`, u64 device block
//! count, u64 block size, then one u64 size per partition starting at byte
//! 24); next a usage bitmap with one bit per physical block; then the
//! mapping blocks (one big-endian u64 physical location per logical block,
//! 0 = unmapped, partitions laid out contiguously in definition order);
//! the rest is data. Unmapped logical blocks read as zeros; the first
//! write allocates a free physical block from the bitmap.

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};

use crate::blockdev::{BlockDevice, DeviceError, Result};
use crate::cache::BlockCache;
use crate::bits;

const MAGIC: &[u8; 8] = b"PART0000";
const MIN_BLOCK_SIZE: usize = 512;
/// Partition numbers run 0..=60; the 512-byte header has room for no more.
const MAX_PARTITIONS: usize = 61;
const SIZES_OFFSET: usize = 24;

fn check_geometry(block_size: usize) -> Result<()> {
    if block_size < MIN_BLOCK_SIZE {
        return Err(DeviceError::BadGeometry(format!(
            "partitioner needs a block size of at least {} bytes, got {}",
            MIN_BLOCK_SIZE, block_size
        )));
    }
    Ok(())
}

fn check_partition_number(partition: usize) -> Result<()> {
    if partition >= MAX_PARTITIONS {
        return Err(DeviceError::BadGeometry(format!(
            "bad partition number {} (partitions run 0..={})",
            partition,
            MAX_PARTITIONS - 1
        )));
    }
    Ok(())
}

/// Metadata bookkeeping shared by the device and the maintenance
/// operations. Physical-block helpers take the base device as a parameter.
struct PartCore {
    block_size: usize,
    bits_per_block: u64,
    maps_per_block: u64,
    /// Device block count as persisted in the header.
    block_count: u64,
    blocks_used: u64,
    bitmap_len: u64,
    maps_len: u64,
    /// Sum of all partition sizes (logical blocks with a mapping entry).
    mapped_total: u64,
    /// Physical block last seen free; the allocation scan resumes here.
    free_scan_from: u64,
    bitmap_cache: BlockCache,
    map_cache: BlockCache,
}

impl PartCore {
    fn bitmap_start(&self) -> u64 {
        1
    }

    fn maps_start(&self) -> u64 {
        self.bitmap_start() + self.bitmap_len
    }

    fn data_start(&self) -> u64 {
        self.maps_start() + self.maps_len
    }

    async fn load(base: &dyn BlockDevice) -> Result<Self> {
        check_geometry(base.block_size())?;

        let mut header = vec![0u8; base.block_size()];
        base.read_block(0, &mut header).await?;
        if &header[..8] != MAGIC {
            return Err(DeviceError::BadMagic { layer: "partition" });
        }

        let block_count = BigEndian::read_u64(&header[8..16]);
        if block_count > base.block_count() {
            return Err(DeviceError::BadGeometry(format!(
                "header says {} blocks but the device has only {}",
                block_count,
                base.block_count()
            )));
        }
        if block_count < base.block_count() {
            log::warn!(
                "partition: header covers {} of {} physical blocks; the tail is unused",
                block_count,
                base.block_count()
            );
        }

        let block_size = BigEndian::read_u64(&header[16..24]);
        if block_size != base.block_size() as u64 {
            return Err(DeviceError::BadGeometry(format!(
                "header block size {} does not match device block size {}",
                block_size,
                base.block_size()
            )));
        }

        let bits_per_block = base.block_size() as u64 * 8;
        let maps_per_block = base.block_size() as u64 / 8;
        let bitmap_len = (block_count + bits_per_block - 1) / bits_per_block;

        let mut mapped_total = 0;
        for p in 0..MAX_PARTITIONS {
            mapped_total += BigEndian::read_u64(&header[SIZES_OFFSET + 8 * p..][..8]);
        }
        let maps_len = (mapped_total + maps_per_block - 1) / maps_per_block;

        let mut core = Self {
            block_size: base.block_size(),
            bits_per_block,
            maps_per_block,
            block_count,
            blocks_used: 0,
            bitmap_len,
            maps_len,
            mapped_total,
            free_scan_from: 1,
            bitmap_cache: BlockCache::new(base.block_size(), 1),
            map_cache: BlockCache::new(base.block_size(), 1),
        };

        // Count used blocks across the bitmap region.
        let mut used = 0;
        for block in core.bitmap_start()..core.maps_start() {
            base.read_block(block, &mut header).await?;
            used += header.iter().map(|b| b.count_ones() as u64).sum::<u64>();
        }
        core.blocks_used = used;

        Ok(core)
    }

    /// Read the header and return the size of `partition` in blocks.
    async fn part_size(&mut self, base: &dyn BlockDevice, partition: usize) -> Result<u64> {
        let mut header = vec![0u8; self.block_size];
        base.read_block(0, &mut header).await?;
        Ok(BigEndian::read_u64(&header[SIZES_OFFSET + 8 * partition..][..8]))
    }

    /// Logical offset of `partition` in the mapping area: the sum of the
    /// sizes of all partitions defined before it.
    async fn partition_offset(&mut self, base: &dyn BlockDevice, partition: usize) -> Result<u64> {
        let mut header = vec![0u8; self.block_size];
        base.read_block(0, &mut header).await?;

        let mut offset = 0;
        for p in 0..partition {
            offset += BigEndian::read_u64(&header[SIZES_OFFSET + 8 * p..][..8]);
        }
        Ok(offset)
    }

    async fn block_is_used(&mut self, base: &dyn BlockDevice, block: u64) -> Result<bool> {
        let bitmap_block = self.bitmap_start() + block / self.bits_per_block;
        let data = self.bitmap_cache.read(base, bitmap_block).await?;
        Ok(bits::get(data, block % self.bits_per_block))
    }

    async fn mark_block(&mut self, base: &dyn BlockDevice, block: u64, used: bool) -> Result<()> {
        let bitmap_block = self.bitmap_start() + block / self.bits_per_block;
        let interior = block % self.bits_per_block;

        let data = self.bitmap_cache.read(base, bitmap_block).await?;
        let old = bits::get(data, interior);
        if used {
            bits::set(data, interior);
        } else {
            bits::clear(data, interior);
        }
        self.bitmap_cache.mark_dirty(bitmap_block);

        if used && !old {
            self.blocks_used += 1;
        } else if !used && old {
            self.blocks_used -= 1;
        }
        Ok(())
    }

    /// Find a free physical block, scanning circularly from the last hit.
    async fn scan_free_block(&mut self, base: &dyn BlockDevice) -> Result<Option<u64>> {
        let start = self.free_scan_from;
        loop {
            if !self.block_is_used(base, self.free_scan_from).await? {
                return Ok(Some(self.free_scan_from));
            }
            self.free_scan_from += 1;
            if self.free_scan_from >= self.block_count {
                self.free_scan_from = 1;
            }
            if self.free_scan_from == start {
                return Ok(None);
            }
        }
    }

    /// Physical location of mapping entry `logical`, 0 if unmapped.
    async fn map_entry(&mut self, base: &dyn BlockDevice, logical: u64) -> Result<u64> {
        let block = self.maps_start() + logical / self.maps_per_block;
        let interior = (logical % self.maps_per_block) as usize * 8;
        let data = self.map_cache.read(base, block).await?;
        Ok(BigEndian::read_u64(&data[interior..interior + 8]))
    }

    async fn set_map_entry(
        &mut self,
        base: &dyn BlockDevice,
        logical: u64,
        to: u64,
    ) -> Result<()> {
        let block = self.maps_start() + logical / self.maps_per_block;
        let interior = (logical % self.maps_per_block) as usize * 8;
        let data = self.map_cache.read(base, block).await?;
        BigEndian::write_u64(&mut data[interior..interior + 8], to);
        self.map_cache.mark_dirty(block);
        Ok(())
    }

    async fn flush_meta(&mut self, base: &dyn BlockDevice) {
        self.bitmap_cache.flush(base).await;
        self.map_cache.flush(base).await;
    }
}

/// One partition of a partitioned base device, addressed through the
/// mapping blocks. Reads of never-written blocks return zeros; writes
/// allocate physical blocks on demand and fail with
/// [`DeviceError::OutOfSpace`] when the pool is exhausted.
pub struct PartitionDevice {
    base: Box<dyn BlockDevice>,
    core: tokio::sync::Mutex<PartCore>,
    block_size: usize,
    block_count: u64,
    /// Logical offset of this partition in the mapping area.
    map_offset: u64,
}

impl PartitionDevice {
    /// Write an empty partition table: header with no partitions, an
    /// all-clear bitmap, and the metadata blocks marked used.
    pub async fn format(base: &dyn BlockDevice) -> Result<()> {
        check_geometry(base.block_size())?;

        let mut block = vec![0u8; base.block_size()];
        block[..8].copy_from_slice(MAGIC);
        BigEndian::write_u64(&mut block[8..16], base.block_count());
        BigEndian::write_u64(&mut block[16..24], base.block_size() as u64);
        base.write_block(0, &block).await?;

        let mut core = PartCore::load(base).await?;

        block.fill(0);
        for b in core.bitmap_start()..core.maps_start() {
            base.write_block(b, &block).await?;
        }

        for b in 0..core.data_start() {
            core.mark_block(base, b, true).await?;
        }
        core.flush_meta(base).await;
        Ok(())
    }

    /// Grow `partition` to `new_size` blocks, relocating data that stands
    /// where the mapping area must extend. Shrinking is not supported.
    pub async fn resize(
        base: &dyn BlockDevice,
        partition: usize,
        new_size: u64,
    ) -> Result<()> {
        check_partition_number(partition)?;

        let mut core = PartCore::load(base).await?;
        let old_size = core.part_size(base, partition).await?;

        if new_size == old_size {
            return Ok(());
        }
        if new_size < old_size {
            return Err(DeviceError::BadGeometry(
                "partition shrinking is not supported".into(),
            ));
        }

        // The mapping area grows by at most this many blocks (the estimate
        // may overshoot by one).
        let grow = new_size - old_size;
        let blocks_to_pad = (grow + core.maps_per_block - 1) / core.maps_per_block;
        let bad_start = core.data_start();
        let bad_end = bad_start + blocks_to_pad;

        // Reserve the target area first so relocated data cannot be
        // allocated back into it.
        for b in bad_start..bad_end.min(core.block_count) {
            core.mark_block(base, b, true).await?;
        }

        // Move mapped data out of the way.
        let mut scratch = vec![0u8; core.block_size];
        for logical in 0..core.mapped_total {
            let loc = core.map_entry(base, logical).await?;
            if loc >= bad_start && loc < bad_end {
                let new_loc = match core.scan_free_block(base).await? {
                    Some(b) => b,
                    None => {
                        log::error!("partition: resize failed, out of space");
                        return Err(DeviceError::OutOfSpace);
                    }
                };
                log::info!("partition: remapping block {} -> {}", loc, new_loc);

                base.read_block(loc, &mut scratch).await?;
                base.write_block(new_loc, &scratch).await?;
                core.mark_block(base, new_loc, true).await?;
                core.set_map_entry(base, logical, new_loc).await?;
                core.mark_block(base, loc, false).await?;
            }
        }

        // Shift the mapping entries of the partitions after this one.
        let start_shift = core.partition_offset(base, partition).await? + old_size;
        let end_shift = core.mapped_total;
        for logical in (start_shift..end_shift).rev() {
            let entry = core.map_entry(base, logical).await?;
            core.set_map_entry(base, logical + grow, entry).await?;
        }

        // Clear the entries opened up for the grown partition.
        for logical in start_shift..start_shift + grow {
            core.set_map_entry(base, logical, 0).await?;
        }

        // Mark the whole (possibly extended) mapping area used.
        let new_total = core.mapped_total + grow;
        let new_maps_len = (new_total + core.maps_per_block - 1) / core.maps_per_block;
        for b in core.maps_start()..core.maps_start() + new_maps_len {
            core.mark_block(base, b, true).await?;
        }

        // Give back the reserved pad blocks the mapping area did not grow
        // into; new_maps_len never extends past bad_end.
        for b in core.maps_start() + new_maps_len..bad_end.min(core.block_count) {
            core.mark_block(base, b, false).await?;
        }

        // Commit the new size to the header.
        let mut header = vec![0u8; core.block_size];
        base.read_block(0, &mut header).await?;
        BigEndian::write_u64(
            &mut header[SIZES_OFFSET + 8 * partition..][..8],
            new_size,
        );
        base.write_block(0, &header).await?;

        core.flush_meta(base).await;
        Ok(())
    }

    /// Open `partition` on a formatted base device.
    pub async fn open(base: Box<dyn BlockDevice>, partition: usize) -> Result<Self> {
        check_partition_number(partition)?;

        let mut core = PartCore::load(&*base).await?;
        let block_count = core.part_size(&*base, partition).await?;
        if block_count == 0 {
            return Err(DeviceError::BadGeometry(format!(
                "partition {} is not defined on this device",
                partition
            )));
        }
        let map_offset = core.partition_offset(&*base, partition).await?;

        let block_size = core.block_size;
        Ok(Self {
            base,
            core: tokio::sync::Mutex::new(core),
            block_size,
            block_count,
            map_offset,
        })
    }
}

#[async_trait]
impl BlockDevice for PartitionDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn name(&self) -> &'static str {
        "partition"
    }

    async fn read_block(&self, which: u64, buf: &mut [u8]) -> Result<()> {
        assert!(which < self.block_count, "block index out of range");
        assert_eq!(buf.len(), self.block_size, "buffer is not one block long");

        let mut core = self.core.lock().await;
        let loc = core.map_entry(&*self.base, self.map_offset + which).await?;
        drop(core);

        if loc == 0 {
            buf.fill(0);
            return Ok(());
        }
        self.base.read_block(loc, buf).await
    }

    async fn write_block(&self, which: u64, data: &[u8]) -> Result<()> {
        assert!(which < self.block_count, "block index out of range");
        assert_eq!(data.len(), self.block_size, "buffer is not one block long");

        let mut core = self.core.lock().await;
        let logical = self.map_offset + which;
        let mut loc = core.map_entry(&*self.base, logical).await?;
        if loc == 0 {
            loc = match core.scan_free_block(&*self.base).await? {
                Some(b) => b,
                None => {
                    log::error!(
                        "partition: write failed, out of space ({}/{} physical blocks used)",
                        core.blocks_used,
                        core.block_count
                    );
                    return Err(DeviceError::OutOfSpace);
                }
            };
            core.set_map_entry(&*self.base, logical, loc).await?;
            core.mark_block(&*self.base, loc, true).await?;
        }
        drop(core);

        self.base.write_block(loc, data).await
    }

    async fn flush(&self) -> Result<()> {
        self.core.lock().await.flush_meta(&*self.base).await;
        self.base.flush().await
    }

    async fn sync(&self) -> Result<()> {
        self.core.lock().await.flush_meta(&*self.base).await;
        self.base.sync().await
    }

    async fn clear_caches(&self) -> Result<()> {
        self.core.lock().await.flush_meta(&*self.base).await;
        self.base.clear_caches().await
    }

    async fn close(&mut self) -> Result<()> {
        self.core.lock().await.flush_meta(&*self.base).await;
        self.base.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;

    async fn formatted(blocks: u64) -> MemBlockDevice {
        let base = MemBlockDevice::new(512, blocks).unwrap();
        PartitionDevice::format(&base).await.unwrap();
        base
    }

    #[tokio::test]
    async fn format_then_open_undefined_partition_fails() {
        let base = formatted(64).await;
        assert!(matches!(
            PartitionDevice::open(Box::new(base), 0).await,
            Err(DeviceError::BadGeometry(_))
        ));
    }

    #[tokio::test]
    async fn unwritten_blocks_read_zero_and_writes_allocate() {
        let base = formatted(64).await;
        PartitionDevice::resize(&base, 0, 8).await.unwrap();

        let dev = PartitionDevice::open(Box::new(base.clone()), 0).await.unwrap();
        assert_eq!(dev.block_count(), 8);

        let mut buf = vec![0u8; 512];
        for i in 0..8 {
            dev.read_block(i, &mut buf).await.unwrap();
            assert_eq!(buf, vec![0u8; 512]);
        }

        dev.write_block(3, &[0x3D; 512]).await.unwrap();
        dev.read_block(3, &mut buf).await.unwrap();
        assert_eq!(buf, vec![0x3D; 512]);
        dev.read_block(2, &mut buf).await.unwrap();
        assert_eq!(buf, vec![0u8; 512]);
    }

    #[tokio::test]
    async fn partitions_are_independent_and_persist() {
        let base = formatted(64).await;
        PartitionDevice::resize(&base, 0, 4).await.unwrap();
        PartitionDevice::resize(&base, 1, 3).await.unwrap();

        let mut p0 = PartitionDevice::open(Box::new(base.clone()), 0).await.unwrap();
        let mut buf = vec![0u8; 512];
        for i in 0..4 {
            p0.write_block(i, &[0xA0 + i as u8; 512]).await.unwrap();
        }
        p0.close().await.unwrap();

        let mut p1 = PartitionDevice::open(Box::new(base.clone()), 1).await.unwrap();
        assert_eq!(p1.block_count(), 3);
        for i in 0..3 {
            p1.read_block(i, &mut buf).await.unwrap();
            assert_eq!(buf, vec![0u8; 512], "partition 1 sees partition 0's data");
            p1.write_block(i, &[0xB0 + i as u8; 512]).await.unwrap();
        }
        p1.close().await.unwrap();

        let p0 = PartitionDevice::open(Box::new(base.clone()), 0).await.unwrap();
        for i in 0..4 {
            p0.read_block(i, &mut buf).await.unwrap();
            assert_eq!(buf, vec![0xA0 + i as u8; 512]);
        }
    }

    #[tokio::test]
    async fn growing_a_partition_preserves_contents() {
        let base = formatted(128).await;
        PartitionDevice::resize(&base, 0, 4).await.unwrap();
        PartitionDevice::resize(&base, 1, 4).await.unwrap();

        let mut p0 = PartitionDevice::open(Box::new(base.clone()), 0).await.unwrap();
        let mut p1_data = Vec::new();
        for i in 0..4 {
            p0.write_block(i, &[0x11 * (i as u8 + 1); 512]).await.unwrap();
        }
        p0.close().await.unwrap();

        let mut p1 = PartitionDevice::open(Box::new(base.clone()), 1).await.unwrap();
        for i in 0..4 {
            let block = vec![0x22u8.wrapping_add(i as u8); 512];
            p1.write_block(i, &block).await.unwrap();
            p1_data.push(block);
        }
        p1.close().await.unwrap();

        // Growing partition 0 shifts partition 1's mapping entries.
        PartitionDevice::resize(&base, 0, 70).await.unwrap();

        let p0 = PartitionDevice::open(Box::new(base.clone()), 0).await.unwrap();
        assert_eq!(p0.block_count(), 70);
        let mut buf = vec![0u8; 512];
        for i in 0..4 {
            p0.read_block(i, &mut buf).await.unwrap();
            assert_eq!(buf, vec![0x11 * (i as u8 + 1); 512]);
        }
        // The grown tail reads zeros.
        p0.read_block(69, &mut buf).await.unwrap();
        assert_eq!(buf, vec![0u8; 512]);

        let p1 = PartitionDevice::open(Box::new(base), 1).await.unwrap();
        for i in 0..4 {
            p1.read_block(i, &mut buf).await.unwrap();
            assert_eq!(buf, p1_data[i as usize]);
        }
    }

    #[tokio::test]
    async fn relocating_resize_returns_vacated_blocks_to_the_pool() {
        // 16 physical blocks. Growing the partition extends the mapping
        // area over its first data block; after the relocation the vacated
        // block must be allocatable again.
        let base = formatted(16).await;
        PartitionDevice::resize(&base, 0, 2).await.unwrap();

        let mut dev = PartitionDevice::open(Box::new(base.clone()), 0).await.unwrap();
        dev.write_block(0, &[0x0A; 512]).await.unwrap();
        dev.write_block(1, &[0x0B; 512]).await.unwrap();
        dev.close().await.unwrap();

        PartitionDevice::resize(&base, 0, 14).await.unwrap();

        let dev = PartitionDevice::open(Box::new(base), 0).await.unwrap();
        assert_eq!(dev.block_count(), 14);
        let mut buf = vec![0u8; 512];
        dev.read_block(0, &mut buf).await.unwrap();
        assert_eq!(buf, vec![0x0A; 512]);
        dev.read_block(1, &mut buf).await.unwrap();
        assert_eq!(buf, vec![0x0B; 512]);

        // Five physical blocks are spoken for: header, bitmap, map block
        // and the two data blocks. The remaining 11 must all be available
        // to the 12 unwritten logical blocks, including the one the
        // relocation vacated.
        let mut wrote = 0;
        let mut failed = false;
        for i in 2..14 {
            match dev.write_block(i, &[i as u8; 512]).await {
                Ok(()) => wrote += 1,
                Err(DeviceError::OutOfSpace) => {
                    failed = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(wrote, 11);
        assert!(failed);
    }

    #[tokio::test]
    async fn exhausting_the_pool_reports_out_of_space() {
        // 8 physical blocks: header + bitmap + 1 map block leaves 5 for
        // data, but the partition claims 6.
        let base = formatted(8).await;
        PartitionDevice::resize(&base, 0, 6).await.unwrap();

        let dev = PartitionDevice::open(Box::new(base), 0).await.unwrap();
        let mut wrote = 0;
        let mut failed = false;
        for i in 0..6 {
            match dev.write_block(i, &[0xFF; 512]).await {
                Ok(()) => wrote += 1,
                Err(DeviceError::OutOfSpace) => {
                    failed = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(wrote, 5);
        assert!(failed);
    }

    #[tokio::test]
    async fn shrinking_is_rejected() {
        let base = formatted(64).await;
        PartitionDevice::resize(&base, 0, 8).await.unwrap();
        assert!(matches!(
            PartitionDevice::resize(&base, 0, 4).await,
            Err(DeviceError::BadGeometry(_))
        ));
    }

    #[tokio::test]
    async fn rejects_small_blocks_and_bad_partition_numbers() {
        let base = MemBlockDevice::new(256, 64).unwrap();
        assert!(matches!(
            PartitionDevice::format(&base).await,
            Err(DeviceError::BadGeometry(_))
        ));

        let base = formatted(64).await;
        assert!(matches!(
            PartitionDevice::resize(&base, 61, 4).await,
            Err(DeviceError::BadGeometry(_))
        ));
    }
}
