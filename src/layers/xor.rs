//! Single-parity redundancy across N member devices, with online
//! reconstruction of a failed member.
//!
//! There is no header; all-zero members are valid. One "slice" is the row
//! of blocks at the same index on every member. Within slice `s` the parity
//! block sits on member `s mod N` and the other members carry data, so
//! parity load rotates across the pool:
//!
//! ```text
//!     D1   D2   D3   D4
//!     p    d    d    d      slice 0
//!     d    p    d    d      slice 1
//!     d    d    p    d      slice 2
//! ```
//!
//! The exposed device is the column-major concatenation of the data blocks.
//! A single cached slice turns a sequential write stream into one load and
//! one writeback per slice; random I/O reloads the slice per block, which
//! is a performance characteristic, not a correctness issue.

use async_trait::async_trait;

use crate::blockdev::{BlockDevice, DeviceError, Result};

struct SliceCache {
    /// All members' blocks for the cached slice, parity in place.
    data: Vec<u8>,
    index: Option<u64>,
    dirty: bool,
}

/// A device that stripes data over `N ≥ 3` members with one rotating parity
/// block per slice. Any single member failure is tolerated: reads
/// reconstruct the missing block by XOR and write the repaired block back.
pub struct XorDevice {
    members: Vec<Box<dyn BlockDevice>>,
    block_size: usize,
    block_count: u64,
    state: tokio::sync::Mutex<SliceCache>,
}

impl XorDevice {
    /// Assemble an xor group over `members`.
    pub fn open(members: Vec<Box<dyn BlockDevice>>) -> Result<Self> {
        if members.len() < 3 {
            return Err(DeviceError::BadGeometry(format!(
                "xor needs at least three member devices, got {}",
                members.len()
            )));
        }

        let block_size = members[0].block_size();
        for m in &members[1..] {
            if m.block_size() != block_size {
                return Err(DeviceError::BadGeometry(format!(
                    "xor members disagree on block size ({} and {})",
                    block_size,
                    m.block_size()
                )));
            }
        }

        let min = members.iter().map(|m| m.block_count()).min().unwrap_or(0);
        let max = members.iter().map(|m| m.block_count()).max().unwrap_or(0);
        if min != max {
            log::warn!(
                "xor: members differ in size; truncating long members to {} blocks (longest is {})",
                min,
                max
            );
        }

        let block_count = min * (members.len() as u64 - 1);

        Ok(Self {
            block_size,
            block_count,
            state: tokio::sync::Mutex::new(SliceCache {
                data: vec![0u8; block_size * members.len()],
                index: None,
                dirty: false,
            }),
            members,
        })
    }

    /// Member positions for logical block `which`: the slice, the member
    /// holding the data, and the member holding parity.
    fn locate(&self, which: u64) -> (u64, usize, usize) {
        let n = self.members.len() as u64;
        let slice = which / (n - 1);
        let mut data_at = which % (n - 1);
        let parity_at = slice % n;
        // Data positions skip over the parity member.
        if parity_at <= data_at {
            data_at += 1;
        }
        (slice, data_at as usize, parity_at as usize)
    }

    /// Write the cached slice out to every member. One member failure
    /// costs redundancy and is logged; a second fails the flush.
    async fn flush_slice(&self, state: &mut SliceCache) -> Result<()> {
        let slice = match state.index {
            Some(slice) => slice,
            None => return Ok(()),
        };
        if !state.dirty {
            return Ok(());
        }

        let bs = self.block_size;
        let mut failed = 0;
        for (i, member) in self.members.iter().enumerate() {
            if let Err(e) = member.write_block(slice, &state.data[i * bs..(i + 1) * bs]).await {
                failed += 1;
                if failed > 1 {
                    log::error!(
                        "xor: multiple members failed writing slice {}, failing the write",
                        slice
                    );
                    return Err(DeviceError::RedundancyLost { slice });
                }
                log::error!("xor: member {} failed writing slice {}: {}", i, slice, e);
            }
        }

        state.dirty = false;
        Ok(())
    }

    /// Make `slice` the cached slice, flushing the previous one if dirty.
    /// Reconstructs and repairs a single failed member on the way in.
    async fn switch_slice(&self, state: &mut SliceCache, slice: u64) -> Result<()> {
        if state.index == Some(slice) {
            return Ok(());
        }

        self.flush_slice(state).await?;
        state.index = None;

        let bs = self.block_size;
        let mut which_failed = None;
        for (i, member) in self.members.iter().enumerate() {
            let buf = &mut state.data[i * bs..(i + 1) * bs];
            if let Err(e) = member.read_block(slice, buf).await {
                if which_failed.is_some() {
                    log::error!(
                        "xor: second member failed reading slice {}: {}",
                        slice,
                        e
                    );
                    return Err(DeviceError::RedundancyLost { slice });
                }
                log::warn!(
                    "xor: member {} failed reading slice {}: {}; reconstructing",
                    i,
                    slice,
                    e
                );
                which_failed = Some(i);
            }
        }

        if let Some(failed) = which_failed {
            let mut rebuilt = vec![0u8; bs];
            for (i, _) in self.members.iter().enumerate() {
                if i != failed {
                    for (r, b) in rebuilt.iter_mut().zip(&state.data[i * bs..(i + 1) * bs]) {
                        *r ^= b;
                    }
                }
            }
            state.data[failed * bs..(failed + 1) * bs].copy_from_slice(&rebuilt);

            if let Err(e) = self.members[failed].write_block(slice, &rebuilt).await {
                log::error!(
                    "xor: repaired slice {} but could not write it back to member {}: {}",
                    slice,
                    failed,
                    e
                );
            }
        }

        state.index = Some(slice);
        Ok(())
    }
}

#[async_trait]
impl BlockDevice for XorDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn name(&self) -> &'static str {
        "xor"
    }

    async fn read_block(&self, which: u64, buf: &mut [u8]) -> Result<()> {
        assert!(which < self.block_count, "block index out of range");
        assert_eq!(buf.len(), self.block_size, "buffer is not one block long");

        let (slice, data_at, _) = self.locate(which);

        let mut state = self.state.lock().await;
        self.switch_slice(&mut state, slice).await?;

        let bs = self.block_size;
        buf.copy_from_slice(&state.data[data_at * bs..(data_at + 1) * bs]);
        Ok(())
    }

    async fn write_block(&self, which: u64, data: &[u8]) -> Result<()> {
        assert!(which < self.block_count, "block index out of range");
        assert_eq!(data.len(), self.block_size, "buffer is not one block long");

        let (slice, data_at, parity_at) = self.locate(which);

        let mut state = self.state.lock().await;
        self.switch_slice(&mut state, slice).await?;

        // parity ^= new ^ old, then replace the data block.
        let bs = self.block_size;
        for i in 0..bs {
            let delta = data[i] ^ state.data[data_at * bs + i];
            state.data[parity_at * bs + i] ^= delta;
        }
        state.data[data_at * bs..(data_at + 1) * bs].copy_from_slice(data);
        state.dirty = true;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.flush_slice(&mut state).await?;
        drop(state);

        for member in &self.members {
            member.flush().await?;
        }
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.flush_slice(&mut state).await?;
        drop(state);

        for member in &self.members {
            member.sync().await?;
        }
        Ok(())
    }

    async fn clear_caches(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.flush_slice(&mut state).await?;
        state.index = None;
        drop(state);

        for member in &self.members {
            member.clear_caches().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.flush_slice(&mut state).await?;
        drop(state);

        for member in &mut self.members {
            member.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Wraps a member and fails its reads on command.
    struct FlakyDevice {
        inner: MemBlockDevice,
        fail_reads: Arc<AtomicBool>,
    }

    #[async_trait]
    impl BlockDevice for FlakyDevice {
        fn block_size(&self) -> usize {
            self.inner.block_size()
        }
        fn block_count(&self) -> u64 {
            self.inner.block_count()
        }
        fn name(&self) -> &'static str {
            "flaky"
        }
        async fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<()> {
            if self.fail_reads.load(Ordering::Relaxed) {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected").into());
            }
            self.inner.read_block(index, buf).await
        }
        async fn write_block(&self, index: u64, data: &[u8]) -> Result<()> {
            self.inner.write_block(index, data).await
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

    fn members(n: usize, block_size: usize, blocks: u64) -> (Vec<MemBlockDevice>, Vec<Box<dyn BlockDevice>>) {
        let raw: Vec<MemBlockDevice> = (0..n)
            .map(|_| MemBlockDevice::new(block_size, blocks).unwrap())
            .collect();
        let boxed = raw
            .iter()
            .map(|m| Box::new(m.clone()) as Box<dyn BlockDevice>)
            .collect();
        (raw, boxed)
    }

    #[tokio::test]
    async fn geometry_and_round_trip() {
        let (_raw, boxed) = members(3, 32, 16);
        let dev = XorDevice::open(boxed).unwrap();
        assert_eq!(dev.block_count(), 32);

        for i in 0..dev.block_count() {
            dev.write_block(i, &[i as u8; 32]).await.unwrap();
        }
        dev.flush().await.unwrap();

        let mut buf = vec![0u8; 32];
        for i in 0..dev.block_count() {
            dev.read_block(i, &mut buf).await.unwrap();
            assert_eq!(buf, vec![i as u8; 32]);
        }
    }

    #[tokio::test]
    async fn parity_covers_every_data_block() {
        let (raw, boxed) = members(3, 32, 16);
        let dev = XorDevice::open(boxed).unwrap();

        for i in 0..dev.block_count() {
            dev.write_block(i, &[(i as u8).wrapping_mul(3); 32]).await.unwrap();
        }
        dev.flush().await.unwrap();

        // In every slice the three member blocks XOR to zero.
        let mut blocks = vec![vec![0u8; 32]; 3];
        for slice in 0..16 {
            for (m, block) in raw.iter().zip(blocks.iter_mut()) {
                m.read_block(slice, block).await.unwrap();
            }
            for i in 0..32 {
                assert_eq!(blocks[0][i] ^ blocks[1][i] ^ blocks[2][i], 0);
            }
        }
    }

    #[tokio::test]
    async fn failing_member_read_is_tolerated_and_written_back() {
        let fail = Arc::new(AtomicBool::new(false));
        let raw: Vec<MemBlockDevice> = (0..3)
            .map(|_| MemBlockDevice::new(32, 16).unwrap())
            .collect();

        let mut boxed: Vec<Box<dyn BlockDevice>> = Vec::new();
        boxed.push(Box::new(FlakyDevice {
            inner: raw[0].clone(),
            fail_reads: fail.clone(),
        }));
        boxed.push(Box::new(raw[1].clone()));
        boxed.push(Box::new(raw[2].clone()));

        let dev = XorDevice::open(boxed).unwrap();
        dev.write_block(0, &[0xAB; 32]).await.unwrap();
        dev.write_block(1, &[0xCD; 32]).await.unwrap();
        dev.flush().await.unwrap();
        dev.clear_caches().await.unwrap();

        // Corrupt member 0 and make its reads fail; the group must still
        // serve the data and repair the member once reads come back.
        raw[0].write_block(0, &[0x00; 32]).await.unwrap();
        fail.store(true, Ordering::Relaxed);

        let mut buf = vec![0u8; 32];
        dev.read_block(0, &mut buf).await.unwrap();
        assert_eq!(buf, vec![0xAB; 32]);
        dev.read_block(1, &mut buf).await.unwrap();
        assert_eq!(buf, vec![0xCD; 32]);

        fail.store(false, Ordering::Relaxed);
        dev.clear_caches().await.unwrap();

        // The write-back repaired member 0's block (slice 0 parity).
        let mut m0 = vec![0u8; 32];
        raw[0].read_block(0, &mut m0).await.unwrap();
        let mut expect = vec![0u8; 32];
        let mut a = vec![0u8; 32];
        let mut b = vec![0u8; 32];
        raw[1].read_block(0, &mut a).await.unwrap();
        raw[2].read_block(0, &mut b).await.unwrap();
        for i in 0..32 {
            expect[i] = a[i] ^ b[i];
        }
        assert_eq!(m0, expect);
    }

    #[tokio::test]
    async fn two_failing_members_lose_redundancy() {
        let fail = Arc::new(AtomicBool::new(false));
        let raw: Vec<MemBlockDevice> = (0..3)
            .map(|_| MemBlockDevice::new(32, 8).unwrap())
            .collect();

        let mut boxed: Vec<Box<dyn BlockDevice>> = Vec::new();
        for m in &raw[..2] {
            boxed.push(Box::new(FlakyDevice {
                inner: m.clone(),
                fail_reads: fail.clone(),
            }));
        }
        boxed.push(Box::new(raw[2].clone()));

        let dev = XorDevice::open(boxed).unwrap();
        dev.write_block(0, &[0x42; 32]).await.unwrap();
        dev.flush().await.unwrap();
        dev.clear_caches().await.unwrap();

        fail.store(true, Ordering::Relaxed);
        let mut buf = vec![0u8; 32];
        assert!(matches!(
            dev.read_block(0, &mut buf).await,
            Err(DeviceError::RedundancyLost { slice: 0 })
        ));
    }

    #[tokio::test]
    async fn rejects_small_or_mismatched_pools() {
        let (_r1, boxed) = members(2, 32, 8);
        assert!(matches!(
            XorDevice::open(boxed),
            Err(DeviceError::BadGeometry(_))
        ));

        let a = MemBlockDevice::new(32, 8).unwrap();
        let b = MemBlockDevice::new(64, 8).unwrap();
        let c = MemBlockDevice::new(32, 8).unwrap();
        let boxed: Vec<Box<dyn BlockDevice>> =
            vec![Box::new(a), Box::new(b), Box::new(c)];
        assert!(matches!(
            XorDevice::open(boxed),
            Err(DeviceError::BadGeometry(_))
        ));
    }

    #[tokio::test]
    async fn short_members_truncate_the_pool() {
        let a = MemBlockDevice::new(32, 8).unwrap();
        let b = MemBlockDevice::new(32, 6).unwrap();
        let c = MemBlockDevice::new(32, 8).unwrap();
        let boxed: Vec<Box<dyn BlockDevice>> =
            vec![Box::new(a), Box::new(b), Box::new(c)];
        let dev = XorDevice::open(boxed).unwrap();
        assert_eq!(dev.block_count(), 12);
    }
}
