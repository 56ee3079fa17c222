//! Round-robin striping across N member devices.
//!
//! Logical block `w` lives at member `w mod N`, block `w / N`, so a
//! sequential stream spreads its I/O over every member.

use async_trait::async_trait;

use crate::blockdev::{BlockDevice, DeviceError, Result};

/// A device interleaving its blocks across equal-block-size members.
/// Members of unequal length are truncated to the shortest.
pub struct StripeDevice {
    members: Vec<Box<dyn BlockDevice>>,
    block_size: usize,
    block_count: u64,
}

impl StripeDevice {
    /// Assemble a stripe over `members`.
    pub fn open(members: Vec<Box<dyn BlockDevice>>) -> Result<Self> {
        if members.is_empty() {
            return Err(DeviceError::BadGeometry(
                "stripe needs at least one member device".into(),
            ));
        }

        let block_size = members[0].block_size();
        for m in &members[1..] {
            if m.block_size() != block_size {
                return Err(DeviceError::BadGeometry(format!(
                    "stripe members disagree on block size ({} and {})",
                    block_size,
                    m.block_size()
                )));
            }
        }

        let min = members.iter().map(|m| m.block_count()).min().unwrap_or(0);
        let max = members.iter().map(|m| m.block_count()).max().unwrap_or(0);
        if min != max {
            log::warn!(
                "stripe: members differ in size; truncating long members to {} blocks (longest is {})",
                min,
                max
            );
        }

        let block_count = min * members.len() as u64;
        Ok(Self {
            block_size,
            block_count,
            members,
        })
    }

    fn locate(&self, which: u64) -> (usize, u64) {
        let n = self.members.len() as u64;
        ((which % n) as usize, which / n)
    }
}

#[async_trait]
impl BlockDevice for StripeDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn name(&self) -> &'static str {
        "stripe"
    }

    async fn read_block(&self, which: u64, buf: &mut [u8]) -> Result<()> {
        assert!(which < self.block_count, "block index out of range");
        assert_eq!(buf.len(), self.block_size, "buffer is not one block long");

        let (member, block) = self.locate(which);
        self.members[member].read_block(block, buf).await
    }

    async fn write_block(&self, which: u64, data: &[u8]) -> Result<()> {
        assert!(which < self.block_count, "block index out of range");
        assert_eq!(data.len(), self.block_size, "buffer is not one block long");

        let (member, block) = self.locate(which);
        self.members[member].write_block(block, data).await
    }

    async fn flush(&self) -> Result<()> {
        for member in &self.members {
            member.flush().await?;
        }
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        for member in &self.members {
            member.sync().await?;
        }
        Ok(())
    }

    async fn clear_caches(&self) -> Result<()> {
        for member in &self.members {
            member.clear_caches().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        for member in &mut self.members {
            member.close().await?;
        }
        Ok(())
    }
}
