//! End-to-end concatenation of N member devices.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::blockdev::{BlockDevice, DeviceError, Result};

/// Last member a block lookup landed in; sequential access stays in the
/// same member, making the linear scan amortized O(1).
struct Cursor {
    member: usize,
    offset: u64,
    len: u64,
}

/// A device exposing its members one after another. Block I/O forwards to
/// the containing member; byte I/O uses the generic path, which may cross
/// member boundaries.
pub struct ConcatDevice {
    members: Vec<Box<dyn BlockDevice>>,
    block_size: usize,
    block_count: u64,
    cursor: Mutex<Cursor>,
}

impl ConcatDevice {
    /// Assemble a concatenation of `members`.
    pub fn open(members: Vec<Box<dyn BlockDevice>>) -> Result<Self> {
        if members.is_empty() {
            return Err(DeviceError::BadGeometry(
                "concat needs at least one member device".into(),
            ));
        }

        let block_size = members[0].block_size();
        for m in &members[1..] {
            if m.block_size() != block_size {
                return Err(DeviceError::BadGeometry(format!(
                    "concat members disagree on block size ({} and {})",
                    block_size,
                    m.block_size()
                )));
            }
        }

        let block_count = members.iter().map(|m| m.block_count()).sum();
        let cursor = Mutex::new(Cursor {
            member: 0,
            offset: 0,
            len: members[0].block_count(),
        });

        Ok(Self {
            block_size,
            block_count,
            cursor,
            members,
        })
    }

    /// Map a logical block to `(member, block within member)`.
    fn locate(&self, block: u64) -> (usize, u64) {
        let mut cursor = self.cursor.lock();
        if cursor.offset <= block && block < cursor.offset + cursor.len {
            return (cursor.member, block - cursor.offset);
        }

        let mut offset = 0;
        for (i, m) in self.members.iter().enumerate() {
            let len = m.block_count();
            if block < offset + len {
                *cursor = Cursor {
                    member: i,
                    offset,
                    len,
                };
                return (i, block - offset);
            }
            offset += len;
        }
        unreachable!("block index out of range");
    }
}

#[async_trait]
impl BlockDevice for ConcatDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn name(&self) -> &'static str {
        "concat"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;

    #[tokio::test]
    async fn spans_members_in_order() {
        let a = MemBlockDevice::new(32, 4).unwrap();
        let b = MemBlockDevice::new(32, 6).unwrap();
        let dev = ConcatDevice::open(vec![
            Box::new(a.clone()) as Box<dyn BlockDevice>,
            Box::new(b.clone()),
        ])
        .unwrap();
        assert_eq!(dev.block_count(), 10);

        // Logical block 5 is member 1, block 1.
        dev.write_block(5, &[0x5E; 32]).await.unwrap();
        let mut buf = vec![0u8; 32];
        b.read_block(1, &mut buf).await.unwrap();
        assert_eq!(buf, vec![0x5E; 32]);

        // And the boundary blocks map to the right members.
        dev.write_block(3, &[0x03; 32]).await.unwrap();
        dev.write_block(4, &[0x04; 32]).await.unwrap();
        a.read_block(3, &mut buf).await.unwrap();
        assert_eq!(buf, vec![0x03; 32]);
        b.read_block(0, &mut buf).await.unwrap();
        assert_eq!(buf, vec![0x04; 32]);
    }

    #[tokio::test]
    async fn byte_io_crosses_member_boundaries() {
        let a = MemBlockDevice::new(32, 2).unwrap();
        let b = MemBlockDevice::new(32, 2).unwrap();
        let dev = ConcatDevice::open(vec![
            Box::new(a) as Box<dyn BlockDevice>,
            Box::new(b),
        ])
        .unwrap();

        let pattern: Vec<u8> = (0..48).map(|i| i as u8 + 1).collect();
        dev.write_bytes(40, &pattern).await.unwrap();

        let mut back = vec![0u8; 48];
        dev.read_bytes(40, &mut back).await.unwrap();
        assert_eq!(back, pattern);
    }

    #[tokio::test]
    async fn random_access_moves_the_cursor_both_ways() {
        let members: Vec<Box<dyn BlockDevice>> = (0..3)
            .map(|_| Box::new(MemBlockDevice::new(32, 4).unwrap()) as Box<dyn BlockDevice>)
            .collect();
        let dev = ConcatDevice::open(members).unwrap();

        for which in [11u64, 0, 7, 4, 11, 3] {
            dev.write_block(which, &[which as u8; 32]).await.unwrap();
        }
        let mut buf = vec![0u8; 32];
        for which in [3u64, 11, 0, 4, 7] {
            dev.read_block(which, &mut buf).await.unwrap();
            assert_eq!(buf, vec![which as u8; 32]);
        }
    }
}
