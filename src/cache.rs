//! Direct-mapped write-back block cache.

use crate::blockdev::{BlockDevice, Result};

/// 64-bit integer mix (Thomas Wang) reduced to a bucket hash.
fn mix64(key: u64) -> u32 {
    let mut key = (!key).wrapping_add(key << 18);
    key ^= key >> 31;
    key = key.wrapping_mul(21);
    key ^= key >> 11;
    key = key.wrapping_add(key << 6);
    key ^= key >> 22;
    key as u32
}

struct CacheSlot {
    index: Option<u64>,
    dirty: bool,
    data: Vec<u8>,
}

/// A direct-mapped write-back cache of whole blocks.
///
/// The cache does not own the device it caches; every operation takes the
/// base device as a parameter. This lets a layer cache its metadata blocks
/// while addressing the same base directly for data blocks.
///
/// There is at most one cached copy of any block. A hash collision evicts
/// the occupant (writing it back if dirty). A failed write-back on eviction
/// is logged and the slot is dropped; the lost write is the documented
/// policy, not silently masked.
pub struct BlockCache {
    slots: Vec<CacheSlot>,
}

impl BlockCache {
    /// Create a cache with `slots` slots of `block_size` bytes each.
    pub fn new(block_size: usize, slots: usize) -> Self {
        assert!(slots >= 1, "cache needs at least one slot");
        Self {
            slots: (0..slots)
                .map(|_| CacheSlot {
                    index: None,
                    dirty: false,
                    data: vec![0u8; block_size],
                })
                .collect(),
        }
    }

    fn bucket(&self, index: u64) -> usize {
        mix64(index) as usize % self.slots.len()
    }

    /// Empty one slot, writing its contents back first if dirty.
    async fn evict(&mut self, base: &dyn BlockDevice, slot: usize) {
        let s = &mut self.slots[slot];
        if s.dirty {
            if let Some(index) = s.index {
                if let Err(e) = base.write_block(index, &s.data).await {
                    log::error!(
                        "block-cache: failed to write block {} back to {} on eviction: {}",
                        index,
                        base.name(),
                        e
                    );
                }
            }
        }
        s.dirty = false;
        s.index = None;
    }

    /// Return the cached contents of block `index`, filling the slot from
    /// `base` on a miss. The returned slice may be mutated in place;
    /// call [`BlockCache::mark_dirty`] afterwards to schedule a write-back.
    pub async fn read(&mut self, base: &dyn BlockDevice, index: u64) -> Result<&mut [u8]> {
        let slot = self.bucket(index);
        if self.slots[slot].index != Some(index) {
            self.evict(base, slot).await;
            base.read_block(index, &mut self.slots[slot].data).await?;
            self.slots[slot].index = Some(index);
        }
        Ok(&mut self.slots[slot].data)
    }

    /// Copy `data` into the slot for block `index` and mark it dirty.
    pub async fn write(&mut self, base: &dyn BlockDevice, index: u64, data: &[u8]) {
        let slot = self.bucket(index);
        if self.slots[slot].index != Some(index) {
            self.evict(base, slot).await;
        }
        self.slots[slot].data.copy_from_slice(data);
        self.slots[slot].index = Some(index);
        self.slots[slot].dirty = true;
    }

    /// Mark the slot holding block `index` dirty after an in-place update
    /// through [`BlockCache::read`].
    pub fn mark_dirty(&mut self, index: u64) {
        let slot = self.bucket(index);
        debug_assert_eq!(self.slots[slot].index, Some(index), "slot does not hold this block");
        self.slots[slot].dirty = true;
    }

    /// Evict every slot, writing dirty ones back. The next read of any
    /// block misses.
    pub async fn flush(&mut self, base: &dyn BlockDevice) {
        for slot in 0..self.slots.len() {
            self.evict(base, slot).await;
        }
    }
}
