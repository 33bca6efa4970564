//! The write-back block cache.
//!
//! Log-structured filesystems issue many small, misaligned, non-contiguous
//! block operations and perform badly against a raw SD card. This cache sits
//! between the byte-level facade and the card, serving whole 512-byte blocks
//! from a fixed pool, reading ahead on misses, and flushing dirty blocks in
//! coalesced multi-block writes on [`BlockCache::sync`].
//!
//! The cache only talks to a [`BlockDevice`], so everything here can be
//! exercised against a memory-backed device with no card attached.

use alloc::vec::Vec;

use crate::{Block, BlockCount, BlockDevice, BlockIdx};

#[cfg(feature = "log")]
use log::{debug, trace};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace};

/// Errors the cache (and the facade built on it) can produce, generic over
/// the error of the underlying block device.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error<E> {
    /// The underlying block device reported an error
    Device(E),
    /// A bad block number, offset or buffer length was passed in
    BadArgument,
    /// Erase was requested for a block with unsynced writes
    EraseDirty,
    /// The cache configuration is invalid
    BadConfig,
}

/// How the cache picks blocks to evict when it is full.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Evict the least recently used block, flushing it first when dirty.
    Lru,
    /// Evict the least recently used *clean* block, so eviction does not
    /// have to wait for a flush. When there are not enough clean blocks the
    /// whole cache is synced first.
    LruClean,
}

/// Cache geometry and behavior.
#[derive(Debug, Copy, Clone)]
pub struct CacheConfig {
    /// Number of 512-byte blocks the cache may hold. 0 disables caching
    /// entirely; every operation then goes straight to the device.
    pub max_blocks: usize,
    /// Eviction policy.
    pub policy: EvictionPolicy,
    /// How many consecutive blocks to fetch on a read miss. Must be 1 when
    /// `max_blocks` is 0 or 1, and within `1..=max_blocks` otherwise.
    pub read_ahead: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_blocks: 8,
            policy: EvictionPolicy::Lru,
            read_ahead: 1,
        }
    }
}

impl CacheConfig {
    fn validate<E>(&self) -> Result<(), Error<E>> {
        let ceiling = if self.max_blocks <= 1 {
            1
        } else {
            self.max_blocks
        };
        if self.read_ahead < 1 || self.read_ahead > ceiling {
            return Err(Error::BadConfig);
        }
        Ok(())
    }
}

/// One resident block: the number it is currently bound to, whether it holds
/// writes the device has not seen, and its content.
#[derive(Debug)]
struct CacheEntry {
    block_num: BlockIdx,
    dirty: bool,
    data: Block,
}

/// A write-back cache of 512-byte blocks in front of a [`BlockDevice`].
///
/// Invariants, after every public call: at most `max_blocks` entries, no two
/// entries bound to the same block number, and the recency order ends with
/// the most recently touched block. After [`BlockCache::sync`] no entry is
/// dirty.
pub struct BlockCache<D>
where
    D: BlockDevice,
{
    device: D,
    sectors: BlockCount,
    config: CacheConfig,
    /// The slot pool. Grows lazily up to `max_blocks` entries; thereafter
    /// entries are rebound in place and the pool never reallocates.
    entries: Vec<CacheEntry>,
    /// Resident block numbers, least recently touched first.
    order: Vec<BlockIdx>,
}

impl<D> BlockCache<D>
where
    D: BlockDevice,
{
    /// Create a cache in front of `device`. Fails with `BadConfig` for an
    /// out-of-range read-ahead, or with the device's error if the capacity
    /// cannot be read.
    pub fn new(mut device: D, config: CacheConfig) -> Result<Self, Error<D::Error>> {
        config.validate()?;
        let sectors = device.num_blocks().map_err(Error::Device)?;
        Ok(BlockCache {
            device,
            sectors,
            entries: Vec::with_capacity(config.max_blocks),
            order: Vec::with_capacity(config.max_blocks),
            config,
        })
    }

    /// Throw away all cache state and start over with a fresh pool.
    ///
    /// Unsynced blocks are lost. Call [`BlockCache::sync`] first if that
    /// matters; there is deliberately no implicit sync here.
    pub fn reset(&mut self, config: CacheConfig) -> Result<(), Error<D::Error>> {
        config.validate()?;
        self.entries = Vec::with_capacity(config.max_blocks);
        self.order = Vec::with_capacity(config.max_blocks);
        self.config = config;
        Ok(())
    }

    /// Borrow the underlying device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Borrow the underlying device mutably. The cache does not notice
    /// writes made behind its back.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Device capacity in blocks.
    pub fn num_blocks(&self) -> BlockCount {
        self.sectors
    }

    /// Number of currently resident blocks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is resident.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured cache capacity in blocks.
    pub fn capacity(&self) -> usize {
        self.config.max_blocks
    }

    /// Is the given block resident?
    pub fn contains(&self, block_num: BlockIdx) -> bool {
        self.position(block_num).is_some()
    }

    /// Does the given resident block hold unsynced writes? `None` when it is
    /// not resident.
    pub fn is_dirty(&self, block_num: BlockIdx) -> Option<bool> {
        self.position(block_num).map(|slot| self.entries[slot].dirty)
    }

    /// Resident block numbers, least recently touched first.
    pub fn usage_order(&self) -> impl Iterator<Item = BlockIdx> + '_ {
        self.order.iter().copied()
    }

    /// Copy the addressed block into `out` (which must be exactly 512
    /// bytes), fetching it - and, space permitting, the blocks after it -
    /// from the device when it is not resident.
    pub fn get(&mut self, block_num: BlockIdx, out: &mut [u8]) -> Result<(), Error<D::Error>> {
        if out.len() != Block::LEN {
            return Err(Error::BadArgument);
        }
        if block_num.0 >= self.sectors.0 {
            return Err(Error::BadArgument);
        }

        if self.config.max_blocks == 0 {
            let mut block = Block::new();
            self.device
                .read_block(&mut block, block_num)
                .map_err(Error::Device)?;
            out.copy_from_slice(&block.contents);
            return Ok(());
        }

        if let Some(slot) = self.position(block_num) {
            trace!("read hit for block {}", block_num.0);
            out.copy_from_slice(&self.entries[slot].data.contents);
            self.touch(block_num);
            return Ok(());
        }

        trace!("read miss for block {}", block_num.0);
        let slot = if self.entries.len() < self.config.max_blocks {
            self.fill_fresh(block_num)?
        } else {
            self.fill_evicting(block_num)?
        };
        out.copy_from_slice(&self.entries[slot].data.contents);
        Ok(())
    }

    /// Install a whole-block write (`data` must be exactly 512 bytes). The
    /// block becomes resident and dirty; the device is only touched when a
    /// victim has to be flushed first.
    pub fn put(&mut self, block_num: BlockIdx, data: &[u8]) -> Result<(), Error<D::Error>> {
        if data.len() != Block::LEN {
            return Err(Error::BadArgument);
        }
        if block_num.0 >= self.sectors.0 {
            return Err(Error::BadArgument);
        }

        if self.config.max_blocks == 0 {
            let mut block = Block::new();
            block.contents.copy_from_slice(data);
            return self
                .device
                .write_block(&block, block_num)
                .map_err(Error::Device);
        }

        if let Some(slot) = self.position(block_num) {
            trace!("write hit for block {}", block_num.0);
            self.entries[slot].data.contents.copy_from_slice(data);
            self.entries[slot].dirty = true;
            self.touch(block_num);
            return Ok(());
        }

        trace!("write miss for block {}", block_num.0);
        let slot = if self.entries.len() < self.config.max_blocks {
            self.entries.push(CacheEntry {
                block_num,
                dirty: false,
                data: Block::new(),
            });
            self.entries.len() - 1
        } else {
            let victims = self.select_victims(1)?;
            let slot = victims[0];
            self.flush_slot(slot)?;
            let old = self.entries[slot].block_num;
            self.order_remove(old);
            self.entries[slot].block_num = block_num;
            slot
        };
        self.entries[slot].data.contents.copy_from_slice(data);
        self.entries[slot].dirty = true;
        self.order.push(block_num);
        Ok(())
    }

    /// Write every dirty block back to the device, coalescing runs of
    /// consecutive block numbers into one multi-block write each.
    ///
    /// Recency order is not disturbed, and a second call with nothing dirty
    /// produces no device traffic. If a run fails to write its blocks stay
    /// dirty, so a later `sync` retries them.
    pub fn sync(&mut self) -> Result<(), Error<D::Error>> {
        let mut dirty: Vec<usize> = (0..self.entries.len())
            .filter(|&slot| self.entries[slot].dirty)
            .collect();
        dirty.sort_unstable_by_key(|&slot| self.entries[slot].block_num);

        let mut i = 0;
        while i < dirty.len() {
            // extend the run while the block numbers stay consecutive
            let mut j = i + 1;
            while j < dirty.len()
                && self.entries[dirty[j]].block_num.0
                    == self.entries[dirty[j - 1]].block_num.0 + 1
            {
                j += 1;
            }
            let run = &dirty[i..j];
            let start = self.entries[run[0]].block_num;
            debug!("sync: writing {} blocks at {}", run.len(), start.0);
            {
                let entries = &self.entries;
                let bufs: Vec<&Block> = run.iter().map(|&slot| &entries[slot].data).collect();
                self.device.write(&bufs, start).map_err(Error::Device)?;
            }
            for &slot in run {
                self.entries[slot].dirty = false;
            }
            i = j;
        }
        Ok(())
    }

    /// Make `block_num` read back as all 0xFF, the contract a log-structured
    /// filesystem expects of an erased block.
    ///
    /// No erase command goes to the card (real cards promise nothing about
    /// the content of freshly erased blocks in SPI mode); the erased state
    /// is materialized as a dirty resident block, or written straight
    /// through when caching is disabled. A dirty resident block fails with
    /// `EraseDirty`: the caller has unsynced data there and must decide what
    /// to do with it first.
    pub fn erase(&mut self, block_num: BlockIdx) -> Result<(), Error<D::Error>> {
        if block_num.0 >= self.sectors.0 {
            return Err(Error::BadArgument);
        }
        if let Some(slot) = self.position(block_num) {
            if self.entries[slot].dirty {
                return Err(Error::EraseDirty);
            }
            self.entries[slot].data.contents = [0xFF; Block::LEN];
            self.entries[slot].dirty = true;
            self.touch(block_num);
            Ok(())
        } else {
            self.put(block_num, &[0xFF; Block::LEN])
        }
    }

    fn position(&self, block_num: BlockIdx) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.block_num == block_num)
    }

    /// Move `block_num` to the most-recently-touched end.
    fn touch(&mut self, block_num: BlockIdx) {
        self.order_remove(block_num);
        self.order.push(block_num);
    }

    fn order_remove(&mut self, block_num: BlockIdx) {
        if let Some(pos) = self.order.iter().position(|&b| b == block_num) {
            self.order.remove(pos);
        }
    }

    /// How many consecutive blocks a miss on `block_num` should fetch:
    /// bounded by the configured read-ahead, the given slot budget and the
    /// device capacity, and collapsed to 1 when one of the following blocks
    /// is already resident - we never read ahead over blocks we already
    /// have.
    fn effective_read_ahead(&self, block_num: BlockIdx, budget: usize) -> usize {
        let mut span = self.config.read_ahead.min(budget);
        span = span.min((self.sectors.0 - block_num.0) as usize);
        if (1..span).any(|i| self.contains(BlockIdx(block_num.0 + i as u32))) {
            span = 1;
        }
        span
    }

    /// Fetch `block_num` (plus read-ahead) into unused pool slots. Returns
    /// the slot now bound to `block_num`.
    fn fill_fresh(&mut self, block_num: BlockIdx) -> Result<usize, Error<D::Error>> {
        let free = self.config.max_blocks - self.entries.len();
        let span = self.effective_read_ahead(block_num, free);

        let first_slot = self.entries.len();
        for i in 0..span {
            self.entries.push(CacheEntry {
                block_num: BlockIdx(block_num.0 + i as u32),
                dirty: false,
                data: Block::new(),
            });
        }

        let result = {
            let mut bufs: Vec<&mut Block> = self.entries[first_slot..]
                .iter_mut()
                .map(|entry| &mut entry.data)
                .collect();
            self.device.read(&mut bufs, block_num)
        };
        if let Err(e) = result {
            // the new entries hold garbage, drop them again
            self.entries.truncate(first_slot);
            return Err(Error::Device(e));
        }

        for i in 0..span {
            self.order.push(BlockIdx(block_num.0 + i as u32));
        }
        Ok(first_slot)
    }

    /// Fetch `block_num` (plus read-ahead) into slots recycled from evicted
    /// blocks. Returns the slot now bound to `block_num`.
    fn fill_evicting(&mut self, block_num: BlockIdx) -> Result<usize, Error<D::Error>> {
        let span = self.effective_read_ahead(block_num, self.config.max_blocks);
        let mut victims = self.select_victims(span)?;
        victims.sort_unstable();

        // Under Lru the victims may be dirty; they get flushed one at a
        // time. LruClean only returns dirty victims after it has already
        // synced, so these are no-ops then.
        for &slot in &victims {
            self.flush_slot(slot)?;
        }

        let result = {
            let mut bufs = collect_scattered(&mut self.entries, &victims);
            self.device.read(&mut bufs, block_num)
        };
        if let Err(e) = result {
            // The transfer may have clobbered any of the victim buffers, so
            // their old bindings can no longer be trusted: drop them.
            self.remove_slots(&victims);
            return Err(Error::Device(e));
        }

        for (i, &slot) in victims.iter().enumerate() {
            let old = self.entries[slot].block_num;
            self.order_remove(old);
            let fresh = BlockIdx(block_num.0 + i as u32);
            self.entries[slot].block_num = fresh;
            self.entries[slot].dirty = false;
            self.order.push(fresh);
        }

        Ok(victims[0])
    }

    /// Pick `n` resident blocks to evict, per the configured policy.
    /// Returns their slot indices, oldest victim first.
    fn select_victims(&mut self, n: usize) -> Result<Vec<usize>, Error<D::Error>> {
        if let EvictionPolicy::LruClean = self.config.policy {
            let clean: Vec<usize> = self
                .order
                .iter()
                .filter_map(|&block| self.position(block))
                .filter(|&slot| !self.entries[slot].dirty)
                .take(n)
                .collect();
            if clean.len() == n {
                return Ok(clean);
            }
            // Not enough clean blocks; sync, after which everything is.
            self.sync()?;
        }

        let mut victims = Vec::with_capacity(n);
        for &block in self.order.iter() {
            if victims.len() == n {
                break;
            }
            if let Some(slot) = self.position(block) {
                victims.push(slot);
            }
        }
        Ok(victims)
    }

    /// Write the slot back to the device if it is dirty. On success the
    /// entry is clean; on failure it stays dirty for a later retry.
    fn flush_slot(&mut self, slot: usize) -> Result<(), Error<D::Error>> {
        if !self.entries[slot].dirty {
            return Ok(());
        }
        let block_num = self.entries[slot].block_num;
        trace!("flushing evicted block {}", block_num.0);
        self.device
            .write(&[&self.entries[slot].data], block_num)
            .map_err(Error::Device)?;
        self.entries[slot].dirty = false;
        Ok(())
    }

    /// Drop the given slots (ascending indices) and their recency entries.
    /// Only used when a fill transfer fails; the pool shrinks and regrows
    /// lazily afterwards.
    fn remove_slots(&mut self, slots: &[usize]) {
        for &slot in slots.iter().rev() {
            let entry = self.entries.swap_remove(slot);
            self.order_remove(entry.block_num);
        }
    }
}

/// Collect mutable references to the buffers of the given pool slots.
/// `slots` must be sorted ascending and free of duplicates.
fn collect_scattered<'a>(entries: &'a mut [CacheEntry], slots: &[usize]) -> Vec<&'a mut Block> {
    let mut bufs = Vec::with_capacity(slots.len());
    let mut rest = entries;
    let mut consumed = 0;
    for &slot in slots {
        let (head, tail) = core::mem::take(&mut rest).split_at_mut(slot - consumed + 1);
        if let Some(entry) = head.last_mut() {
            bufs.push(&mut entry.data);
        }
        rest = tail;
        consumed = slot + 1;
    }
    bufs
}
