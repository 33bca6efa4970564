//! The filesystem-facing block device.
//!
//! [`SdCard`] turns the whole-block world of [`BlockCache`] into the
//! arbitrary-offset, arbitrary-length interface a filesystem wants to mount:
//! `read`/`write` accept any byte range, and `ioctl` carries the sync,
//! geometry and erase operations. One scratch block, owned here and never
//! aliased by the cache, stages every partial-block transfer.

use crate::cache::{BlockCache, CacheConfig, Error};
use crate::{Block, BlockCount, BlockDevice, BlockIdx};

/// `ioctl` operation: flush all buffered writes.
pub const IOCTL_SYNC: u8 = 3;
/// `ioctl` operation: report the device size in blocks.
pub const IOCTL_BLOCK_COUNT: u8 = 4;
/// `ioctl` operation: report the block size in bytes.
pub const IOCTL_BLOCK_SIZE: u8 = 5;
/// `ioctl` operation: erase the block named by the argument.
pub const IOCTL_ERASE: u8 = 6;

/// A cached block device ready to be mounted as a filesystem.
///
/// `D` is usually an acquired [`crate::SdMmcSpi`], but anything implementing
/// [`BlockDevice`] works - tests run the whole stack against a block of
/// memory.
pub struct SdCard<D>
where
    D: BlockDevice,
{
    cache: BlockCache<D>,
    scratch: Block,
}

impl<D> SdCard<D>
where
    D: BlockDevice,
{
    /// Wrap `device` in a cache with the given configuration.
    pub fn new(device: D, config: CacheConfig) -> Result<Self, Error<D::Error>> {
        Ok(SdCard {
            cache: BlockCache::new(device, config)?,
            scratch: Block::new(),
        })
    }

    /// Borrow the block cache, e.g. to inspect residency or reach the
    /// underlying device.
    pub fn cache(&self) -> &BlockCache<D> {
        &self.cache
    }

    /// Borrow the block cache mutably, e.g. to
    /// [`reset`](BlockCache::reset) it.
    pub fn cache_mut(&mut self) -> &mut BlockCache<D> {
        &mut self.cache
    }

    /// Device capacity in blocks.
    pub fn num_blocks(&self) -> BlockCount {
        self.cache.num_blocks()
    }

    /// The block size in bytes. Always 512.
    pub fn block_size(&self) -> usize {
        Block::LEN
    }

    /// Flush all buffered writes to the device.
    pub fn sync(&mut self) -> Result<(), Error<D::Error>> {
        self.cache.sync()
    }

    /// Erase a block: after this it reads back as all 0xFF. See
    /// [`BlockCache::erase`] for the contract.
    pub fn erase(&mut self, block_num: BlockIdx) -> Result<(), Error<D::Error>> {
        self.cache.erase(block_num)
    }

    /// Read `buf.len()` bytes starting `offset` bytes into block
    /// `block_num`.
    ///
    /// The offset may be any size; whole blocks of it are folded into the
    /// block number first. Ranges that run past the end of the device fail
    /// with `BadArgument` before anything is transferred.
    pub fn read(
        &mut self,
        block_num: BlockIdx,
        buf: &mut [u8],
        offset: u32,
    ) -> Result<(), Error<D::Error>> {
        if buf.is_empty() {
            return Ok(());
        }
        let (mut block_num, offset, nblocks) = normalize(block_num, offset, buf.len());
        self.check_range(block_num, nblocks)?;

        if nblocks == 1 {
            // One block, partial or complete
            self.cache.get(block_num, &mut self.scratch.contents)?;
            buf.copy_from_slice(&self.scratch.contents[offset..offset + buf.len()]);
            return Ok(());
        }

        let mut done = 0;

        // Leading partial block
        if offset > 0 {
            self.cache.get(block_num, &mut self.scratch.contents)?;
            let head = Block::LEN - offset;
            buf[..head].copy_from_slice(&self.scratch.contents[offset..]);
            done += head;
            block_num.0 += 1;
        }

        // Whole blocks go straight into the caller's buffer
        while done + Block::LEN <= buf.len() {
            self.cache.get(block_num, &mut buf[done..done + Block::LEN])?;
            done += Block::LEN;
            block_num.0 += 1;
        }

        // Trailing partial block
        if done < buf.len() {
            self.cache.get(block_num, &mut self.scratch.contents)?;
            let tail = buf.len() - done;
            buf[done..].copy_from_slice(&self.scratch.contents[..tail]);
        }

        Ok(())
    }

    /// Write `buf.len()` bytes starting `offset` bytes into block
    /// `block_num`.
    ///
    /// Partial head and tail blocks are read-modified through the scratch
    /// block; whole blocks in the middle are installed directly. The data is
    /// buffered in the cache until [`SdCard::sync`] (or an eviction) pushes
    /// it to the device, but a read of the same range always observes it.
    pub fn write(
        &mut self,
        block_num: BlockIdx,
        buf: &[u8],
        offset: u32,
    ) -> Result<(), Error<D::Error>> {
        if buf.is_empty() {
            return Ok(());
        }
        let (mut block_num, offset, nblocks) = normalize(block_num, offset, buf.len());
        self.check_range(block_num, nblocks)?;

        if nblocks == 1 {
            if offset == 0 && buf.len() == Block::LEN {
                // Single complete block, no need to read
                self.cache.put(block_num, buf)?;
            } else {
                // Single partial block, read-modify-write
                self.cache.get(block_num, &mut self.scratch.contents)?;
                self.scratch.contents[offset..offset + buf.len()].copy_from_slice(buf);
                self.cache.put(block_num, &self.scratch.contents)?;
            }
            return Ok(());
        }

        let mut done = 0;

        // Leading partial block
        if offset > 0 {
            self.cache.get(block_num, &mut self.scratch.contents)?;
            let head = Block::LEN - offset;
            self.scratch.contents[offset..].copy_from_slice(&buf[..head]);
            self.cache.put(block_num, &self.scratch.contents)?;
            done += head;
            block_num.0 += 1;
        }

        // Whole blocks from the caller's buffer
        while done + Block::LEN <= buf.len() {
            self.cache.put(block_num, &buf[done..done + Block::LEN])?;
            done += Block::LEN;
            block_num.0 += 1;
        }

        // Trailing partial block
        if done < buf.len() {
            self.cache.get(block_num, &mut self.scratch.contents)?;
            let tail = buf.len() - done;
            self.scratch.contents[..tail].copy_from_slice(&buf[done..]);
            self.cache.put(block_num, &self.scratch.contents)?;
        }

        Ok(())
    }

    /// The numeric control interface filesystems drive.
    ///
    /// Op 3 syncs, op 4 reports the block count, op 5 the block size, op 6
    /// erases the block named by `arg`. Anything else is accepted and
    /// reports 0; callers do not depend on other ops.
    pub fn ioctl(&mut self, op: u8, arg: u32) -> Result<i32, Error<D::Error>> {
        match op {
            IOCTL_SYNC => {
                self.sync()?;
                Ok(0)
            }
            IOCTL_BLOCK_COUNT => Ok(self.num_blocks().0 as i32),
            IOCTL_BLOCK_SIZE => Ok(Block::LEN as i32),
            IOCTL_ERASE => {
                self.erase(BlockIdx(arg))?;
                Ok(0)
            }
            _ => Ok(0),
        }
    }

    fn check_range(&self, block_num: BlockIdx, nblocks: usize) -> Result<(), Error<D::Error>> {
        let end = u64::from(block_num.0) + nblocks as u64;
        if end > u64::from(self.cache.num_blocks().0) {
            return Err(Error::BadArgument);
        }
        Ok(())
    }
}

/// Fold whole blocks of `offset` into the block number and work out how many
/// blocks the transfer touches.
fn normalize(block_num: BlockIdx, offset: u32, len: usize) -> (BlockIdx, usize, usize) {
    let block_num = BlockIdx(block_num.0 + offset / Block::LEN_U32);
    let offset = (offset % Block::LEN_U32) as usize;
    let nblocks = (offset + len + Block::LEN - 1) / Block::LEN;
    (block_num, offset, nblocks)
}
