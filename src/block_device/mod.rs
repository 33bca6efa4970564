//! Block Device support
//!
//! Generic code for handling block devices. The [`BlockDevice`] trait is the
//! narrow interface between the block cache and whatever medium actually
//! stores the blocks - an SD card behind [`crate::SdMmcSpi`], or a chunk of
//! memory in tests.

#[cfg(feature = "refcell-blockdevice")]
mod refcell;

mod block;
pub use block::*;

/// Represents a block device - a device which can read and write blocks (or
/// sectors). Only supports devices which are <= 2 TiB in size.
///
/// The multi-block operations take a slice of buffer references rather than
/// one contiguous buffer, so a caller can move a run of consecutive device
/// blocks to or from buffers that are scattered in memory (the block cache
/// fetches read-ahead runs straight into whichever pool slots it is
/// recycling).
pub trait BlockDevice {
    /// The errors that the `BlockDevice` can return. Must be debug formattable.
    type Error: core::fmt::Debug;

    /// Read a run of consecutive blocks, starting at the given block index.
    /// Each buffer receives one block, in order.
    fn read(
        &mut self,
        blocks: &mut [&mut Block],
        start_block_idx: BlockIdx,
    ) -> Result<(), Self::Error>;

    /// Write a run of consecutive blocks, starting at the given block index.
    fn write(&mut self, blocks: &[&Block], start_block_idx: BlockIdx) -> Result<(), Self::Error>;

    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error>;

    /// Read a single block.
    fn read_block(&mut self, block: &mut Block, block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.read(&mut [block], block_idx)
    }

    /// Write a single block.
    fn write_block(&mut self, block: &Block, block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.write(&[block], block_idx)
    }
}

impl<T> BlockDevice for &mut T
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn read(
        &mut self,
        blocks: &mut [&mut Block],
        start_block_idx: BlockIdx,
    ) -> Result<(), Self::Error> {
        (*self).read(blocks, start_block_idx)
    }

    fn write(&mut self, blocks: &[&Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        (*self).write(blocks, start_block_idx)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        (*self).num_blocks()
    }
}

/// A block device backed by a slice of memory. Mostly useful for testing
/// anything that is generic over [`BlockDevice`] without an SD card attached.
#[derive(Debug)]
pub struct MemoryBlockDevice<'a> {
    memory: &'a mut [u8],
}

impl<'a> MemoryBlockDevice<'a> {
    pub fn new(memory: &'a mut [u8]) -> Self {
        Self { memory }
    }

    fn block_start(block_idx: usize) -> usize {
        block_idx * Block::LEN
    }

    fn block_end(block_idx: usize) -> usize {
        (block_idx * Block::LEN) + Block::LEN
    }
}

impl<'a> BlockDevice for MemoryBlockDevice<'a> {
    type Error = ();

    fn read(
        &mut self,
        blocks: &mut [&mut Block],
        start_block_idx: BlockIdx,
    ) -> Result<(), Self::Error> {
        for (idx, block) in blocks.iter_mut().enumerate() {
            let blk_start = Self::block_start(start_block_idx.0 as usize + idx);
            let blk_end = Self::block_end(start_block_idx.0 as usize + idx);
            block
                .contents
                .copy_from_slice(&self.memory[blk_start..blk_end])
        }

        Ok(())
    }

    fn write(&mut self, blocks: &[&Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        for (idx, block) in blocks.iter().enumerate() {
            let blk_start = Self::block_start(start_block_idx.0 as usize + idx);
            let blk_end = Self::block_end(start_block_idx.0 as usize + idx);
            self.memory[blk_start..blk_end].copy_from_slice(&block.contents);
        }
        Ok(())
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount((self.memory.len() / Block::LEN) as u32))
    }
}
