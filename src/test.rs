//! Unit tests for the cache and the byte-granular facade, run against
//! memory-backed block devices.

use crate::{
    Block, BlockCache, BlockIdx, CacheConfig, CacheError, EvictionPolicy, MemoryBlockDevice,
    SdCard,
};

/// Device memory where every byte is a function of its absolute position.
/// 251 is prime, so the pattern never lines up with the block size and
/// off-by-one-block bugs show up as data mismatches.
fn pattern_memory(num_blocks: usize) -> Vec<u8> {
    (0..num_blocks * Block::LEN).map(|i| (i % 251) as u8).collect()
}

fn lfs_config() -> CacheConfig {
    CacheConfig {
        max_blocks: 8,
        policy: EvictionPolicy::LruClean,
        read_ahead: 4,
    }
}

#[test]
fn single_aligned_write_read() {
    let mut mem = pattern_memory(1024);
    let mut card = SdCard::new(MemoryBlockDevice::new(&mut mem), lfs_config()).unwrap();

    let data: Vec<u8> = (0..Block::LEN).map(|i| i as u8).collect();
    card.write(BlockIdx(1000), &data, 0).unwrap();

    let mut out = vec![0u8; Block::LEN];
    card.read(BlockIdx(1000), &mut out, 0).unwrap();
    for (i, b) in out.iter().enumerate() {
        assert_eq!(*b as usize, i % 256);
    }
}

#[test]
fn sub_block_partial_write() {
    let mut mem = pattern_memory(1024);
    let mut card = SdCard::new(MemoryBlockDevice::new(&mut mem), lfs_config()).unwrap();

    card.write(BlockIdx(500), &[0xAA; 128], 384).unwrap();

    let mut out = [0u8; 128];
    card.read(BlockIdx(500), &mut out, 384).unwrap();
    assert_eq!(out, [0xAA; 128]);

    // the rest of the block survived the read-modify-write
    let mut whole = vec![0u8; Block::LEN];
    card.read(BlockIdx(500), &mut whole, 0).unwrap();
    for (i, b) in whole[..384].iter().enumerate() {
        assert_eq!(*b as usize, (500 * Block::LEN + i) % 251);
    }
    assert!(whole[384..].iter().all(|&b| b == 0xAA));
}

#[test]
fn multi_block_spanning_with_partials() {
    let mut mem = pattern_memory(2048);
    let mut card = SdCard::new(MemoryBlockDevice::new(&mut mem), lfs_config()).unwrap();

    // 1536 bytes starting 100 bytes into block 2000: partial head, one whole
    // middle block, partial tail
    let data: Vec<u8> = (0..1536).map(|i| (i % 256) as u8).collect();
    card.write(BlockIdx(2000), &data, 100).unwrap();

    let mut out = vec![0u8; 1536];
    card.read(BlockIdx(2000), &mut out, 100).unwrap();
    assert_eq!(out, data);

    // bytes on either side of the written range are untouched
    let mut head = vec![0u8; 100];
    card.read(BlockIdx(2000), &mut head, 0).unwrap();
    for (i, b) in head.iter().enumerate() {
        assert_eq!(*b as usize, (2000 * Block::LEN + i) % 251);
    }
    let mut tail = vec![0u8; Block::LEN - ((100 + 1536) % Block::LEN)];
    card.read(BlockIdx(2000), &mut tail, (100 + 1536) as u32).unwrap();
    for (i, b) in tail.iter().enumerate() {
        assert_eq!(*b as usize, (2000 * Block::LEN + 100 + 1536 + i) % 251);
    }
}

#[test]
fn offset_larger_than_a_block_folds_into_the_block_number() {
    let mut mem = pattern_memory(64);
    let mut card = SdCard::new(MemoryBlockDevice::new(&mut mem), lfs_config()).unwrap();

    let data = [0x42u8; 16];
    card.write(BlockIdx(2), &data, 3 * Block::LEN_U32 + 9).unwrap();

    let mut out = [0u8; 16];
    card.read(BlockIdx(5), &mut out, 9).unwrap();
    assert_eq!(out, data);
}

#[test]
fn head_only_and_tail_only_partials() {
    let mut mem = pattern_memory(64);
    let mut card = SdCard::new(MemoryBlockDevice::new(&mut mem), lfs_config()).unwrap();

    // offset 0, ragged end: whole head block plus a partial tail
    let data: Vec<u8> = (0..700).map(|i| (i % 253) as u8).collect();
    card.write(BlockIdx(10), &data, 0).unwrap();
    let mut out = vec![0u8; 700];
    card.read(BlockIdx(10), &mut out, 0).unwrap();
    assert_eq!(out, data);

    // ragged start, aligned end
    let data: Vec<u8> = (0..724).map(|i| (i % 241) as u8).collect();
    card.write(BlockIdx(20), &data, 300).unwrap();
    let mut out = vec![0u8; 724];
    card.read(BlockIdx(20), &mut out, 300).unwrap();
    assert_eq!(out, data);
}

#[test]
fn empty_buffers_are_noops() {
    let mut mem = pattern_memory(16);
    let mut card = SdCard::new(MemoryBlockDevice::new(&mut mem), lfs_config()).unwrap();

    card.read(BlockIdx(1), &mut [], 0).unwrap();
    card.write(BlockIdx(1), &[], 0).unwrap();
    assert!(card.cache().is_empty());
}

#[test]
fn sync_writes_through_to_the_device() {
    let mut mem = pattern_memory(16);
    {
        let mut card = SdCard::new(MemoryBlockDevice::new(&mut mem), lfs_config()).unwrap();
        card.write(BlockIdx(3), &[0x5A; Block::LEN], 0).unwrap();
        card.sync().unwrap();
    }
    assert!(mem[3 * Block::LEN..4 * Block::LEN].iter().all(|&b| b == 0x5A));
}

#[test]
fn ranges_past_the_end_of_the_device_are_rejected() {
    let mut mem = pattern_memory(16);
    let mut card = SdCard::new(MemoryBlockDevice::new(&mut mem), lfs_config()).unwrap();

    let mut buf = [0u8; 1024];
    assert_eq!(
        card.read(BlockIdx(15), &mut buf, 0),
        Err(CacheError::BadArgument)
    );
    assert_eq!(
        card.write(BlockIdx(15), &buf, 0),
        Err(CacheError::BadArgument)
    );
    assert_eq!(card.ioctl(6, 16), Err(CacheError::BadArgument));
    // nothing was cached along the way
    assert!(card.cache().is_empty());
}

#[test]
fn cache_buffers_must_be_whole_blocks() {
    let mut mem = pattern_memory(16);
    let mut cache =
        BlockCache::new(MemoryBlockDevice::new(&mut mem), CacheConfig::default()).unwrap();

    let mut small = [0u8; 100];
    assert_eq!(
        cache.get(BlockIdx(0), &mut small),
        Err(CacheError::BadArgument)
    );
    assert_eq!(cache.put(BlockIdx(0), &small), Err(CacheError::BadArgument));
}

#[test]
fn read_ahead_must_fit_the_cache() {
    let bad = [
        CacheConfig {
            max_blocks: 4,
            policy: EvictionPolicy::Lru,
            read_ahead: 0,
        },
        CacheConfig {
            max_blocks: 4,
            policy: EvictionPolicy::Lru,
            read_ahead: 5,
        },
        CacheConfig {
            max_blocks: 0,
            policy: EvictionPolicy::Lru,
            read_ahead: 2,
        },
    ];
    for config in bad.iter() {
        let mut mem = pattern_memory(4);
        assert!(matches!(
            BlockCache::new(MemoryBlockDevice::new(&mut mem), *config),
            Err(CacheError::BadConfig)
        ));
    }

    // a cache of 0 or 1 blocks accepts (only) a read-ahead of 1
    for &max_blocks in &[0usize, 1] {
        let mut mem = pattern_memory(4);
        let config = CacheConfig {
            max_blocks,
            policy: EvictionPolicy::Lru,
            read_ahead: 1,
        };
        assert!(BlockCache::new(MemoryBlockDevice::new(&mut mem), config).is_ok());
    }
}

#[test]
fn disabled_cache_passes_straight_through() {
    let mut mem = pattern_memory(16);
    {
        let config = CacheConfig {
            max_blocks: 0,
            policy: EvictionPolicy::Lru,
            read_ahead: 1,
        };
        let mut card = SdCard::new(MemoryBlockDevice::new(&mut mem), config).unwrap();

        card.write(BlockIdx(2), &[0x77; 300], 100).unwrap();
        let mut out = [0u8; 300];
        card.read(BlockIdx(2), &mut out, 100).unwrap();
        assert_eq!(&out[..], &[0x77; 300][..]);

        assert!(card.cache().is_empty());
        card.sync().unwrap();
    }
    // with no cache the write already reached the device before any sync
    assert!(mem[2 * Block::LEN + 100..2 * Block::LEN + 400]
        .iter()
        .all(|&b| b == 0x77));
}

#[test]
fn erase_rules() {
    let mut mem = pattern_memory(32);
    let mut card = SdCard::new(MemoryBlockDevice::new(&mut mem), lfs_config()).unwrap();

    // a dirty block refuses to be erased
    card.write(BlockIdx(3), &[0x11; Block::LEN], 0).unwrap();
    assert_eq!(card.ioctl(6, 3), Err(CacheError::EraseDirty));

    // after a sync it can be erased, and reads back as all 0xFF
    card.sync().unwrap();
    assert_eq!(card.ioctl(6, 3), Ok(0));
    assert_eq!(card.cache().is_dirty(BlockIdx(3)), Some(true));
    let mut out = [0u8; Block::LEN];
    card.read(BlockIdx(3), &mut out, 0).unwrap();
    assert!(out.iter().all(|&b| b == 0xFF));

    // erasing a block that is not resident materializes it
    assert_eq!(card.ioctl(6, 9), Ok(0));
    assert_eq!(card.cache().is_dirty(BlockIdx(9)), Some(true));
    card.read(BlockIdx(9), &mut out, 0).unwrap();
    assert!(out.iter().all(|&b| b == 0xFF));

    // a second erase hits the dirty-block rule, but the block still reads
    // as erased either way
    card.sync().unwrap();
    assert_eq!(card.ioctl(6, 9), Ok(0));
    assert_eq!(card.ioctl(6, 9), Err(CacheError::EraseDirty));
    card.read(BlockIdx(9), &mut out, 0).unwrap();
    assert!(out.iter().all(|&b| b == 0xFF));
}

#[test]
fn ioctl_geometry() {
    let mut mem = pattern_memory(24);
    let mut card = SdCard::new(MemoryBlockDevice::new(&mut mem), lfs_config()).unwrap();

    assert_eq!(card.ioctl(3, 0), Ok(0));
    assert_eq!(card.ioctl(4, 0), Ok(24));
    assert_eq!(card.ioctl(5, 0), Ok(512));
    // unknown ops are accepted and report 0
    assert_eq!(card.ioctl(42, 7), Ok(0));
}

#[test]
fn reset_discards_unsynced_state() {
    let mut mem = pattern_memory(16);
    let mut card = SdCard::new(MemoryBlockDevice::new(&mut mem), lfs_config()).unwrap();

    card.write(BlockIdx(4), &[0xEE; Block::LEN], 0).unwrap();
    card.cache_mut().reset(CacheConfig::default()).unwrap();
    assert!(card.cache().is_empty());

    // the write was never synced, so the device still has the old bytes
    let mut out = [0u8; Block::LEN];
    card.read(BlockIdx(4), &mut out, 0).unwrap();
    for (i, b) in out.iter().enumerate() {
        assert_eq!(*b as usize, (4 * Block::LEN + i) % 251);
    }

    // a bad new configuration leaves the cache untouched
    let bad = CacheConfig {
        max_blocks: 2,
        policy: EvictionPolicy::Lru,
        read_ahead: 3,
    };
    assert_eq!(card.cache_mut().reset(bad), Err(CacheError::BadConfig));
    assert_eq!(card.cache().len(), 1);
}
