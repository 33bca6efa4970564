//! # sdcard-cache
//!
//! > An SD Card driver with a write-back block cache, written in Embedded Rust
//!
//! This crate lets you mount an SD/SDHC/SDXC card, attached over SPI, as a
//! block device with arbitrary-offset, arbitrary-length reads and writes.
//! It is aimed at log-structured filesystems (littlefs in particular), which
//! issue a stream of small, misaligned, non-contiguous block operations and
//! crawl on SD cards without a cache in front of them. It is written in
//! pure-Rust, is `#![no_std]` and uses `alloc` only to size the cache pool
//! at startup.
//!
//! The stack has three layers:
//!
//! * [`SdMmcSpi`] speaks the SD SPI protocol over an `embedded-hal` SPI bus
//!   and chip select pin, and exposes the card as a [`BlockDevice`].
//! * [`BlockCache`] keeps recently used 512-byte blocks in memory, reads
//!   ahead on misses, and coalesces dirty neighbours into multi-block writes
//!   when it syncs.
//! * [`SdCard`] maps byte-granular reads and writes onto whole-block cache
//!   operations, and dispatches the `ioctl`-style sync/geometry/erase
//!   operations a filesystem expects.
//!
//! ## Using the crate
//!
//! Configure the SPI bus at 100-400 kHz, acquire the card, then raise the
//! bus clock to the data rate you want:
//!
//! ```rust,ignore
//! use sdcard_cache::{BlockIdx, CacheConfig, EvictionPolicy, SdCard, SdMmcSpi};
//!
//! // spi, cs and delay come from your HAL
//! let card = match SdMmcSpi::new(spi, cs, delay).acquire() {
//!     Ok(card) => card,
//!     Err((e, _spi)) => panic!("couldn't acquire SD card: {:?}", e),
//! };
//! // reconfigure the SPI bus to full speed here
//!
//! let mut device = SdCard::new(
//!     card,
//!     CacheConfig {
//!         max_blocks: 8,
//!         policy: EvictionPolicy::LruClean,
//!         read_ahead: 4,
//!     },
//! )
//! .unwrap();
//!
//! let mut buf = [0u8; 64];
//! device.read(BlockIdx(0), &mut buf, 100).unwrap();
//! device.write(BlockIdx(0), &buf, 612).unwrap();
//! device.ioctl(3, 0).unwrap(); // sync; data is on the card now
//! ```
//!
//! Durability rule: a write is on stable storage only once `sync` (or
//! `ioctl(3, _)`) has returned. Call it before power-down; nothing is
//! flushed implicitly on drop.
//!
//! ## Features
//!
//! * `defmt-log`: By turning off the default features and enabling the
//!   `defmt-log` feature you can configure this crate to log messages over
//!   defmt instead.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is
//! enabled.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[cfg(test)]
mod test;

#[macro_use]
mod structure;

pub mod block_device;
pub mod cache;
pub mod sdcard;
pub mod sdmmc;

pub use crate::block_device::{Block, BlockCount, BlockDevice, BlockIdx, MemoryBlockDevice};
pub use crate::cache::{BlockCache, CacheConfig, EvictionPolicy};
pub use crate::cache::Error as CacheError;
pub use crate::sdcard::SdCard;
pub use crate::sdmmc::Error as SdMmcError;
pub use crate::sdmmc::SdMmcSpi;
