//! SD/MMC protocol over SPI.
//!
//! Implements the card-facing half of the driver on some generic SPI
//! interface: the init handshake, and single/multi block reads and writes
//! expressed through the [`BlockDevice`] trait so the block cache never has
//! to know about chip select or data tokens.
//!
//! This is currently optimised for readability and debugability, not
//! performance.

mod bus;
use bus::SdBus;

pub mod proto;
use proto::*;

use crate::{Block, BlockCount, BlockDevice, BlockIdx};

use embedded_hal::digital::v2::OutputPin;
use embedded_hal::{blocking::delay::DelayMs, blocking::spi::Transfer};
#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

/// Represents an SD Card interface built from an SPI peripheral and a Chip
/// Select pin.
///
/// We need Chip Select to be separate so we can clock out some bytes without
/// Chip Select asserted (which puts the card into SPI mode).
///
/// The card starts out `NotInit`; [`SdMmcSpi::acquire`] runs the SPI-mode
/// init handshake and returns an `Initialized` interface that implements
/// [`BlockDevice`]. The SPI bus clock is the caller's: run it at
/// 100-400 kHz for `acquire`, then reconfigure it to the full data rate.
pub struct SdMmcSpi<SPI, CS, DELAY, State>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    DELAY: DelayMs<u16>,
{
    card_type: CardType,
    sectors: BlockCount,
    spi: SPI,
    cs: CS,
    delay: DELAY,
    _state: State,
}

/// The possible errors `SdMmcSpi` can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// We got an error from the SPI peripheral
    Transport,
    /// Couldn't set a GPIO pin
    Gpio,
    /// The card never answered CMD0; probably no card in the slot
    NoCard,
    /// CMD8 gave a response that maps to no card version we know
    VersionUnknown,
    /// We gave up polling for a command response
    Timeout,
    /// We gave up polling for a data start token
    DataTimeout,
    /// The card's CSD register uses a format we don't support
    CardFormat,
    /// The card refused to set a 512-byte block length
    SetBlockLen,
    /// A block read or write was rejected or failed mid-transfer
    Io,
}

/// The state of an `SdMmcSpi` if it is not initialized
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct NotInit;

/// The state of an `SdMmcSpi` if it is initialized
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct Initialized;

/// The different types of card we support.
///
/// SD1 and SD2 cards are byte addressed on the wire; SDHC (and SDXC) cards
/// are block addressed.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardType {
    SD1,
    SD2,
    SDHC,
}

impl<SPI, CS, DELAY, State> SdMmcSpi<SPI, CS, DELAY, State>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    DELAY: DelayMs<u16>,
{
    fn discard_byte(&mut self) -> Result<u8, Error> {
        self.spi
            .transfer(&mut [0xFF])
            .map(|b| b[0])
            .map_err(|_e| Error::Transport)
    }
}

impl<SPI, CS, DELAY> SdMmcSpi<SPI, CS, DELAY, NotInit>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    DELAY: DelayMs<u16>,
{
    /// Create a new SD/MMC controller using a raw SPI interface.
    pub fn new(spi: SPI, cs: CS, delay: DELAY) -> Self {
        SdMmcSpi {
            card_type: CardType::SD1,
            sectors: BlockCount(0),
            spi,
            cs,
            delay,
            _state: NotInit {},
        }
    }

    /// Initializes the card into a known state.
    ///
    /// On failure the error comes back together with the un-acquired
    /// interface, so the caller can try again.
    pub fn acquire(mut self) -> Result<SdMmcSpi<SPI, CS, DELAY, Initialized>, (Error, Self)> {
        debug!("acquiring card");
        let f = |s: &mut Self| -> Result<(CardType, BlockCount), Error> {
            trace!("Reset card..");

            // Supply a minimum of 74 clock cycles without CS asserted.
            s.cs.set_high().map_err(|_| Error::Gpio)?;
            for _ in 0..10 {
                s.discard_byte()?;
            }

            let mut bus = SdBus::new(&mut s.spi, &mut s.cs, &mut s.delay)?;

            // CMD0: enter SPI mode; should answer with idle state. Allow 5
            // attempts.
            let mut entered_idle = false;
            for _ in 0..5 {
                match bus.card_command(CMD0, 0, CMD0_CRC) {
                    Ok(r) if r == R1Status::IDLE_STATE.bits() => {
                        entered_idle = true;
                        break;
                    }
                    Ok(r) => {
                        warn!("CMD0 response {:x}, trying again..", r);
                    }
                    Err(Error::Timeout) => {
                        warn!("CMD0 timed out, trying again..");
                    }
                    Err(e) => return Err(e),
                }
            }
            if !entered_idle {
                return Err(Error::NoCard);
            }

            // CMD8: determine card version
            let card_type = match bus.card_command(CMD8, 0x1AA, CMD8_CRC) {
                Ok(r) => {
                    // R7 trailing bytes echo the voltage/check pattern; a v1
                    // card that rejected the command still gets clocked past
                    // them
                    bus.discard(4)?;
                    if r == R1Status::IDLE_STATE.bits() {
                        Self::init_card_v2(&mut bus)?
                    } else if r == (R1Status::IDLE_STATE | R1Status::ILLEGAL_COMMAND).bits() {
                        Self::init_card_v1(&mut bus)?
                    } else {
                        return Err(Error::VersionUnknown);
                    }
                }
                Err(Error::Timeout) => return Err(Error::VersionUnknown),
                Err(e) => return Err(e),
            };
            debug!("Card version: {:?}", card_type);

            // CMD9: read the CSD register to learn the card size
            if bus.card_command(CMD9, 0, CRC_IGNORED)? != R1_READY_STATE {
                return Err(Error::Timeout);
            }
            let mut csd = [0u8; 16];
            bus.read_data(&mut csd)?;
            let csd = Csd::parse(csd).ok_or(Error::CardFormat)?;
            let sectors = BlockCount(csd.card_capacity_blocks());
            debug!("Card has {} sectors", sectors.0);

            // CMD16: set the block length to 512 bytes
            if bus.card_command(CMD16, Block::LEN_U32, CRC_IGNORED)? != R1_READY_STATE {
                return Err(Error::SetBlockLen);
            }

            Ok((card_type, sectors))
        };
        let result = f(&mut self);
        let _ = self.discard_byte();

        match result {
            Ok((card_type, sectors)) => Ok(SdMmcSpi {
                card_type,
                sectors,
                spi: self.spi,
                cs: self.cs,
                delay: self.delay,
                _state: Initialized {},
            }),
            Err(e) => Err((e, self)),
        }
    }

    /// ACMD41 loop for a version 1 card. These are always standard-capacity
    /// and byte addressed.
    fn init_card_v1(bus: &mut SdBus<SPI, CS, DELAY>) -> Result<CardType, Error> {
        for _ in 0..CMD_TIMEOUT {
            bus.delay_ms(50);
            if bus.card_acmd(ACMD41, 0)? == R1_READY_STATE {
                return Ok(CardType::SD1);
            }
        }
        Err(Error::Timeout)
    }

    /// ACMD41 loop for a version 2 card, followed by CMD58 to read the OCR:
    /// bit 30 distinguishes block-addressed SDHC/SDXC from byte-addressed
    /// standard capacity.
    fn init_card_v2(bus: &mut SdBus<SPI, CS, DELAY>) -> Result<CardType, Error> {
        for _ in 0..CMD_TIMEOUT {
            bus.delay_ms(50);
            bus.card_command(CMD58, 0, CRC_IGNORED)?;
            bus.discard(4)?;
            if bus.card_acmd(ACMD41, 0x4000_0000)? == R1_READY_STATE {
                bus.card_command(CMD58, 0, CRC_IGNORED)?;
                let ocr = bus.receive()?;
                bus.discard(3)?;
                if ocr & OCR_CCS != 0 {
                    return Ok(CardType::SDHC);
                } else {
                    return Ok(CardType::SD2);
                }
            }
        }
        Err(Error::Timeout)
    }
}

impl<SPI, CS, DELAY> SdMmcSpi<SPI, CS, DELAY, Initialized>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    DELAY: DelayMs<u16>,
{
    /// Mark the card as unused.
    /// This should be kept infallible, because Drop is unable to fail.
    /// See https://github.com/rust-lang/rfcs/issues/814
    // If there is any need to flush data, it should be implemented here.
    pub fn deinit(self) -> SdMmcSpi<SPI, CS, DELAY, NotInit> {
        SdMmcSpi {
            card_type: self.card_type,
            sectors: self.sectors,
            spi: self.spi,
            cs: self.cs,
            delay: self.delay,
            _state: NotInit {},
        }
    }

    /// The card type determined during `acquire`.
    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    /// Run some bus operations with chip select asserted.
    ///
    /// Chip select is always released afterwards, even if an error occurred
    /// in `f`, and one trailing byte is clocked out with CS high so MOSI
    /// idles high before the next transaction starts (a workaround for some
    /// cards on shared buses).
    fn with_transaction<F, R>(&mut self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut SdBus<SPI, CS, DELAY>) -> Result<R, Error>,
    {
        let result = {
            let mut bus = SdBus::new(&mut self.spi, &mut self.cs, &mut self.delay)?;
            f(&mut bus)
        };
        let _ = self.discard_byte();
        result
    }

    /// Read the 'card specific data' block.
    pub fn read_csd(&mut self) -> Result<Csd, Error> {
        self.with_transaction(|bus| {
            if bus.card_command(CMD9, 0, CRC_IGNORED)? != R1_READY_STATE {
                return Err(Error::Timeout);
            }
            let mut data = [0u8; 16];
            bus.read_data(&mut data)?;
            Csd::parse(data).ok_or(Error::CardFormat)
        })
    }

    /// Return the usable size of this SD card in bytes.
    pub fn card_size_bytes(&mut self) -> Result<u64, Error> {
        Ok(self.read_csd()?.card_capacity_bytes())
    }

    /// Can this card erase single blocks?
    pub fn erase_single_block_enabled(&mut self) -> Result<bool, Error> {
        Ok(self.read_csd()?.erase_single_block_enabled())
    }

    /// The argument CMD17/18/24/25 want for this block: SDSC cards are byte
    /// addressed, SDHC/SDXC block addressed.
    fn block_address(&self, block_idx: BlockIdx) -> u32 {
        match self.card_type {
            CardType::SD1 | CardType::SD2 => block_idx.0 * Block::LEN_U32,
            CardType::SDHC => block_idx.0,
        }
    }
}

impl<SPI, CS, DELAY> BlockDevice for SdMmcSpi<SPI, CS, DELAY, Initialized>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    DELAY: DelayMs<u16>,
{
    type Error = Error;

    /// Read one or more blocks, starting at the given block index.
    fn read(
        &mut self,
        blocks: &mut [&mut Block],
        start_block_idx: BlockIdx,
    ) -> Result<(), Self::Error> {
        trace!("reading {} blocks at {}", blocks.len(), start_block_idx.0);
        let start_idx = self.block_address(start_block_idx);
        self.with_transaction(|bus| {
            if blocks.len() == 1 {
                // Start a single-block read
                if bus.card_command(CMD17, start_idx, CRC_IGNORED)? != R1_READY_STATE {
                    return Err(Error::Io);
                }
                bus.read_data(&mut blocks[0].contents)?;
            } else {
                // Start a multi-block read
                if bus.card_command(CMD18, start_idx, CRC_IGNORED)? != R1_READY_STATE {
                    return Err(Error::Io);
                }
                for block in blocks.iter_mut() {
                    bus.read_data(&mut block.contents)?;
                }
                // Stop the read
                if bus.card_command(CMD12, 0, CMD12_CRC)? != R1_READY_STATE {
                    return Err(Error::Io);
                }
            }
            Ok(())
        })
    }

    /// Write one or more blocks, starting at the given block index.
    fn write(&mut self, blocks: &[&Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        trace!("writing {} blocks at {}", blocks.len(), start_block_idx.0);
        let start_idx = self.block_address(start_block_idx);
        self.with_transaction(|bus| {
            if blocks.len() == 1 {
                // Start a single-block write
                if bus.card_command(CMD24, start_idx, CRC_IGNORED)? != R1_READY_STATE {
                    return Err(Error::Io);
                }
                bus.write_data(DATA_START_BLOCK, &blocks[0].contents)?;
            } else {
                // Start a multi-block write
                if bus.card_command(CMD25, start_idx, CRC_IGNORED)? != R1_READY_STATE {
                    return Err(Error::Io);
                }
                for block in blocks.iter() {
                    bus.write_data(WRITE_MULTIPLE_TOKEN, &block.contents)?;
                }
                // Stop the write
                bus.write_token(STOP_TRAN_TOKEN)?;
            }
            Ok(())
        })
    }

    /// Determine how many blocks this device can hold, as derived from the
    /// CSD during `acquire`.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        Ok(self.sectors)
    }
}
