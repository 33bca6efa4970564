use embedded_hal::{
    blocking::{delay::DelayMs, spi::Transfer},
    digital::v2::OutputPin,
};

use super::{proto::*, Error};

/// A struct used to ensure that communication only occurs while CS is low.
///
/// Creating one asserts chip select; dropping it releases the card. All
/// command framing, response polling and data-phase token handling happens
/// through this struct, so nothing outside it can touch the bus with CS in
/// the wrong state.
pub struct SdBus<'spi, 'cs, 'delay, SPI, CS, DELAY>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    DELAY: DelayMs<u16>,
{
    spi: &'spi mut SPI,
    cs: &'cs mut CS,
    delay: &'delay mut DELAY,
}

impl<'spi, 'cs, 'delay, SPI, CS, DELAY> Drop for SdBus<'spi, 'cs, 'delay, SPI, CS, DELAY>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    DELAY: DelayMs<u16>,
{
    fn drop(&mut self) {
        self.cs_high().ok();
    }
}

impl<'spi, 'cs, 'delay, SPI, CS, DELAY> SdBus<'spi, 'cs, 'delay, SPI, CS, DELAY>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    DELAY: DelayMs<u16>,
{
    pub fn new(
        spi: &'spi mut SPI,
        cs: &'cs mut CS,
        delay: &'delay mut DELAY,
    ) -> Result<Self, Error> {
        let mut me = Self { spi, cs, delay };
        me.cs_low()?;
        Ok(me)
    }

    fn cs_high(&mut self) -> Result<(), Error> {
        self.cs.set_high().map_err(|_| Error::Gpio)
    }

    fn cs_low(&mut self) -> Result<(), Error> {
        self.cs.set_low().map_err(|_| Error::Gpio)
    }

    /// Send one byte and receive one byte.
    fn transfer(&mut self, out: u8) -> Result<u8, Error> {
        self.spi
            .transfer(&mut [out])
            .map(|b| b[0])
            .map_err(|_e| Error::Transport)
    }

    /// Receive a byte from the SD card by clocking out an 0xFF byte.
    pub fn receive(&mut self) -> Result<u8, Error> {
        self.transfer(0xFF)
    }

    /// Send a byte to the SD card.
    pub fn send(&mut self, out: u8) -> Result<(), Error> {
        let _ = self.transfer(out)?;
        Ok(())
    }

    /// Clock out and throw away `count` bytes. Used for the trailing bytes
    /// of R3/R7 responses we don't care about.
    pub fn discard(&mut self, count: usize) -> Result<(), Error> {
        for _ in 0..count {
            self.receive()?;
        }
        Ok(())
    }

    /// Sleep without giving up the bus.
    pub fn delay_ms(&mut self, ms: u16) {
        self.delay.delay_ms(ms);
    }

    /// Perform a command: send the 6-byte frame (`0x40 | cmd`, big-endian
    /// argument, the given CRC byte), then poll for a response byte with the
    /// top bit clear.
    ///
    /// SPI mode only checks the CRC on CMD0 and CMD8, so most callers pass a
    /// don't-care byte. CMD12 emits one stuffing byte before a valid
    /// response can appear, so that byte is skipped here.
    pub fn card_command(&mut self, command: u8, arg: u32, crc: u8) -> Result<u8, Error> {
        let buf = [
            0x40 | command,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            crc,
        ];

        for b in buf.iter() {
            self.send(*b)?;
        }

        // skip stuff byte for stop read
        if command == CMD12 {
            let _stuff = self.receive()?;
        }

        for _ in 0..CMD_TIMEOUT {
            let result = self.receive()?;
            if (result & 0x80) == 0 {
                return Ok(result);
            }
        }

        Err(Error::Timeout)
    }

    /// Perform an application-specific command.
    pub fn card_acmd(&mut self, command: u8, arg: u32) -> Result<u8, Error> {
        self.card_command(CMD55, 0, CRC_IGNORED)?;
        self.card_command(command, arg, CRC_IGNORED)
    }

    /// Read one data block from the card: wait for the 0xFE start token
    /// (polling once per millisecond), fill `buffer`, then clock out and
    /// discard the two CRC bytes.
    pub fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        let mut token = self.receive()?;
        let mut attempts = 0;
        while token != DATA_START_BLOCK {
            attempts += 1;
            if attempts >= CMD_TIMEOUT {
                return Err(Error::DataTimeout);
            }
            self.delay_ms(1);
            token = self.receive()?;
        }

        for b in buffer.iter_mut() {
            *b = self.receive()?;
        }

        // the data CRC is clocked out but not checked
        self.discard(2)?;

        Ok(())
    }

    /// Write one data block to the card: start token, payload, two dummy
    /// CRC bytes, then check the data-response byte and wait for the card to
    /// leave the busy state.
    pub fn write_data(&mut self, token: u8, buffer: &[u8]) -> Result<(), Error> {
        self.send(token)?;
        for &b in buffer.iter() {
            self.send(b)?;
        }
        self.send(0xFF)?;
        self.send(0xFF)?;

        let status = self.receive()?;
        if (status & DATA_RES_MASK) != DATA_RES_ACCEPTED {
            return Err(Error::Io);
        }

        // the card holds the line at 0x00 while programming
        while self.receive()? == 0x00 {}

        Ok(())
    }

    /// Send a single control token (STOP_TRAN for CMD25), then wait for the
    /// card to leave the busy state.
    pub fn write_token(&mut self, token: u8) -> Result<(), Error> {
        self.send(token)?;
        self.send(0xFF)?;

        while self.receive()? == 0x00 {}

        Ok(())
    }
}
