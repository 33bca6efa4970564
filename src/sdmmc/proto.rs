//! Constants and register layouts from the SD Specifications.
//!
//! Only the subset the SPI-mode driver actually needs: the command indices
//! it issues, the fixed CRC bytes SPI mode checks, the data-phase tokens,
//! the R1 response flags, and the two CSD layouts used to size the card.

use bitflags::bitflags;

/// How many response polls (or 1 ms data-token polls) we attempt before
/// declaring a command dead.
pub const CMD_TIMEOUT: u32 = 100;

// ============================================================================
//
// SD Card Commands
//
// ============================================================================

/// GO_IDLE_STATE - init card in SPI mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_IF_COND - verify SD Memory Card interface operating condition
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 0x09;
/// STOP_TRANSMISSION - end multiple block read sequence
pub const CMD12: u8 = 0x0C;
/// SET_BLOCKLEN - set the block length for all following block commands
pub const CMD16: u8 = 0x10;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// READ_MULTIPLE_BLOCK - read multiple data blocks from the card
pub const CMD18: u8 = 0x12;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 0x18;
/// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION
pub const CMD25: u8 = 0x19;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 0x3A;
/// SD_SEND_OP_COND - sends host capacity support information and activates
/// the card's initialization process
pub const ACMD41: u8 = 0x29;

// ============================================================================
//
// Fixed CRC bytes
//
// In SPI mode the card only checks the CRC on CMD0 and CMD8, so those two
// carry their well-known constant CRCs and everything else is sent with a
// don't-care byte.
//
// ============================================================================

/// Valid CRC for CMD0 with argument 0
pub const CMD0_CRC: u8 = 0x95;
/// Valid CRC for CMD8 with argument 0x1AA
pub const CMD8_CRC: u8 = 0x87;
/// Don't-care CRC for every command the card no longer checks
pub const CRC_IGNORED: u8 = 0x00;
/// CRC byte sent with CMD12 (also ignored, kept as the all-ones idle value)
pub const CMD12_CRC: u8 = 0xFF;

// ============================================================================
//
// Tokens and response bytes
//
// ============================================================================

/// Start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;
/// Stop token for write multiple blocks
pub const STOP_TRAN_TOKEN: u8 = 0xFD;
/// Start data token for write multiple blocks
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;
/// Mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;
/// Write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;

bitflags! {
    /// Fields of the R1 response byte. A response with the top bit clear and
    /// every flag clear means the card is ready.
    pub struct R1Status: u8 {
        /// Card is in the idle state, running the initialization process
        const IDLE_STATE = 1 << 0;
        /// An erase sequence was cleared before executing
        const ERASE_RESET = 1 << 1;
        /// An illegal command code was detected
        const ILLEGAL_COMMAND = 1 << 2;
        /// The CRC check of the last command failed
        const COM_CRC_ERROR = 1 << 3;
        /// An error in the sequence of erase commands occurred
        const ERASE_SEQUENCE_ERROR = 1 << 4;
        /// A misaligned address did not match the block length
        const ADDRESS_ERROR = 1 << 5;
        /// The command's argument was outside the allowed range
        const PARAMETER_ERROR = 1 << 6;
    }
}

/// R1 value for a card in the ready state
pub const R1_READY_STATE: u8 = 0x00;

/// OCR bit 30, the Card Capacity Status. Set for SDHC/SDXC (block
/// addressed), clear for SDSC (byte addressed). This is bit 6 of the first
/// OCR byte on the wire.
pub const OCR_CCS: u8 = 0x40;

// ============================================================================
//
// Card Specific Data
//
// ============================================================================

/// Card Specific Data, version 1 (standard capacity, <= 2 GiB)
#[derive(Default)]
pub struct CsdV1 {
    /// The 16 bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data, version 2 (high or extended capacity)
#[derive(Default)]
pub struct CsdV2 {
    /// The 16 bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data
pub enum Csd {
    /// A version 1 CSD
    V1(CsdV1),
    /// A version 2 CSD
    V2(CsdV2),
}

impl CsdV1 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV1 {
        CsdV1::default()
    }

    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(max_data_transfer_rate, u8, 3, 0, 8);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(crc, u8, 15, 0, 8);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() + 2;
        (u64::from(self.device_size()) + 1) << multiplier
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() - 7;
        (self.device_size() + 1) << multiplier
    }
}

impl CsdV2 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV2 {
        CsdV2::default()
    }

    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(max_data_transfer_rate, u8, 3, 0, 8);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(crc, u8, 15, 0, 8);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * 512 * 1024
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        (self.device_size() + 1) * 1024
    }
}

impl Csd {
    /// Interpret a raw 16-byte CSD read via CMD9. Returns `None` when the
    /// CSD structure version is one we don't know about.
    pub fn parse(data: [u8; 16]) -> Option<Csd> {
        match data[0] >> 6 {
            0 => Some(Csd::V1(CsdV1 { data })),
            1 => Some(Csd::V2(CsdV2 { data })),
            _ => None,
        }
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        match self {
            Csd::V1(csd) => csd.card_capacity_blocks(),
            Csd::V2(csd) => csd.card_capacity_blocks(),
        }
    }

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        match self {
            Csd::V1(csd) => csd.card_capacity_bytes(),
            Csd::V2(csd) => csd.card_capacity_bytes(),
        }
    }

    /// Can this card erase single blocks?
    pub fn erase_single_block_enabled(&self) -> bool {
        match self {
            Csd::V1(csd) => csd.erase_single_block_enabled(),
            Csd::V2(csd) => csd.erase_single_block_enabled(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_csdv1() {
        // An actual CSD read from a 1 GB card
        let example = CsdV1 {
            data: hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5"),
        };

        assert_eq!(example.csd_ver(), 0x00);
        assert_eq!(example.max_data_transfer_rate(), 0x32);
        // 512-byte read blocks
        assert_eq!(example.read_block_length(), 0x09);
        assert_eq!(example.device_size(), 3874);
        assert_eq!(example.device_size_multiplier(), 7);
        assert_eq!(example.erase_single_block_enabled(), true);
        assert_eq!(example.crc(), 0xA5);

        assert_eq!(example.card_capacity_bytes(), 1_015_808_000);
        assert_eq!(example.card_capacity_blocks(), 1_984_000);
    }

    #[test]
    fn test_csdv2() {
        // An actual CSD read from a 4 GB SDHC card
        let example = CsdV2 {
            data: hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B"),
        };

        assert_eq!(example.csd_ver(), 0x01);
        assert_eq!(example.max_data_transfer_rate(), 0x32);
        assert_eq!(example.read_block_length(), 0x09);
        assert_eq!(example.device_size(), 7529);
        assert_eq!(example.erase_single_block_enabled(), true);
        assert_eq!(example.crc(), 0x8B);

        assert_eq!(example.card_capacity_bytes(), 3_947_888_640);
        assert_eq!(example.card_capacity_blocks(), 7_710_720);
    }

    #[test]
    fn parse_picks_the_right_version() {
        let v2 = hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B");
        match Csd::parse(v2) {
            Some(Csd::V2(csd)) => assert_eq!(csd.card_capacity_blocks(), 7_710_720),
            _ => panic!("expected a v2 CSD"),
        }

        let v1 = hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5");
        match Csd::parse(v1) {
            Some(Csd::V1(csd)) => assert_eq!(csd.card_capacity_blocks(), 1_984_000),
            _ => panic!("expected a v1 CSD"),
        }

        // Top bits 0b10 and 0b11 are reserved
        let mut bad = v2;
        bad[0] = 0x80;
        assert!(Csd::parse(bad).is_none());
    }

    #[test]
    fn r1_flags() {
        let r1 = R1Status::from_bits_truncate(0x05);
        assert!(r1.contains(R1Status::IDLE_STATE));
        assert!(r1.contains(R1Status::ILLEGAL_COMMAND));
        assert!(!r1.contains(R1Status::PARAMETER_ERROR));
    }
}
