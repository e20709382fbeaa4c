//! Constants and register layouts from the SD Specifications, as they appear
//! on the wire in SPI mode.

use byteorder::{BigEndian, ByteOrder};

//==============================================================================

// SD Card Commands

/// GO_IDLE_STATE - init card in spi mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_IF_COND - verify SD Memory Card interface operating condition.*/
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 0x09;
/// STOP_TRANSMISSION - end multiple block read sequence
pub const CMD12: u8 = 0x0C;
/// SET_BLOCKLEN - select a 512 byte block length on standard-capacity cards
pub const CMD16: u8 = 0x10;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card
pub const CMD18: u8 = 0x12;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 0x18;
/// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION
pub const CMD25: u8 = 0x19;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 0x3A;
/// SD_SEND_OP_COMD - Sends host capacity support information and activates
/// the card's initialization process
pub const ACMD41: u8 = 0x29;

//==============================================================================

// Command arguments and framing

/// CMD8 argument: 2.7-3.6V supply, check pattern 0xAA
pub const CMD8_VHS_PATTERN: u32 = 0x0000_01AA;
/// ACMD41 argument bit announcing host support for high-capacity cards
pub const ACMD41_HCS: u32 = 0x4000_0000;

/// The only two commands whose CRC the card verifies in SPI mode get real
/// values; everything else is framed with the dummy CRC.
pub const CMD0_CRC: u8 = 0x95;
/// Valid CRC for CMD8 with the standard voltage-check argument
pub const CMD8_CRC: u8 = 0x87;
/// Filler CRC for every other command while CRC mode is off
pub const DUMMY_CRC: u8 = 0xFF;

/// How many bytes to poll for an R1 after the command frame
pub const R1_POLL_LIMIT: usize = 10;

//==============================================================================

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;

/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;

/// status bit for illegal command
pub const R1_ILLEGAL_COMMAND: u8 = 0x04;

/// start data token for read or write single block*/
pub const DATA_START_BLOCK: u8 = 0xFE;

/// stop token for write multiple blocks*/
pub const STOP_TRAN_TOKEN: u8 = 0xFD;

/// start data token for write multiple blocks*/
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;

/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;

/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// write data rejected, CRC fault
pub const DATA_RES_CRC_ERROR: u8 = 0x0B;

/// write data rejected, programming fault
pub const DATA_RES_WRITE_ERROR: u8 = 0x0D;

/// What the card said about a block we just sent it.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataResponse {
    /// Block accepted, card is now busy programming it
    Accepted,
    /// Block rejected with a CRC fault
    CrcError,
    /// Block rejected with a write fault. Unrecognised response patterns
    /// are classified the same way.
    WriteError,
}

impl DataResponse {
    /// Classify the data response byte that follows a write block.
    pub fn from_byte(byte: u8) -> DataResponse {
        match byte & DATA_RES_MASK {
            DATA_RES_ACCEPTED => DataResponse::Accepted,
            DATA_RES_CRC_ERROR => DataResponse::CrcError,
            _ => DataResponse::WriteError,
        }
    }
}

//==============================================================================

/// Operation Conditions Register, as returned by CMD58.
#[derive(Default)]
pub struct Ocr {
    /// The 4 response bytes trailing the R1, most significant first
    pub data: [u8; 4],
}

impl Ocr {
    define_field!(power_up_complete, bool, 0, 7);
    define_field!(card_capacity_status, bool, 0, 6);
    define_field!(raw, u32_be, 0);

    /// True for an SDHC/SDXC card, which is addressed in 512 byte sectors
    /// rather than bytes. Only meaningful once `power_up_complete` is set.
    pub fn is_high_capacity(&self) -> bool {
        self.card_capacity_status()
    }
}

//==============================================================================

/// Card Specific Data, version 1
#[derive(Default)]
pub struct CsdV1 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data, version 2
#[derive(Default)]
pub struct CsdV2 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data
pub enum Csd {
    /// A version 1 CSD
    V1(CsdV1),
    /// A version 2 CSD
    V2(CsdV2),
    /// A CSD structure tag this driver does not understand
    Unknown,
}

impl Csd {
    /// Parse a raw 16-byte CSD block, dispatching on the structure tag in
    /// bits \[127:126\].
    pub fn from_bytes(data: [u8; 16]) -> Csd {
        match data[0] >> 6 {
            0 => Csd::V1(CsdV1 { data }),
            1 => Csd::V2(CsdV2 { data }),
            _ => Csd::Unknown,
        }
    }

    /// Returns the card capacity in 512-byte blocks, or zero for an unknown
    /// CSD structure.
    pub fn card_capacity_blocks(&self) -> u32 {
        match self {
            Csd::V1(csd) => csd.card_capacity_blocks(),
            Csd::V2(csd) => csd.card_capacity_blocks(),
            Csd::Unknown => 0,
        }
    }
}

impl CsdV1 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV1 {
        CsdV1::default()
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);

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

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * 512 * 1024
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        (self.device_size() + 1) * 1024
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
