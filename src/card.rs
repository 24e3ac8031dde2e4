//! Card registers
//!
//! Bit level decoding of the registers read during identification: the
//! operating conditions word, the R1 card status and the card specific
//! data (CSD). Fields are extracted with mask and shift from the raw
//! response words, most significant word first, exactly as the controller
//! returns them.

use bitflags::bitflags;
use sdio_host::emmc::{CardStatus, CurrentState};
use sdio_host::sd::SD;

use crate::sdmmc::Error;
use crate::time::Hertz;

/// Sector size handled by the driver
pub const SECTOR_SIZE: usize = 512;

bitflags! {
    /// Card family and capabilities found during identification
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CardType: u8 {
        const MMC = 0x01;
        const SD = 0x02;
        /// MMC system specification 4.x
        const MMC_V4 = 0x04;
        /// Answers SEND_IF_COND (physical layer 2.00)
        const SD_V2 = 0x08;
        const SD_HC = 0x10;
        const MMC_HC = 0x20;
    }
}

impl CardType {
    pub fn is_sd(&self) -> bool {
        self.contains(CardType::SD)
    }

    pub fn is_mmc(&self) -> bool {
        self.contains(CardType::MMC)
    }

    /// High capacity cards are addressed by sector rather than by byte
    pub fn is_high_capacity(&self) -> bool {
        self.intersects(CardType::SD_HC | CardType::MMC_HC)
    }
}

/// Operating conditions register
pub mod ocr {
    /// Set once the card has finished its power up routine
    pub const POWER_UP_DONE: u32 = 1 << 31;
    /// Card capacity status (SD) or sector access mode (MMC)
    pub const HIGH_CAPACITY: u32 = 1 << 30;
    pub const VDD_32_33: u32 = 1 << 20;
    /// 2.7V to 3.6V
    pub const VDD_ALL: u32 = 0x00FF_8000;
}

/// Relative card address assigned by the host to MMC cards
pub const MMC_DEFAULT_RCA: u16 = 1;

bitflags! {
    /// Card status word returned in an R1 response
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct R1: u32 {
        const OUT_OF_RANGE = 1 << 31;
        const ADDRESS_ERROR = 1 << 30;
        const BLOCK_LEN_ERROR = 1 << 29;
        const ERASE_SEQ_ERROR = 1 << 28;
        const ERASE_PARAM = 1 << 27;
        const WP_VIOLATION = 1 << 26;
        const CARD_IS_LOCKED = 1 << 25;
        const LOCK_UNLOCK_FAILED = 1 << 24;
        const COM_CRC_ERROR = 1 << 23;
        const ILLEGAL_COMMAND = 1 << 22;
        const CARD_ECC_FAILED = 1 << 21;
        const CC_ERROR = 1 << 20;
        const ERROR = 1 << 19;
        const CID_CSD_OVERWRITE = 1 << 16;
        const READY_FOR_DATA = 1 << 8;
        const APP_CMD = 1 << 5;

        /// Errors reported against a read or write command
        const RD_WR_ERRORS = Self::OUT_OF_RANGE.bits()
            | Self::ADDRESS_ERROR.bits()
            | Self::BLOCK_LEN_ERROR.bits()
            | Self::ERASE_SEQ_ERROR.bits()
            | Self::ILLEGAL_COMMAND.bits()
            | Self::CC_ERROR.bits();

        /// Errors that make the transfer state check fail
        const TRAN_ERRORS = Self::OUT_OF_RANGE.bits()
            | Self::ADDRESS_ERROR.bits()
            | Self::BLOCK_LEN_ERROR.bits()
            | Self::CID_CSD_OVERWRITE.bits();
    }
}

impl R1 {
    pub fn from_response(word: u32) -> Self {
        R1::from_bits_retain(word)
    }

    /// Current state field
    pub fn state(&self) -> CurrentState {
        CardStatus::<SD>::from(self.bits()).state()
    }

    /// In transfer state without any error that would prevent a transfer
    pub fn in_transfer_state(&self) -> bool {
        self.state() == CurrentState::Transfer && !self.intersects(R1::TRAN_ERRORS)
    }
}

/// MMC SWITCH (CMD6) argument writing `value` to EXT_CSD byte `index`
pub const fn mmc_switch_arg(index: u8, value: u8) -> u32 {
    const ACCESS_WRITE_BYTE: u32 = 3;
    const CMD_SET: u32 = 3;
    (ACCESS_WRITE_BYTE << 24) | ((index as u32) << 16) | ((value as u32) << 8) | CMD_SET
}

/// EXT_CSD fields
pub mod ext_csd {
    use super::SECTOR_SIZE;

    pub const BUS_WIDTH: u8 = 183;
    pub const HS_TIMING: u8 = 185;
    pub const CARD_TYPE: usize = 196;
    pub const SEC_COUNT: usize = 212;

    pub const BUS_WIDTH_4: u8 = 1;
    pub const BUS_WIDTH_8: u8 = 2;
    const CARD_TYPE_52MHZ: u8 = 1 << 1;

    /// Sector count of a sector addressed MMC
    pub fn sector_count(ext_csd: &[u8; SECTOR_SIZE]) -> u32 {
        u32::from_le_bytes([
            ext_csd[SEC_COUNT],
            ext_csd[SEC_COUNT + 1],
            ext_csd[SEC_COUNT + 2],
            ext_csd[SEC_COUNT + 3],
        ])
    }

    /// High speed clock supported by the card, in MHz
    pub fn max_clock_mhz(ext_csd: &[u8; SECTOR_SIZE]) -> u32 {
        if ext_csd[CARD_TYPE] & CARD_TYPE_52MHZ != 0 {
            52
        } else {
            26
        }
    }
}

/// SD SWITCH_FUNC (CMD6)
pub mod switch_func {
    /// Query only
    pub const MODE_CHECK: u32 = 0;
    /// Apply the selection
    pub const MODE_SWITCH: u32 = 1 << 31;
    /// Leave groups 2 to 6 untouched
    pub const KEEP_OTHER_GROUPS: u32 = 0x00FF_FFF0;
    pub const HIGH_SPEED: u32 = 1;

    /// Length of the switch status block
    pub const STATUS_LEN: usize = 64;

    /// `true` if the status reports function 1 (high speed) selectable in
    /// group 1
    pub fn high_speed_selected(status: &[u8; STATUS_LEN]) -> bool {
        // Bits 379:376, low nibble of byte 16
        status[16] & 0x0F == HIGH_SPEED as u8
    }
}

/// Card specific data, most significant word first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Csd([u32; 4]);

impl From<[u32; 4]> for Csd {
    fn from(words: [u32; 4]) -> Self {
        Csd(words)
    }
}

impl Csd {
    /// Raw response words, most significant first
    pub fn words(&self) -> [u32; 4] {
        self.0
    }

    /// Extracts bits `msb..=lsb` (bit 127 is the top of word 0)
    fn bits(&self, msb: u32, lsb: u32) -> u32 {
        debug_assert!(msb >= lsb && msb - lsb < 32 && msb < 128);
        let value = (u128::from(self.0[0]) << 96)
            | (u128::from(self.0[1]) << 64)
            | (u128::from(self.0[2]) << 32)
            | u128::from(self.0[3]);
        let width = msb - lsb + 1;
        ((value >> lsb) & ((1u128 << width) - 1)) as u32
    }

    /// CSD_STRUCTURE
    pub fn structure(&self) -> u8 {
        self.bits(127, 126) as u8
    }

    /// SPEC_VERS, MMC only
    pub fn mmc_spec_version(&self) -> u8 {
        self.bits(125, 122) as u8
    }

    /// TRAN_SPEED
    pub fn tran_speed(&self) -> u8 {
        self.bits(103, 96) as u8
    }

    /// READ_BL_LEN, log2 of the maximum read block length
    pub fn read_block_len(&self) -> u8 {
        self.bits(83, 80) as u8
    }

    /// WRITE_BL_LEN, log2 of the maximum write block length
    pub fn write_block_len(&self) -> u8 {
        self.bits(25, 22) as u8
    }

    /// C_SIZE of the version 1 layout
    pub fn c_size_v1(&self) -> u32 {
        self.bits(73, 62)
    }

    /// C_SIZE_MULT of the version 1 layout
    pub fn c_size_mult(&self) -> u8 {
        self.bits(49, 47) as u8
    }

    /// C_SIZE of the version 2 layout
    pub fn c_size_v2(&self) -> u32 {
        self.bits(69, 48)
    }

    /// PERM_WRITE_PROTECT or TMP_WRITE_PROTECT
    pub fn write_protected(&self) -> bool {
        self.bits(13, 12) != 0
    }

    /// Capacity in 512 byte sectors.
    ///
    /// SD cards select the layout with CSD_STRUCTURE. MMC cards always use
    /// the version 1 layout; sector addressed MMC report their real size in
    /// the EXT_CSD instead.
    pub fn sector_count(&self, card_type: CardType) -> Result<u32, Error> {
        if card_type.is_sd() {
            match self.structure() {
                0 => self.sector_count_v1(),
                1 => {
                    let sectors = u64::from(self.c_size_v2() + 1) << 10;
                    u32::try_from(sectors).map_err(|_| Error::CapacityOverflow)
                }
                v => Err(Error::UnsupportedCsdVersion(v)),
            }
        } else {
            self.sector_count_v1()
        }
    }

    fn sector_count_v1(&self) -> Result<u32, Error> {
        const BLOCK_LEN_512: u8 = 9;
        if self.write_block_len() < BLOCK_LEN_512 || self.read_block_len() < BLOCK_LEN_512 {
            return Err(Error::UnsupportedBlockLength);
        }
        let blocks = u64::from(self.c_size_v1() + 1) << (self.c_size_mult() + 2);
        let bytes = blocks << self.read_block_len();
        u32::try_from(bytes / SECTOR_SIZE as u64).map_err(|_| Error::CapacityOverflow)
    }

    /// Maximum bus clock derived from TRAN_SPEED
    pub fn max_clock(&self, card_type: CardType) -> Hertz {
        const UNIT_KHZ: [u32; 4] = [10, 100, 1_000, 10_000];
        const MULT: [u32; 16] = [0, 10, 12, 13, 15, 20, 26, 30, 35, 40, 45, 52, 55, 60, 70, 80];

        let tran_speed = self.tran_speed();
        let mut mult = MULT[usize::from(tran_speed >> 3) & 0xF];
        if card_type.is_sd() {
            // SD uses 2.5 and 5.0 where MMC uses 2.6 and 5.2
            mult = match mult {
                26 => 25,
                52 => 50,
                m => m,
            };
        }
        let unit = UNIT_KHZ[usize::from(tran_speed & 0x7).min(UNIT_KHZ.len() - 1)];
        Hertz::from_raw(mult * unit * 1_000)
    }
}
