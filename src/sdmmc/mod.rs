//! # SD MultiMediaCard driver
//!
//! For SD (v1, v2, SDHC) and MMC (including 4.x sector addressed) cards
//! behind an MCI host controller.
//!
//! One [`Sdmmc`] owns the controller, the DMA channel used for data
//! phases, a delay provider for bounded waits, and up to `N` card
//! [`Slot`]s. Every operation takes the slot index it applies to.
//!
//! ## Usage
//!
//! ```ignore
//! use mci_sdmmc::mci::Buswidth;
//! use mci_sdmmc::mmio::Mmio;
//! use mci_sdmmc::dma::{Dmaca, Handshake};
//! use mci_sdmmc::sdmmc::{Config, Pins, Sdmmc, Slot};
//!
//! let mci = unsafe { Mmio::new(0xFFFF_4000) };
//! let dmaca = Dmaca::new(unsafe { Mmio::new(0xFF10_0000) }, 1, Handshake { rx: 2, tx: 3 });
//! let slot = Slot::new(Pins::new(card_detect, write_protect, dat0), Buswidth::Four);
//!
//! let mut sdmmc = Sdmmc::new(mci, dmaca, delay, 60.MHz(), [slot], Config::default());
//! ```
//!
//! The card is identified with [`init_card`](Sdmmc::init_card), or lazily
//! by the block device operations in [`ctrl`](crate::ctrl).
//!
//! ```ignore
//! match sdmmc.init_card(0) {
//!     Ok(card) => info!("Card: {} sectors", card.capacity.sectors),
//!     Err(err) => info!("Init err: {:?}", err),
//! }
//! ```
//!
//! Sector data moves through a [`Transfer`], which borrows the driver
//! until it is closed.
//!
//! ```ignore
//! let mut transfer = sdmmc.open_read(0, 2048, 4)?;
//! transfer.read_dma(&mut buffer)?;
//! transfer.close()?;
//! ```

use core::fmt;

use embedded_hal::blocking::delay::DelayUs;
use sdio_host::emmc::{CID, EMMC};
use sdio_host::sd::SD;

use crate::card::{CardType, Csd, SECTOR_SIZE};
use crate::dma::DmaChannel;
use crate::mci::{Buswidth, Mci};
use crate::mmio::RegisterAccess;
use crate::time::Hertz;

mod command;
mod config;
mod init;
mod slot;
mod status;
mod transfer;


pub use command::{cmd, Command, CommandError, Response, ResponseKind};
pub use config::{BusyDetect, Config, DataPath};
pub use slot::{CardState, FixedLevel, Pins, Presence, Slot, SlotPins};
pub use status::LockMode;
pub use transfer::{DmaToken, Read, Transfer, TransferDirection, Write};

/// Errors
#[non_exhaustive]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// No response to a command (`RTOE`)
    ResponseTimeout,
    /// Response CRC mismatch (`RCRCE`)
    ResponseCrc,
    /// Response carries the wrong command index (`RINDE`)
    ResponseIndex,
    /// Response end bit error (`RENDE`)
    ResponseEndBit,
    /// Response direction error (`RDIRE`)
    ResponseDirection,
    /// Completion signal timeout (`CSTOE`)
    CompletionTimeout,
    /// Data timeout (`DTOE`)
    DataTimeout,
    /// Data CRC mismatch (`DCRCE`)
    DataCrc,
    /// Receive FIFO overrun (`OVRE`)
    Overrun,
    /// Transmit FIFO underrun (`UNRE`)
    Underrun,
    /// A polling budget ran out before the controller answered
    SoftwareTimeout,
    /// No card in the slot, or the card has not been identified
    NoCard,
    /// Slot index out of range
    InvalidSlot,
    /// Error bits set in the card status word
    CardStatus(u32),
    /// The card is not in the state the command requires
    UnexpectedState,
    /// The card never left its power up routine
    OpCondTimeout,
    /// Unknown CSD structure version
    UnsupportedCsdVersion(u8),
    /// Read or write block length below 512 bytes
    UnsupportedBlockLength,
    /// Card holds more sectors than a `u32` counts
    CapacityOverflow,
    /// Sector range beyond the end of the card
    OutOfRange,
    /// Transfer closed before every byte was moved
    IncompleteTransfer,
    /// More data offered or requested than the transfer covers
    TransferExhausted,
    /// A DMA request is still in flight
    DmaBusy,
    /// Buffer length does not match the requested sectors
    BufferSize,
    /// Card passwords are at most 16 bytes
    PasswordTooLong,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ResponseTimeout => f.write_str("response timeout"),
            Error::ResponseCrc => f.write_str("response CRC error"),
            Error::ResponseIndex => f.write_str("response index error"),
            Error::ResponseEndBit => f.write_str("response end bit error"),
            Error::ResponseDirection => f.write_str("response direction error"),
            Error::CompletionTimeout => f.write_str("completion signal timeout"),
            Error::DataTimeout => f.write_str("data timeout"),
            Error::DataCrc => f.write_str("data CRC error"),
            Error::Overrun => f.write_str("FIFO overrun"),
            Error::Underrun => f.write_str("FIFO underrun"),
            Error::SoftwareTimeout => f.write_str("controller did not answer in time"),
            Error::NoCard => f.write_str("no card"),
            Error::InvalidSlot => f.write_str("invalid slot"),
            Error::CardStatus(bits) => write!(f, "card status error {:#010x}", bits),
            Error::UnexpectedState => f.write_str("card in unexpected state"),
            Error::OpCondTimeout => f.write_str("card stayed busy during power up"),
            Error::UnsupportedCsdVersion(v) => write!(f, "unsupported CSD structure {}", v),
            Error::UnsupportedBlockLength => f.write_str("block length below 512 bytes"),
            Error::CapacityOverflow => f.write_str("capacity beyond 2^32 sectors"),
            Error::OutOfRange => f.write_str("sector out of range"),
            Error::IncompleteTransfer => f.write_str("transfer closed early"),
            Error::TransferExhausted => f.write_str("transfer already complete"),
            Error::DmaBusy => f.write_str("DMA request in flight"),
            Error::BufferSize => f.write_str("buffer size mismatch"),
            Error::PasswordTooLong => f.write_str("password too long"),
        }
    }
}

/// Card size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Capacity {
    /// Number of sectors
    pub sectors: u32,
}

impl Capacity {
    /// Sector size in bytes
    pub const fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    /// Size in bytes
    pub fn bytes(&self) -> u64 {
        u64::from(self.sectors) * SECTOR_SIZE as u64
    }
}

/// Identified card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Card {
    /// Family and capabilities
    pub card_type: CardType,
    /// Relative card address
    pub rca: u16,
    /// Operating conditions register
    pub ocr: u32,
    /// Raw card identification register, most significant word first
    pub cid: [u32; 4],
    /// Card specific data
    pub csd: Csd,
    pub capacity: Capacity,
    /// Fastest clock the card accepts
    pub max_clock: Hertz,
    /// Clock in use for data transfers
    pub clock: Hertz,
    /// Negotiated data bus width
    pub bus_width: Buswidth,
    /// High speed timing enabled
    pub high_speed: bool,
}

impl Card {
    /// Argument of commands addressed to this card
    pub(crate) fn rca_arg(&self) -> u32 {
        u32::from(self.rca) << 16
    }

    /// Command argument addressing `sector`. High capacity cards take the
    /// sector index, the others a byte offset.
    pub fn address(&self, sector: u32) -> Result<u32, Error> {
        if self.card_type.is_high_capacity() {
            Ok(sector)
        } else {
            sector.checked_mul(SECTOR_SIZE as u32).ok_or(Error::OutOfRange)
        }
    }

    /// Decoded identification register of an SD card
    pub fn sd_cid(&self) -> Option<CID<SD>> {
        if !self.card_type.is_sd() {
            return None;
        }
        let cid = (u128::from(self.cid[0]) << 96)
            | (u128::from(self.cid[1]) << 64)
            | (u128::from(self.cid[2]) << 32)
            | u128::from(self.cid[3]);
        Some(cid.into())
    }

    /// Decoded identification register of an MMC
    pub fn mmc_cid(&self) -> Option<CID<EMMC>> {
        if !self.card_type.is_mmc() {
            return None;
        }
        Some(CID::from([self.cid[3], self.cid[2], self.cid[1], self.cid[0]]))
    }
}

/// SD/MMC driver
pub struct Sdmmc<MCI, DMA, DELAY, PINS, const N: usize> {
    mci: Mci<MCI>,
    dma: DMA,
    delay: DELAY,
    pub(crate) config: Config,
    pub(crate) slots: [Slot<PINS>; N],
    /// Slot the controller is currently routed to
    selected: usize,
}

impl<MCI, DMA, DELAY, PINS, const N: usize> fmt::Debug for Sdmmc<MCI, DMA, DELAY, PINS, N>
where
    MCI: RegisterAccess,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut cards = [false; N];
        for (present, slot) in cards.iter_mut().zip(self.slots.iter()) {
            *present = slot.card.is_some();
        }
        f.debug_struct("SDMMC")
            .field("Slots", &N)
            .field("Cards identified", &cards)
            .field("Selected slot", &self.selected)
            .field("Bus clock", &self.mci.mck())
            .finish()
    }
}

impl<MCI, DMA, DELAY, PINS, const N: usize> Sdmmc<MCI, DMA, DELAY, PINS, N>
where
    MCI: RegisterAccess,
    DMA: DmaChannel,
    DELAY: DelayUs<u32>,
    PINS: SlotPins,
{
    /// Creates the driver and resets the controller. `mck` is the
    /// peripheral bus clock feeding the MCI.
    ///
    /// No card is touched until the first identification.
    pub fn new(
        mci: MCI,
        dma: DMA,
        delay: DELAY,
        mck: Hertz,
        slots: [Slot<PINS>; N],
        config: Config,
    ) -> Self {
        let mut mci = Mci::new(mci, mck);
        mci.init();
        Sdmmc {
            mci,
            dma,
            delay,
            config,
            slots,
            selected: 0,
        }
    }

    /// Disables the controller and releases its resources
    pub fn free(mut self) -> (MCI, DMA, DELAY, [Slot<PINS>; N]) {
        self.dma.disable();
        self.mci.disable();
        (self.mci.free(), self.dma, self.delay, self.slots)
    }

    /// Driver configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a reference to the controller
    pub fn inner(&self) -> &Mci<MCI> {
        &self.mci
    }

    /// Returns a mutable reference to the controller
    pub fn inner_mut(&mut self) -> &mut Mci<MCI> {
        &mut self.mci
    }

    pub fn slot(&self, slot: usize) -> Result<&Slot<PINS>, Error> {
        self.slots.get(slot).ok_or(Error::InvalidSlot)
    }

    /// Card identified in `slot`
    pub fn card(&self, slot: usize) -> Result<&Card, Error> {
        self.slot(slot)?.card.as_ref().ok_or(Error::NoCard)
    }

    pub(crate) fn check_slot(&self, slot: usize) -> Result<(), Error> {
        if slot < N {
            Ok(())
        } else {
            Err(Error::InvalidSlot)
        }
    }

    /// Routes the controller to `slot` with the bus settings negotiated
    /// for its card, or identification settings when there is none
    pub(crate) fn select_slot(&mut self, slot: usize) {
        let (width, clock, high_speed) = match self.slots[slot].card {
            Some(card) => (card.bus_width, card.clock, card.high_speed),
            None => (Buswidth::One, self.config.init_clock, false),
        };
        self.selected = slot;
        self.mci.select(slot as u8, width);
        self.mci.set_clock(clock);
        self.mci.set_high_speed(high_speed);
    }

    fn set_state(&mut self, slot: usize, state: CardState) {
        let s = &mut self.slots[slot];
        if s.state != state {
            log::debug!("slot {}: {:?} -> {:?}", slot, s.state, state);
            s.state = state;
        }
    }

    /// Forgets the card in `slot`
    pub(crate) fn invalidate(&mut self, slot: usize) {
        if self.slots[slot].card.is_some() {
            log::debug!("slot {}: card invalidated", slot);
        }
        self.slots[slot].invalidate();
    }
}
