//! Block device interface
//!
//! The operations a mass storage layer (USB MSC, a file system) expects
//! from a removable medium. Nothing here returns a driver [`Error`]: the
//! caller only learns whether the medium is there and whether the
//! operation worked. A failed transfer invalidates the card so that the
//! next access identifies it again.
//!
//! ```ignore
//! loop {
//!     match sdmmc.test_unit_ready(0) {
//!         UnitStatus::Ready => break,
//!         UnitStatus::Busy => continue,
//!         UnitStatus::NotPresent => return Err(CtrlError::NotPresent),
//!     }
//! }
//! let sectors = sdmmc.read_capacity(0)?;
//! sdmmc.read_sectors(0, 0, &mut buffer)?;
//! ```

use core::fmt;

use embedded_hal::blocking::delay::DelayUs;

use crate::card::SECTOR_SIZE;
use crate::dma::DmaChannel;
use crate::mmio::RegisterAccess;
use crate::sdmmc::{Error, Presence, Sdmmc, SlotPins};

/// Answer to a unit ready request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UnitStatus {
    /// The medium can be accessed
    Ready,
    /// The medium changed since the last request, ask again
    Busy,
    NotPresent,
}

/// Failed block device operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CtrlError {
    /// No usable card in the slot
    NotPresent,
    /// The card is there but the operation failed
    Fail,
}

impl fmt::Display for CtrlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtrlError::NotPresent => f.write_str("medium not present"),
            CtrlError::Fail => f.write_str("medium access failed"),
        }
    }
}

impl<MCI, DMA, DELAY, PINS, const N: usize> Sdmmc<MCI, DMA, DELAY, PINS, N>
where
    MCI: RegisterAccess,
    DMA: DmaChannel,
    DELAY: DelayUs<u32>,
    PINS: SlotPins,
{
    /// `true` if a usable card sits in `slot`, identifying it if needed.
    ///
    /// The card detect switch is checked first. An identified card must
    /// still answer a status request, otherwise identification is tried
    /// again up to the configured number of attempts.
    pub fn mem_check(&mut self, slot: usize) -> bool {
        if self.check_slot(slot).is_err() {
            return false;
        }
        if !self.slots[slot].pins.card_detected() {
            self.invalidate(slot);
            return false;
        }
        if self.slots[slot].card.is_some() {
            if self.card_status(slot).is_ok() {
                return true;
            }
            self.invalidate(slot);
        }

        for attempt in 0..self.config.init_attempts {
            match self.init_card(slot) {
                Ok(_) => return true,
                Err(err) => log::debug!("slot {}: attempt {}: {:?}", slot, attempt, err),
            }
        }
        false
    }

    /// Reports media changes once before reporting the new state, the way
    /// a removable SCSI unit does
    pub fn test_unit_ready(&mut self, slot: usize) -> UnitStatus {
        if self.check_slot(slot).is_err() {
            return UnitStatus::NotPresent;
        }
        match self.slots[slot].presence {
            Presence::Removed => {
                if self.mem_check(slot) {
                    self.slots[slot].presence = Presence::Present;
                    UnitStatus::Busy
                } else {
                    UnitStatus::NotPresent
                }
            }
            Presence::Present => {
                if self.mem_check(slot) {
                    UnitStatus::Ready
                } else {
                    log::info!("slot {}: card removed", slot);
                    self.slots[slot].presence = Presence::Removing;
                    self.invalidate(slot);
                    UnitStatus::Busy
                }
            }
            Presence::Removing => {
                self.slots[slot].presence = Presence::Removed;
                UnitStatus::NotPresent
            }
        }
    }

    /// Number of sectors on the card
    pub fn read_capacity(&mut self, slot: usize) -> Result<u32, CtrlError> {
        self.ensure_card(slot)?;
        self.capacity_sectors(slot).map_err(|_| CtrlError::NotPresent)
    }

    /// `true` if writes to the card in `slot` are not allowed
    pub fn write_protect_status(&mut self, slot: usize) -> bool {
        self.is_write_protected(slot).unwrap_or(false)
    }

    /// Reads `buf.len() / 512` sectors starting at `start`
    pub fn read_sectors(&mut self, slot: usize, start: u32, buf: &mut [u8]) -> Result<(), CtrlError> {
        self.ensure_card(slot)?;
        let result = self.read_blocks(slot, start, buf);
        self.ctrl_result(slot, result)
    }

    /// Writes `buf.len() / 512` sectors starting at `start`
    pub fn write_sectors(&mut self, slot: usize, start: u32, buf: &[u8]) -> Result<(), CtrlError> {
        self.ensure_card(slot)?;
        let result = self.write_blocks(slot, start, buf);
        self.ctrl_result(slot, result)
    }

    /// Reads `count` sectors, handing each one to `f` as it arrives
    pub fn read_sectors_with<F>(
        &mut self,
        slot: usize,
        start: u32,
        count: u16,
        sector: &mut [u8; SECTOR_SIZE],
        f: F,
    ) -> Result<(), CtrlError>
    where
        F: FnMut(u32, &[u8; SECTOR_SIZE]),
    {
        self.ensure_card(slot)?;
        let result = self.read_blocks_with(slot, start, count, sector, f);
        self.ctrl_result(slot, result)
    }

    /// Writes `count` sectors, letting `f` fill each one before it is sent
    pub fn write_sectors_with<F>(
        &mut self,
        slot: usize,
        start: u32,
        count: u16,
        sector: &mut [u8; SECTOR_SIZE],
        f: F,
    ) -> Result<(), CtrlError>
    where
        F: FnMut(u32, &mut [u8; SECTOR_SIZE]),
    {
        self.ensure_card(slot)?;
        let result = self.write_blocks_with(slot, start, count, sector, f);
        self.ctrl_result(slot, result)
    }

    fn ensure_card(&mut self, slot: usize) -> Result<(), CtrlError> {
        if self.mem_check(slot) {
            Ok(())
        } else {
            Err(CtrlError::NotPresent)
        }
    }

    fn ctrl_result(&mut self, slot: usize, result: Result<(), Error>) -> Result<(), CtrlError> {
        result.map_err(|err| {
            log::debug!("slot {}: transfer failed: {:?}", slot, err);
            self.invalidate(slot);
            CtrlError::Fail
        })
    }

    /// Wraps the driver into an [`embedded_sdmmc::BlockDevice`] for the
    /// card in `slot`
    #[cfg(feature = "sdmmc-fatfs")]
    pub fn sdmmc_block_device(self, slot: usize) -> SdmmcBlockDevice<Self> {
        SdmmcBlockDevice {
            sdmmc: core::cell::RefCell::new(self),
            slot,
        }
    }
}

#[cfg(feature = "sdmmc-fatfs")]
pub struct SdmmcBlockDevice<SDMMC> {
    sdmmc: core::cell::RefCell<SDMMC>,
    slot: usize,
}

#[cfg(feature = "sdmmc-fatfs")]
impl<SDMMC> SdmmcBlockDevice<SDMMC> {
    pub fn free(self) -> SDMMC {
        self.sdmmc.into_inner()
    }
}

#[cfg(feature = "sdmmc-fatfs")]
impl<MCI, DMA, DELAY, PINS, const N: usize> embedded_sdmmc::BlockDevice
    for SdmmcBlockDevice<Sdmmc<MCI, DMA, DELAY, PINS, N>>
where
    MCI: RegisterAccess,
    DMA: DmaChannel,
    DELAY: DelayUs<u32>,
    PINS: SlotPins,
{
    type Error = Error;

    fn read(
        &self,
        blocks: &mut [embedded_sdmmc::Block],
        start_block_idx: embedded_sdmmc::BlockIdx,
        _reason: &str,
    ) -> Result<(), Self::Error> {
        let start = start_block_idx.0;
        let mut sdmmc = self.sdmmc.borrow_mut();
        for (block_idx, block) in (start..).zip(blocks.iter_mut()) {
            sdmmc.read_blocks(self.slot, block_idx, &mut block.contents)?;
        }
        Ok(())
    }

    fn write(
        &self,
        blocks: &[embedded_sdmmc::Block],
        start_block_idx: embedded_sdmmc::BlockIdx,
    ) -> Result<(), Self::Error> {
        let start = start_block_idx.0;
        let mut sdmmc = self.sdmmc.borrow_mut();
        for (block_idx, block) in (start..).zip(blocks.iter()) {
            sdmmc.write_blocks(self.slot, block_idx, &block.contents)?;
        }
        Ok(())
    }

    fn num_blocks(&self) -> Result<embedded_sdmmc::BlockCount, Self::Error> {
        let sdmmc = self.sdmmc.borrow();
        Ok(embedded_sdmmc::BlockCount(sdmmc.card(self.slot)?.capacity.sectors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdmmc::Config;
    use crate::sim::{Bench, Kind, SimCard};
    use crate::time::MicroSeconds;

    #[test]
    fn unit_attention_on_insert_and_removal() {
        let (mut sdmmc, bench) = Bench::new(Config::default());
        assert_eq!(sdmmc.test_unit_ready(0), UnitStatus::NotPresent);

        bench.insert(0, SimCard::new(Kind::SdHc));
        assert_eq!(sdmmc.test_unit_ready(0), UnitStatus::Busy);
        assert_eq!(sdmmc.test_unit_ready(0), UnitStatus::Ready);
        assert_eq!(sdmmc.test_unit_ready(0), UnitStatus::Ready);

        bench.remove(0);
        assert_eq!(sdmmc.test_unit_ready(0), UnitStatus::Busy);
        assert!(sdmmc.card(0).is_err());
        assert_eq!(sdmmc.test_unit_ready(0), UnitStatus::NotPresent);
        assert_eq!(sdmmc.test_unit_ready(0), UnitStatus::NotPresent);

        assert_eq!(sdmmc.test_unit_ready(7), UnitStatus::NotPresent);
    }

    #[test]
    fn removal_invalidates_identity() {
        let (mut sdmmc, bench) = Bench::new(Config::default());
        bench.insert(0, SimCard::new(Kind::SdHc));
        assert_eq!(sdmmc.read_capacity(0), Ok(Kind::SdHc.sectors()));

        // Another card goes in while nobody was looking
        bench.remove(0);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(sdmmc.read_sectors(0, 0, &mut buf), Err(CtrlError::NotPresent));
        assert!(sdmmc.card(0).is_err());

        bench.insert(0, SimCard::new(Kind::SdV1));
        assert_eq!(sdmmc.read_capacity(0), Ok(0x1D_4C00));
    }

    #[test]
    fn sectors_round_trip() {
        let (mut sdmmc, bench) = Bench::new(Config::default());
        bench.insert(0, SimCard::new(Kind::SdV2));

        let data: Vec<u8> = (0..2 * SECTOR_SIZE).map(|i| (i % 251) as u8).collect();
        sdmmc.write_sectors(0, 77, &data).unwrap();
        let mut back = vec![0u8; 2 * SECTOR_SIZE];
        sdmmc.read_sectors(0, 77, &mut back).unwrap();
        assert_eq!(back, data);

        let mut sector = [0u8; SECTOR_SIZE];
        let mut first_bytes = Vec::new();
        sdmmc
            .read_sectors_with(0, 77, 2, &mut sector, |index, s| first_bytes.push((index, s[0])))
            .unwrap();
        assert_eq!(first_bytes, vec![(77, data[0]), (78, data[SECTOR_SIZE])]);

        sdmmc
            .write_sectors_with(0, 5, 1, &mut sector, |_, s| s.fill(0xA5))
            .unwrap();
        assert_eq!(bench.bus().card(0).sector(5), [0xA5; SECTOR_SIZE]);
    }

    #[test]
    fn failed_transfer_invalidates_card() {
        let (mut sdmmc, bench) = Bench::new(Config::default());
        bench.insert(0, SimCard::new(Kind::SdHc));
        assert_eq!(sdmmc.read_capacity(0), Ok(Kind::SdHc.sectors()));

        bench.bus().inject_data_error = Some(crate::mci::Status::DCRCE);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(sdmmc.read_sectors(0, 0, &mut buf), Err(CtrlError::Fail));
        assert!(sdmmc.card(0).is_err());

        // Identified again on the next access
        sdmmc.read_sectors(0, 0, &mut buf).unwrap();
        assert!(sdmmc.card(0).is_ok());

        let too_far = Kind::SdHc.sectors();
        assert_eq!(sdmmc.read_sectors(0, too_far, &mut buf), Err(CtrlError::Fail));
    }

    #[test]
    fn identification_attempts_are_bounded() {
        let config = Config::default()
            .init_attempts(3)
            .op_cond(1, MicroSeconds::micros(1));
        let (mut sdmmc, bench) = Bench::new(config);
        let mut card = SimCard::new(Kind::SdHc);
        // Two failed attempts use up 2 busy answers each
        card.power_up_polls = 4;
        bench.insert(0, card);

        assert!(sdmmc.mem_check(0));
        assert_eq!(
            bench.bus().commands.iter().filter(|&&(op, _)| op == 0).count(),
            3
        );

        let config = Config::default().init_attempts(2).op_cond(0, MicroSeconds::micros(1));
        let (mut sdmmc, bench) = Bench::new(config);
        let mut card = SimCard::new(Kind::SdHc);
        card.power_up_polls = 100;
        bench.insert(0, card);
        assert!(!sdmmc.mem_check(0));
        assert_eq!(sdmmc.read_capacity(0), Err(CtrlError::NotPresent));
    }

    #[test]
    fn write_protect_switch() {
        let (mut sdmmc, bench) = Bench::new(Config::default());
        bench.insert(1, SimCard::new(Kind::Mmc));
        assert!(!sdmmc.write_protect_status(1));
        bench.set_write_protect(1, true);
        assert!(sdmmc.write_protect_status(1));
        assert!(!sdmmc.write_protect_status(9));
    }
}
