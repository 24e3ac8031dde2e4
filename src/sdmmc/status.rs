//! Status and capabilities

use embedded_hal::blocking::delay::DelayUs;

use super::{cmd, Error, Sdmmc, SlotPins};
use crate::card::{R1, SECTOR_SIZE};
use crate::dma::DmaChannel;
use crate::mci::Buswidth;
use crate::mmio::RegisterAccess;

/// Longest card password
pub const MAX_PASSWORD_LEN: usize = 16;

/// Operation requested with LOCK_UNLOCK (CMD42)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LockMode {
    /// Unlock with the current password
    Unlock,
    /// Replace the password. The data holds the old password followed by
    /// the new one.
    SetPassword,
    /// Remove the password
    ClearPassword,
    /// Lock with the current password
    Lock,
    /// Erase the whole card, and its password with it
    ForceErase,
}

impl LockMode {
    fn bits(self) -> u8 {
        match self {
            LockMode::Unlock => 0x00,
            LockMode::SetPassword => 0x01,
            LockMode::ClearPassword => 0x02,
            LockMode::Lock => 0x04,
            LockMode::ForceErase => 0x08,
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
    /// Number of 512 byte sectors on the card
    pub fn capacity_sectors(&self, slot: usize) -> Result<u32, Error> {
        Ok(self.card(slot)?.capacity.sectors)
    }

    /// Negotiated data bus width, or the wired width when no card has been
    /// identified
    pub fn bus_width(&self, slot: usize) -> Result<Buswidth, Error> {
        let s = self.slot(slot)?;
        Ok(match s.card {
            Some(card) => card.bus_width,
            None => s.bus_width,
        })
    }

    /// `true` if the write protect switch is engaged or the card carries
    /// a permanent or temporary write protection
    pub fn is_write_protected(&mut self, slot: usize) -> Result<bool, Error> {
        self.check_slot(slot)?;
        let s = &mut self.slots[slot];
        let csd_protected = s.card.map_or(false, |card| card.csd.write_protected());
        Ok(s.pins.write_protected() || csd_protected)
    }

    /// Card status word of the card in `slot`
    pub fn card_status(&mut self, slot: usize) -> Result<R1, Error> {
        let rca = self.card(slot)?.rca;
        self.select_slot(slot);
        Ok(R1::from_response(self.command(&cmd::send_status(rca))?.word()))
    }

    /// `true` while the card is password locked
    pub fn is_locked(&mut self, slot: usize) -> Result<bool, Error> {
        Ok(self.card_status(slot)?.contains(R1::CARD_IS_LOCKED))
    }

    /// `true` if the last lock or unlock operation was refused
    pub fn lock_unlock_failed(&mut self, slot: usize) -> Result<bool, Error> {
        Ok(self.card_status(slot)?.contains(R1::LOCK_UNLOCK_FAILED))
    }

    /// Lightweight presence check: card detect switch, then a status
    /// request to an identified card. Does not identify a new card.
    pub fn probe(&mut self, slot: usize) -> Result<bool, Error> {
        self.check_slot(slot)?;
        if !self.slots[slot].pins.card_detected() {
            return Ok(false);
        }
        if self.slots[slot].card.is_none() {
            return Ok(true);
        }
        Ok(self.card_status(slot).is_ok())
    }

    /// Sends a LOCK_UNLOCK command with `password`.
    ///
    /// For [`LockMode::SetPassword`] `password` is the old password
    /// directly followed by the new one. [`LockMode::ForceErase`] ignores
    /// it.
    pub fn set_lock(&mut self, slot: usize, mode: LockMode, password: &[u8]) -> Result<(), Error> {
        let password = match mode {
            LockMode::ForceErase => &[][..],
            _ => password,
        };
        if password.len() > 2 * MAX_PASSWORD_LEN
            || (mode != LockMode::SetPassword && password.len() > MAX_PASSWORD_LEN)
        {
            return Err(Error::PasswordTooLong);
        }

        let rca = self.card(slot)?.rca;
        self.select_slot(slot);
        self.wait_not_busy()?;

        let mut block = [0u8; 2 + 2 * MAX_PASSWORD_LEN];
        block[0] = mode.bits();
        block[1] = password.len() as u8;
        block[2..2 + password.len()].copy_from_slice(password);
        let len = match mode {
            LockMode::ForceErase => 1,
            _ => 2 + password.len(),
        };

        self.command(&cmd::set_block_len(len as u32))?;
        let result = self
            .write_data_block(&cmd::lock_unlock(), &block[..len])
            .and_then(|()| self.wait_not_busy());
        // The card is useless for data transfers with another block length
        self.command(&cmd::set_block_len(SECTOR_SIZE as u32))?;
        result?;

        let status = R1::from_response(self.command(&cmd::send_status(rca))?.word());
        if status.contains(R1::LOCK_UNLOCK_FAILED) {
            log::warn!("slot {}: {:?} refused", slot, mode);
            return Err(Error::CardStatus(R1::LOCK_UNLOCK_FAILED.bits()));
        }
        Ok(())
    }
}
