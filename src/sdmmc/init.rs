//! Card identification

use embedded_hal::blocking::delay::DelayUs;
use sdio_host::emmc::{OCR, RCA};
use sdio_host::sd::{CIC, SD};

use super::{cmd, Capacity, Card, CardState, Error, Sdmmc, SlotPins};
use crate::card::{
    ext_csd, mmc_switch_arg, ocr, switch_func, CardType, Csd, MMC_DEFAULT_RCA, R1, SECTOR_SIZE,
};
use crate::dma::DmaChannel;
use crate::mci::Buswidth;
use crate::mmio::RegisterAccess;
use crate::time::Hertz;

/// Voltage window and sector mode offered to MMC cards
const MMC_OP_COND: u32 = ocr::POWER_UP_DONE | ocr::HIGH_CAPACITY | ocr::VDD_ALL;

/// SEND_IF_COND argument: 2.7-3.6V and check pattern
const IF_COND_ARG: u32 = 0x1AA;
const CHECK_PATTERN: u8 = 0xAA;

/// Delay after the SD high speed switch before the new timing is used
const HIGH_SPEED_SETTLE_US: u32 = 80;

impl<MCI, DMA, DELAY, PINS, const N: usize> Sdmmc<MCI, DMA, DELAY, PINS, N>
where
    MCI: RegisterAccess,
    DMA: DmaChannel,
    DELAY: DelayUs<u32>,
    PINS: SlotPins,
{
    /// Identifies the card in `slot` and brings it to the transfer state
    /// with the widest bus and fastest clock both sides support.
    ///
    /// Anything known about a previous card in the slot is dropped first.
    /// On failure the slot is left without card.
    pub fn init_card(&mut self, slot: usize) -> Result<&Card, Error> {
        self.check_slot(slot)?;
        self.slots[slot].card = None;

        match self.identify(slot) {
            Ok(card) => {
                log::info!(
                    "slot {}: {:?} card, {} sectors, {} bit bus at {} Hz",
                    slot,
                    card.card_type,
                    card.capacity.sectors,
                    card.bus_width.lines(),
                    card.clock.raw()
                );
                self.set_state(slot, CardState::Present);
                let card: &Card = self.slots[slot].card.insert(card);
                Ok(card)
            }
            Err(err) => {
                log::debug!("slot {}: identification failed: {:?}", slot, err);
                self.invalidate(slot);
                Err(err)
            }
        }
    }

    fn identify(&mut self, slot: usize) -> Result<Card, Error> {
        self.set_state(slot, CardState::Reset);
        self.select_slot(slot);
        self.command(&cmd::init_clocks())?;
        self.command(&cmd::go_idle())?;

        self.set_state(slot, CardState::VoltageNegotiation);
        // Only MMC answer CMD1
        let (mut card_type, ocr) = match self.exec_command(&cmd::mmc_send_op_cond(MMC_OP_COND)) {
            Ok(response) => self.mmc_op_cond(response.word())?,
            Err(_) => self.sd_op_cond()?,
        };

        self.set_state(slot, CardState::Identification);
        let cid = self.command(&cmd::all_send_cid())?.words();
        let rca = if card_type.is_sd() {
            let response = self.command(&cmd::sd_send_relative_address())?;
            RCA::<SD>::from(response.word()).address()
        } else {
            self.command(&cmd::mmc_set_relative_address(MMC_DEFAULT_RCA))?;
            MMC_DEFAULT_RCA
        };

        self.set_state(slot, CardState::GeometryRead);
        let mut csd = self.read_csd(rca)?;
        if card_type.is_mmc() && csd.mmc_spec_version() == 4 {
            card_type |= CardType::MMC_V4;
        }
        let mut capacity = Capacity {
            sectors: csd.sector_count(card_type)?,
        };
        let mut max_clock = csd.max_clock(card_type);

        self.command(&cmd::select_card(rca))?;
        self.set_state(slot, CardState::Selected);

        let mut mmc_high_speed_clock = None;
        if card_type.contains(CardType::MMC_V4) {
            let mut ext = [0u8; SECTOR_SIZE];
            self.read_data_block(&cmd::mmc_send_ext_csd(), &mut ext)?;
            if card_type.is_high_capacity() {
                capacity.sectors = ext_csd::sector_count(&ext);
            }
            mmc_high_speed_clock = Some(Hertz::MHz(ext_csd::max_clock_mhz(&ext)));
        }

        let bus_width = self.negotiate_bus_width(slot, card_type, rca)?;
        self.mci.select(slot as u8, bus_width);

        let mut high_speed = false;
        if let (Some(hs_clock), true) = (mmc_high_speed_clock, self.config.high_speed) {
            self.command(&cmd::mmc_switch(mmc_switch_arg(ext_csd::HS_TIMING, 1)))?;
            high_speed = true;
            max_clock = hs_clock;
        } else if card_type.contains(CardType::SD_V2) && self.config.high_speed {
            high_speed = self.sd_high_speed()?;
            if high_speed {
                // The card reports its new TRAN_SPEED in a fresh CSD, which
                // can only be read in stand-by
                self.command(&cmd::deselect_card())?;
                csd = self.read_csd(rca)?;
                self.command(&cmd::select_card(rca))?;
                max_clock = csd.max_clock(card_type);
            }
        }
        self.mci.set_high_speed(high_speed);

        let clock = self
            .mci
            .set_clock(Hertz::from_raw(max_clock.raw().min(self.config.max_clock.raw())));

        let status = R1::from_response(self.command(&cmd::send_status(rca))?.word());
        if !status.in_transfer_state() {
            log::warn!("slot {}: card not in transfer state ({:#010x})", slot, status.bits());
            return Err(Error::UnexpectedState);
        }
        self.command(&cmd::set_block_len(SECTOR_SIZE as u32))?;

        Ok(Card {
            card_type,
            rca,
            ocr,
            cid,
            csd,
            capacity,
            max_clock,
            clock,
            bus_width,
            high_speed,
        })
    }

    /// Repeats CMD1 until the card has powered up
    fn mmc_op_cond(&mut self, mut ocr: u32) -> Result<(CardType, u32), Error> {
        let mut attempts = self.config.op_cond_attempts;
        while ocr & ocr::POWER_UP_DONE == 0 {
            attempts = attempts.checked_sub(1).ok_or(Error::OpCondTimeout)?;
            self.delay.delay_us(self.config.op_cond_interval.ticks());
            ocr = self.command(&cmd::mmc_send_op_cond(MMC_OP_COND))?.word();
        }

        let mut card_type = CardType::MMC;
        if ocr & ocr::HIGH_CAPACITY != 0 {
            card_type |= CardType::MMC_HC;
        }
        Ok((card_type, ocr))
    }

    /// SEND_IF_COND then ACMD41 until the card has powered up
    fn sd_op_cond(&mut self) -> Result<(CardType, u32), Error> {
        let mut card_type = CardType::SD;
        // Version 1 cards do not answer
        if let Ok(response) = self.exec_command(&cmd::send_if_cond(IF_COND_ARG)) {
            if CIC::from(response.word()).pattern() != CHECK_PATTERN {
                return Err(Error::UnexpectedState);
            }
            card_type |= CardType::SD_V2;
        }

        let mut arg = ocr::VDD_32_33;
        if card_type.contains(CardType::SD_V2) {
            arg |= ocr::HIGH_CAPACITY;
        }

        let mut attempts = self.config.op_cond_attempts;
        let ocr = loop {
            let word = self.app_command(0, &cmd::sd_send_op_cond(arg))?.word();
            if !OCR::<SD>::from(word).is_busy() {
                break word;
            }
            attempts = attempts.checked_sub(1).ok_or(Error::OpCondTimeout)?;
            self.delay.delay_us(self.config.op_cond_interval.ticks());
        };

        if card_type.contains(CardType::SD_V2) && OCR::<SD>::from(ocr).high_capacity() {
            card_type |= CardType::SD_HC;
        }
        Ok((card_type, ocr))
    }

    fn read_csd(&mut self, rca: u16) -> Result<Csd, Error> {
        Ok(Csd::from(self.command(&cmd::send_csd(rca))?.words()))
    }

    /// Switches the card to the widest bus the slot is wired for
    fn negotiate_bus_width(
        &mut self,
        slot: usize,
        card_type: CardType,
        rca: u16,
    ) -> Result<Buswidth, Error> {
        let wired = self.slots[slot].bus_width;
        if card_type.is_sd() {
            if wired.lines() >= 4 {
                self.app_command(rca, &cmd::set_bus_width(true))?;
                return Ok(Buswidth::Four);
            }
        } else if card_type.contains(CardType::MMC_V4) {
            let (width, value) = match wired {
                Buswidth::Eight => (Buswidth::Eight, ext_csd::BUS_WIDTH_8),
                Buswidth::Four => (Buswidth::Four, ext_csd::BUS_WIDTH_4),
                Buswidth::One => return Ok(Buswidth::One),
            };
            self.command(&cmd::mmc_switch(mmc_switch_arg(ext_csd::BUS_WIDTH, value)))?;
            return Ok(width);
        }
        Ok(Buswidth::One)
    }

    /// Selects function 1 of group 1 when the card supports it. Returns
    /// `true` if the card now runs with high speed timing.
    fn sd_high_speed(&mut self) -> Result<bool, Error> {
        let mut status = [0u8; switch_func::STATUS_LEN];
        let arg = switch_func::KEEP_OTHER_GROUPS | switch_func::HIGH_SPEED;

        let check = cmd::sd_switch_function(switch_func::MODE_CHECK | arg).tolerate_timeout();
        self.read_data_block(&check, &mut status)?;
        if !switch_func::high_speed_selected(&status) {
            log::debug!("high speed not supported by the card");
            return Ok(false);
        }

        let switch = cmd::sd_switch_function(switch_func::MODE_SWITCH | arg).tolerate_timeout();
        self.read_data_block(&switch, &mut status)?;
        if !switch_func::high_speed_selected(&status) {
            log::warn!("card refused high speed switch");
            return Ok(false);
        }

        // The card switches timing at most 8 clock cycles after the status
        // block, give it some margin
        self.delay.delay_us(HIGH_SPEED_SETTLE_US);
        Ok(true)
    }
}
