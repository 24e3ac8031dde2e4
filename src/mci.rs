//! # Multimedia Card Interface (MCI)
//!
//! Register level view of the MCI host controller: command, response and
//! data FIFO registers plus the controller wide operations the card driver
//! needs (reset, clock divider, slot and bus width select).
//!
//! Error flags are configured to clear when the status register is read
//! (`CFG.FERRCTRL`). [`Mci::status`] folds every error bit it observes into
//! a latched copy that survives until [`Mci::take_latched`] or a reset, so
//! an error seen while polling for some other flag is never lost.

use bitflags::bitflags;

use crate::mmio::RegisterAccess;
use crate::time::Hertz;

/// Register offsets
pub mod regs {
    pub const CR: usize = 0x00;
    pub const MR: usize = 0x04;
    pub const DTOR: usize = 0x08;
    pub const SDCR: usize = 0x0C;
    pub const ARGR: usize = 0x10;
    pub const CMDR: usize = 0x14;
    pub const BLKR: usize = 0x18;
    pub const CSTOR: usize = 0x1C;
    /// Response register. Successive reads return successive words of a
    /// long response.
    pub const RSPR: usize = 0x20;
    pub const RDR: usize = 0x30;
    pub const TDR: usize = 0x34;
    pub const SR: usize = 0x40;
    pub const IER: usize = 0x44;
    pub const IDR: usize = 0x48;
    pub const IMR: usize = 0x4C;
    pub const DMA: usize = 0x50;
    pub const CFG: usize = 0x54;
    /// Start of the FIFO aperture used by the DMA controller
    pub const FIFO: usize = 0x200;
}

/// Control register
pub mod cr {
    pub const MCIEN: u32 = 1 << 0;
    pub const MCIDIS: u32 = 1 << 1;
    pub const PWSEN: u32 = 1 << 2;
    pub const PWSDIS: u32 = 1 << 3;
    pub const SWRST: u32 = 1 << 7;
}

/// Mode register
pub mod mr {
    pub const CLKDIV_MASK: u32 = 0xFF;
    pub const PWSDIV_SHIFT: u32 = 8;
    pub const PWSDIV_MAX: u32 = 0x7 << PWSDIV_SHIFT;
    pub const RDPROOF: u32 = 1 << 11;
    pub const WRPROOF: u32 = 1 << 12;
    pub const FBYTE: u32 = 1 << 13;
}

/// Data and completion signal timeout registers (same layout)
pub mod tor {
    pub const CYC_SHIFT: u32 = 0;
    pub const MUL_SHIFT: u32 = 4;
    /// Multiplier of 1048576 cycles
    pub const MUL_1048576: u32 = 7;
    /// 2 * 1048576 bus cycles
    pub const TWO_MEGA_CYCLES: u32 = (MUL_1048576 << MUL_SHIFT) | (2 << CYC_SHIFT);
}

/// SD card register
pub mod sdcr {
    pub const SDCSEL_MASK: u32 = 0x3;
    pub const SDCBUS_SHIFT: u32 = 6;
}

/// Command register fields
pub mod cmdr {
    pub const CMDNB_MASK: u32 = 0x3F;
    pub const RSPTYP_SHIFT: u32 = 6;
    pub const RSPTYP_NONE: u32 = 0 << RSPTYP_SHIFT;
    pub const RSPTYP_48: u32 = 1 << RSPTYP_SHIFT;
    pub const RSPTYP_136: u32 = 2 << RSPTYP_SHIFT;
    pub const RSPTYP_R1B: u32 = 3 << RSPTYP_SHIFT;
    /// Initialization sequence (74 clock cycles)
    pub const SPCMD_INIT: u32 = 1 << 8;
    pub const OPDCMD: u32 = 1 << 11;
    pub const MAXLAT: u32 = 1 << 12;
    pub const TRCMD_START: u32 = 1 << 16;
    pub const TRCMD_STOP: u32 = 2 << 16;
    pub const TRDIR_READ: u32 = 1 << 18;
    pub const TRTYP_SINGLE: u32 = 0 << 19;
    pub const TRTYP_MULTIPLE: u32 = 1 << 19;
}

/// Block register fields
pub mod blkr {
    pub const BCNT_MASK: u32 = 0xFFFF;
    pub const BLKLEN_SHIFT: u32 = 16;
}

/// DMA configuration register
pub mod dma {
    pub const CHKSIZE_SHIFT: u32 = 4;
    pub const CHKSIZE_1: u32 = 0 << CHKSIZE_SHIFT;
    pub const CHKSIZE_16: u32 = 3 << CHKSIZE_SHIFT;
    pub const DMAEN: u32 = 1 << 8;
}

/// Configuration register
pub mod cfg {
    pub const FIFOMODE: u32 = 1 << 0;
    pub const FERRCTRL: u32 = 1 << 4;
    pub const HSMODE: u32 = 1 << 8;
}

bitflags! {
    /// Status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Status: u32 {
        const CMDRDY = 1 << 0;
        const RXRDY = 1 << 1;
        const TXRDY = 1 << 2;
        const BLKE = 1 << 3;
        const DTIP = 1 << 4;
        const NOTBUSY = 1 << 5;
        const CSRCV = 1 << 13;
        /// Response index error
        const RINDE = 1 << 16;
        /// Response direction error
        const RDIRE = 1 << 17;
        /// Response CRC error
        const RCRCE = 1 << 18;
        /// Response end bit error
        const RENDE = 1 << 19;
        /// Response timeout
        const RTOE = 1 << 20;
        /// Data CRC error
        const DCRCE = 1 << 21;
        /// Data timeout
        const DTOE = 1 << 22;
        /// Completion signal timeout
        const CSTOE = 1 << 23;
        const BLKOVRE = 1 << 24;
        const DMADONE = 1 << 25;
        const FIFOEMPTY = 1 << 26;
        const XFRDONE = 1 << 27;
        /// Overrun
        const OVRE = 1 << 30;
        /// Underrun
        const UNRE = 1 << 31;

        const COMMAND_ERRORS = Self::RINDE.bits()
            | Self::RDIRE.bits()
            | Self::RCRCE.bits()
            | Self::RENDE.bits()
            | Self::RTOE.bits()
            | Self::CSTOE.bits();
        const DATA_ERRORS = Self::DCRCE.bits()
            | Self::DTOE.bits()
            | Self::OVRE.bits()
            | Self::UNRE.bits();
        const ERRORS = Self::COMMAND_ERRORS.bits() | Self::DATA_ERRORS.bits();
    }
}

/// Possible bus widths
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Buswidth {
    One,
    Four,
    Eight,
}

impl Buswidth {
    /// Number of data lines
    pub fn lines(self) -> u8 {
        match self {
            Buswidth::One => 1,
            Buswidth::Four => 4,
            Buswidth::Eight => 8,
        }
    }

    fn sdcbus(self) -> u32 {
        match self {
            Buswidth::One => 0,
            Buswidth::Four => 2,
            Buswidth::Eight => 3,
        }
    }
}

/// DMA chunk size requested from the MCI
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ChunkSize {
    One,
    Sixteen,
}

/// MCI host controller
pub struct Mci<R> {
    regs: R,
    /// Peripheral bus clock feeding the MCI
    mck: Hertz,
    latched: Status,
}

impl<R: RegisterAccess> Mci<R> {
    /// Wraps the register bank. The controller is left untouched until
    /// [`init`](Self::init).
    pub fn new(regs: R, mck: Hertz) -> Self {
        Mci {
            regs,
            mck,
            latched: Status::empty(),
        }
    }

    /// Brings the controller into its default state: slowest clock, 1-bit
    /// bus on slot 0, 2M cycle timeouts, no DMA hand-off.
    pub fn init(&mut self) {
        self.reset();
        self.regs.write(regs::CR, cr::MCIDIS | cr::PWSDIS);
        self.regs.write(regs::IDR, 0xFFFF_FFFF);
        self.regs.write(regs::DTOR, tor::TWO_MEGA_CYCLES);
        self.regs.write(regs::CSTOR, tor::TWO_MEGA_CYCLES);
        self.regs.write(regs::CFG, cfg::FIFOMODE | cfg::FERRCTRL);
        self.regs.write(regs::MR, mr::PWSDIV_MAX | mr::CLKDIV_MASK);
        self.regs.write(regs::SDCR, 0);
        self.regs.write(regs::DMA, 0);
        self.regs.write(regs::CR, cr::MCIEN | cr::PWSEN);
    }

    /// Software reset, preserving the configuration registers.
    ///
    /// Clears every latched flag of the status register.
    pub fn reset(&mut self) {
        let mr = self.regs.read(regs::MR);
        let dtor = self.regs.read(regs::DTOR);
        let sdcr = self.regs.read(regs::SDCR);
        let cstor = self.regs.read(regs::CSTOR);
        let cfg = self.regs.read(regs::CFG);

        self.regs.write(regs::CR, cr::SWRST);

        self.regs.write(regs::MR, mr);
        self.regs.write(regs::DTOR, dtor);
        self.regs.write(regs::SDCR, sdcr);
        self.regs.write(regs::CSTOR, cstor);
        self.regs.write(regs::CFG, cfg);
        self.regs.write(regs::DMA, 0);
        self.regs.write(regs::CR, cr::MCIEN | cr::PWSEN);

        self.latched = Status::empty();
    }

    /// Disables the controller and its power save mode
    pub fn disable(&mut self) {
        self.regs.write(regs::CR, cr::MCIDIS | cr::PWSDIS);
    }

    /// Clock divider such that `mck / (2 * (div + 1)) <= speed`
    pub fn clock_divider(mck: Hertz, speed: Hertz) -> u8 {
        let twice = (u64::from(speed.raw()) * 2).max(1);
        let div = (u64::from(mck.raw()) + twice - 1) / twice;
        div.saturating_sub(1).min(u64::from(mr::CLKDIV_MASK)) as u8
    }

    /// Sets the card clock to at most `speed`. Returns the resulting clock.
    pub fn set_clock(&mut self, speed: Hertz) -> Hertz {
        let div = Self::clock_divider(self.mck, speed);
        self.regs.modify(regs::MR, |r| (r & !mr::CLKDIV_MASK) | u32::from(div));
        Hertz::from_raw(self.mck.raw() / (2 * (u32::from(div) + 1)))
    }

    /// Routes the controller to `slot` with the given bus width
    pub fn select(&mut self, slot: u8, width: Buswidth) {
        self.regs.write(
            regs::SDCR,
            (u32::from(slot) & sdcr::SDCSEL_MASK) | (width.sdcbus() << sdcr::SDCBUS_SHIFT),
        );
    }

    /// Enables or disables high speed timing on the bus
    pub fn set_high_speed(&mut self, enable: bool) {
        self.regs.modify(regs::CFG, |r| {
            if enable {
                r | cfg::HSMODE
            } else {
                r & !cfg::HSMODE
            }
        });
    }

    /// Reads the status register, latching any error flag it carries
    pub fn status(&mut self) -> Status {
        let sr = Status::from_bits_retain(self.regs.read(regs::SR));
        self.latched |= sr & Status::ERRORS;
        sr
    }

    /// Error flags latched since the last reset or [`take_latched`](Self::take_latched)
    pub fn latched(&self) -> Status {
        self.latched
    }

    /// Returns and clears the latched error flags
    pub fn take_latched(&mut self) -> Status {
        core::mem::replace(&mut self.latched, Status::empty())
    }

    /// Writes the argument and then the command register, which starts
    /// the command on the bus
    pub fn start_command(&mut self, cmdr: u32, arg: u32) {
        self.regs.write(regs::ARGR, arg);
        self.regs.write(regs::CMDR, cmdr);
    }

    /// Next word of the last response
    pub fn response(&mut self) -> u32 {
        self.regs.read(regs::RSPR)
    }

    /// Programs block length and count for the next data command.
    ///
    /// Block lengths that are not a multiple of 4 switch the controller to
    /// byte transfers.
    pub fn set_block(&mut self, length: u16, count: u16) {
        let force_byte = length % 4 != 0;
        self.regs.modify(regs::MR, |r| {
            let r = r | mr::RDPROOF | mr::WRPROOF;
            if force_byte {
                r | mr::FBYTE
            } else {
                r & !mr::FBYTE
            }
        });
        self.regs.write(
            regs::BLKR,
            (u32::from(length) << blkr::BLKLEN_SHIFT)
                | (u32::from(count) & blkr::BCNT_MASK),
        );
    }

    /// Block length programmed for the current data command
    pub fn block_length(&mut self) -> u16 {
        (self.regs.read(regs::BLKR) >> blkr::BLKLEN_SHIFT) as u16
    }

    /// `true` when the current block length forces byte transfers
    pub fn byte_mode(&mut self) -> bool {
        self.regs.read(regs::MR) & mr::FBYTE != 0
    }

    pub fn read_data(&mut self) -> u32 {
        self.regs.read(regs::RDR)
    }

    pub fn write_data(&mut self, word: u32) {
        self.regs.write(regs::TDR, word);
    }

    /// Hands the data FIFO over to the DMA controller
    pub fn enable_dma(&mut self, chunk: ChunkSize) {
        let chksize = match chunk {
            ChunkSize::One => dma::CHKSIZE_1,
            ChunkSize::Sixteen => dma::CHKSIZE_16,
        };
        self.regs.write(regs::DMA, dma::DMAEN | chksize);
    }

    /// Returns the data FIFO to the CPU
    pub fn disable_dma(&mut self) {
        self.regs.write(regs::DMA, 0);
    }

    /// Bus address of the FIFO aperture
    pub fn fifo_address(&self) -> usize {
        self.regs.address(regs::FIFO)
    }

    /// Peripheral bus clock
    pub fn mck(&self) -> Hertz {
        self.mck
    }

    /// Releases the register bank
    pub fn free(self) -> R {
        self.regs
    }
}
