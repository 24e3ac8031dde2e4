//! # Direct Memory Access
//!
//! The block transfer engine hands data phases to a [`DmaChannel`]. Each
//! request is programmed from scratch (addresses, transfer width, burst
//! length) and the channel is otherwise idle.
//!
//! [`Dmaca`] drives one channel of the DMACA controller that sits next to
//! the MCI, using hardware handshaking on the MCI request lines.

use crate::mmio::RegisterAccess;

/// Direction of a DMA request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    PeripheralToMemory,
    MemoryToPeripheral,
}

/// Size of one transferred item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferWidth {
    Byte,
    Word,
}

impl TransferWidth {
    /// Bytes per item
    pub fn bytes(self) -> usize {
        match self {
            TransferWidth::Byte => 1,
            TransferWidth::Word => 4,
        }
    }
}

/// Items per burst transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BurstSize {
    One,
    Four,
    Eight,
    Sixteen,
}

impl BurstSize {
    fn msize(self) -> u32 {
        match self {
            BurstSize::One => 0,
            BurstSize::Four => 1,
            BurstSize::Eight => 2,
            BurstSize::Sixteen => 3,
        }
    }
}

/// One block transfer between memory and a peripheral FIFO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRequest {
    pub direction: Direction,
    /// Bus address of the memory buffer
    pub memory: usize,
    /// Bus address of the peripheral FIFO. Not incremented.
    pub peripheral: usize,
    pub width: TransferWidth,
    pub burst: BurstSize,
    /// Number of items of `width`
    pub items: u16,
}

impl DmaRequest {
    /// Largest item count a single request can carry
    pub const MAX_ITEMS: u16 = 4095;

    /// Length of the memory region covered by the request
    pub fn bytes(&self) -> usize {
        usize::from(self.items) * self.width.bytes()
    }
}

/// A DMA channel that can carry one request at a time
pub trait DmaChannel {
    /// Programs the channel with `request` and enables it.
    ///
    /// # Safety
    ///
    /// The memory region described by `request` must stay valid, and must
    /// not be accessed by anything else, until [`is_enabled`] returns
    /// `false` or [`disable`] has been called.
    ///
    /// [`is_enabled`]: DmaChannel::is_enabled
    /// [`disable`]: DmaChannel::disable
    unsafe fn start(&mut self, request: &DmaRequest);

    /// `true` while the channel is still moving data
    fn is_enabled(&mut self) -> bool;

    /// Stops the channel. Any data in flight is lost.
    fn disable(&mut self);
}

/// Hardware handshaking interfaces of the MCI on the DMA controller.
///
/// These are device specific, see the peripheral identifier table of the
/// DMACA chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// MCI receive request line
    pub rx: u8,
    /// MCI transmit request line
    pub tx: u8,
}

mod regs {
    pub const CHANNEL_STRIDE: usize = 0x58;
    pub const SAR: usize = 0x00;
    pub const DAR: usize = 0x08;
    pub const LLP: usize = 0x10;
    pub const CTL_L: usize = 0x18;
    pub const CTL_H: usize = 0x1C;
    pub const CFG_L: usize = 0x40;
    pub const CFG_H: usize = 0x44;
    pub const DMACFGREG: usize = 0x398;
    pub const CHENREG: usize = 0x3A0;

    pub const CTL_DST_TR_WIDTH_SHIFT: u32 = 1;
    pub const CTL_SRC_TR_WIDTH_SHIFT: u32 = 4;
    pub const CTL_DINC_SHIFT: u32 = 7;
    pub const CTL_SINC_SHIFT: u32 = 9;
    pub const CTL_DST_MSIZE_SHIFT: u32 = 11;
    pub const CTL_SRC_MSIZE_SHIFT: u32 = 14;
    pub const CTL_TT_FC_SHIFT: u32 = 20;
    pub const CTL_DMS_SHIFT: u32 = 23;
    pub const CTL_SMS_SHIFT: u32 = 25;

    pub const INC_NO_CHANGE: u32 = 2;
    pub const TT_FC_M2P: u32 = 1;
    pub const TT_FC_P2M: u32 = 2;
    /// Master interface used for memory accesses
    pub const MEMORY_MASTER: u32 = 1;

    pub const CFG_H_SRC_PER_SHIFT: u32 = 7;
    pub const CFG_H_DEST_PER_SHIFT: u32 = 11;

    pub const CHENREG_WE_SHIFT: u32 = 8;
}

/// One channel of the DMACA controller
pub struct Dmaca<R> {
    regs: R,
    channel: u8,
    handshake: Handshake,
}

impl<R: RegisterAccess> Dmaca<R> {
    /// Takes channel `channel` of the controller and enables the
    /// controller.
    pub fn new(mut regs: R, channel: u8, handshake: Handshake) -> Self {
        regs.write(regs::DMACFGREG, 1);
        Dmaca {
            regs,
            channel,
            handshake,
        }
    }

    fn channel_reg(&self, offset: usize) -> usize {
        usize::from(self.channel) * regs::CHANNEL_STRIDE + offset
    }

    fn enable_mask(&self) -> u32 {
        1 << self.channel
    }

    /// Control register, low word, for `request`
    fn ctl_low(request: &DmaRequest) -> u32 {
        let width = match request.width {
            TransferWidth::Byte => 0,
            TransferWidth::Word => 2,
        };
        let msize = request.burst.msize();
        let (tt_fc, sinc, dinc, sms, dms) = match request.direction {
            Direction::PeripheralToMemory => (
                regs::TT_FC_P2M,
                regs::INC_NO_CHANGE,
                0,
                0,
                regs::MEMORY_MASTER,
            ),
            Direction::MemoryToPeripheral => (
                regs::TT_FC_M2P,
                0,
                regs::INC_NO_CHANGE,
                regs::MEMORY_MASTER,
                0,
            ),
        };
        (width << regs::CTL_DST_TR_WIDTH_SHIFT)
            | (width << regs::CTL_SRC_TR_WIDTH_SHIFT)
            | (dinc << regs::CTL_DINC_SHIFT)
            | (sinc << regs::CTL_SINC_SHIFT)
            | (msize << regs::CTL_DST_MSIZE_SHIFT)
            | (msize << regs::CTL_SRC_MSIZE_SHIFT)
            | (tt_fc << regs::CTL_TT_FC_SHIFT)
            | (dms << regs::CTL_DMS_SHIFT)
            | (sms << regs::CTL_SMS_SHIFT)
    }

    /// Releases the register bank
    pub fn free(self) -> R {
        self.regs
    }
}

impl<R: RegisterAccess> DmaChannel for Dmaca<R> {
    unsafe fn start(&mut self, request: &DmaRequest) {
        debug_assert!(request.items <= DmaRequest::MAX_ITEMS);

        let (sar, dar, cfg_h) = match request.direction {
            Direction::PeripheralToMemory => (
                request.peripheral,
                request.memory,
                u32::from(self.handshake.rx) << regs::CFG_H_SRC_PER_SHIFT,
            ),
            Direction::MemoryToPeripheral => (
                request.memory,
                request.peripheral,
                u32::from(self.handshake.tx) << regs::CFG_H_DEST_PER_SHIFT,
            ),
        };

        let llp = self.channel_reg(regs::LLP);
        let sar_reg = self.channel_reg(regs::SAR);
        let dar_reg = self.channel_reg(regs::DAR);
        let ctl_l = self.channel_reg(regs::CTL_L);
        let ctl_h = self.channel_reg(regs::CTL_H);
        let cfg_l = self.channel_reg(regs::CFG_L);
        let cfg_h_reg = self.channel_reg(regs::CFG_H);

        self.regs.write(llp, 0);
        // Bus addresses are 32 bits wide on this controller
        self.regs.write(sar_reg, sar as u32);
        self.regs.write(dar_reg, dar as u32);
        self.regs.write(ctl_l, Self::ctl_low(request));
        self.regs.write(ctl_h, u32::from(request.items));
        // Hardware handshaking on both sides
        self.regs.write(cfg_l, 0);
        self.regs.write(cfg_h_reg, cfg_h);

        let mask = self.enable_mask();
        self.regs.write(regs::CHENREG, mask | (mask << regs::CHENREG_WE_SHIFT));
    }

    fn is_enabled(&mut self) -> bool {
        self.regs.read(regs::CHENREG) & self.enable_mask() != 0
    }

    fn disable(&mut self) {
        let mask = self.enable_mask();
        self.regs.write(regs::CHENREG, mask << regs::CHENREG_WE_SHIFT);
    }
}
