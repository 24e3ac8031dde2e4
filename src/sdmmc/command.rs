//! Command engine

use embedded_hal::blocking::delay::DelayUs;

use super::{BusyDetect, Error, Sdmmc, SlotPins};
use crate::dma::DmaChannel;
use crate::mci::{cmdr, Status};
use crate::mmio::RegisterAccess;
use crate::time::Deadline;

/// Response format expected from the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResponseKind {
    None,
    /// Card status
    R1,
    /// Card status, then busy on DAT0
    R1b,
    /// CID or CSD
    R2,
    /// OCR, without CRC
    R3,
    /// Published RCA
    R6,
    /// Interface condition
    R7,
}

impl ResponseKind {
    fn rsptyp(self) -> u32 {
        match self {
            ResponseKind::None => cmdr::RSPTYP_NONE,
            ResponseKind::R1b => cmdr::RSPTYP_R1B,
            ResponseKind::R2 => cmdr::RSPTYP_136,
            _ => cmdr::RSPTYP_48,
        }
    }

    /// The R3 frame carries all ones in place of a CRC
    fn has_crc(self) -> bool {
        !matches!(self, ResponseKind::None | ResponseKind::R3)
    }
}

/// A command as sent on the CMD line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub opcode: u8,
    pub arg: u32,
    pub response: ResponseKind,
    /// Special command and data transfer fields of the command register
    flags: u32,
    /// A missing response is not an error
    timeout_tolerated: bool,
}

impl Command {
    /// A command without data phase
    pub const fn new(opcode: u8, arg: u32, response: ResponseKind) -> Self {
        Command {
            opcode,
            arg,
            response,
            flags: cmdr::MAXLAT,
            timeout_tolerated: false,
        }
    }

    const fn with(mut self, flags: u32) -> Self {
        self.flags |= flags;
        self
    }

    const fn open_drain(self) -> Self {
        self.with(cmdr::OPDCMD)
    }

    const fn read_single(self) -> Self {
        self.with(cmdr::TRCMD_START | cmdr::TRDIR_READ | cmdr::TRTYP_SINGLE)
    }

    const fn read_multiple(self) -> Self {
        self.with(cmdr::TRCMD_START | cmdr::TRDIR_READ | cmdr::TRTYP_MULTIPLE)
    }

    const fn write_single(self) -> Self {
        self.with(cmdr::TRCMD_START | cmdr::TRTYP_SINGLE)
    }

    const fn write_multiple(self) -> Self {
        self.with(cmdr::TRCMD_START | cmdr::TRTYP_MULTIPLE)
    }

    /// Accept a response timeout. Some cards never answer SWITCH_FUNC
    /// while still sending its status block.
    pub(crate) const fn tolerate_timeout(mut self) -> Self {
        self.timeout_tolerated = true;
        self
    }

    /// `true` if the command starts a data phase
    pub fn has_data(&self) -> bool {
        self.flags & cmdr::TRCMD_START != 0
    }

    /// Command register value
    fn cmdr(&self) -> u32 {
        (u32::from(self.opcode) & cmdr::CMDNB_MASK) | self.response.rsptyp() | self.flags
    }
}

/// Commands used by the driver
pub mod cmd {
    use super::{Command, ResponseKind};
    use crate::mci::cmdr;

    /// 74 clock cycles of initialization sequence
    pub const fn init_clocks() -> Command {
        Command {
            opcode: 0,
            arg: 0,
            response: ResponseKind::None,
            flags: cmdr::SPCMD_INIT | cmdr::OPDCMD,
            timeout_tolerated: false,
        }
    }

    /// CMD0: GO_IDLE_STATE
    pub const fn go_idle() -> Command {
        Command::new(0, 0, ResponseKind::None).open_drain()
    }

    /// CMD1: SEND_OP_COND (MMC)
    pub const fn mmc_send_op_cond(ocr: u32) -> Command {
        Command::new(1, ocr, ResponseKind::R3).open_drain()
    }

    /// CMD2: ALL_SEND_CID
    pub const fn all_send_cid() -> Command {
        Command::new(2, 0, ResponseKind::R2).open_drain()
    }

    /// CMD3: SET_RELATIVE_ADDR (MMC)
    pub const fn mmc_set_relative_address(rca: u16) -> Command {
        Command::new(3, (rca as u32) << 16, ResponseKind::R1).open_drain()
    }

    /// CMD3: SEND_RELATIVE_ADDR (SD)
    pub const fn sd_send_relative_address() -> Command {
        Command::new(3, 0, ResponseKind::R6)
    }

    /// CMD6: SWITCH (MMC)
    pub const fn mmc_switch(arg: u32) -> Command {
        Command::new(6, arg, ResponseKind::R1b)
    }

    /// CMD6: SWITCH_FUNC (SD). Returns a 64 byte status block.
    pub const fn sd_switch_function(arg: u32) -> Command {
        Command::new(6, arg, ResponseKind::R1).read_single()
    }

    /// CMD7: SELECT_CARD
    pub const fn select_card(rca: u16) -> Command {
        Command::new(7, (rca as u32) << 16, ResponseKind::R1b)
    }

    /// CMD7 with address 0: the selected card goes back to stand-by
    pub const fn deselect_card() -> Command {
        Command::new(7, 0, ResponseKind::None)
    }

    /// CMD8: SEND_IF_COND (SD)
    pub const fn send_if_cond(arg: u32) -> Command {
        Command::new(8, arg, ResponseKind::R7)
    }

    /// CMD8: SEND_EXT_CSD (MMC). Returns a 512 byte block.
    pub const fn mmc_send_ext_csd() -> Command {
        Command::new(8, 0, ResponseKind::R1).read_single()
    }

    /// CMD9: SEND_CSD
    pub const fn send_csd(rca: u16) -> Command {
        Command::new(9, (rca as u32) << 16, ResponseKind::R2)
    }

    /// CMD12: STOP_TRANSMISSION. The card is busy after a write.
    pub const fn stop_transmission(after_write: bool) -> Command {
        let response = if after_write {
            ResponseKind::R1b
        } else {
            ResponseKind::R1
        };
        Command::new(12, 0, response).with(cmdr::TRCMD_STOP)
    }

    /// CMD13: SEND_STATUS
    pub const fn send_status(rca: u16) -> Command {
        Command::new(13, (rca as u32) << 16, ResponseKind::R1)
    }

    /// CMD16: SET_BLOCKLEN
    pub const fn set_block_len(len: u32) -> Command {
        Command::new(16, len, ResponseKind::R1)
    }

    /// CMD17: READ_SINGLE_BLOCK
    pub const fn read_single_block(addr: u32) -> Command {
        Command::new(17, addr, ResponseKind::R1).read_single()
    }

    /// CMD18: READ_MULTIPLE_BLOCK
    pub const fn read_multiple_blocks(addr: u32) -> Command {
        Command::new(18, addr, ResponseKind::R1).read_multiple()
    }

    /// CMD24: WRITE_BLOCK
    pub const fn write_single_block(addr: u32) -> Command {
        Command::new(24, addr, ResponseKind::R1).write_single()
    }

    /// CMD25: WRITE_MULTIPLE_BLOCK
    pub const fn write_multiple_blocks(addr: u32) -> Command {
        Command::new(25, addr, ResponseKind::R1).write_multiple()
    }

    /// CMD42: LOCK_UNLOCK. The data block length is set with CMD16.
    pub const fn lock_unlock() -> Command {
        Command::new(42, 0, ResponseKind::R1).write_single()
    }

    /// CMD55: APP_CMD
    pub const fn app_cmd(rca: u16) -> Command {
        Command::new(55, (rca as u32) << 16, ResponseKind::R1)
    }

    /// ACMD6: SET_BUS_WIDTH
    pub const fn set_bus_width(four_bit: bool) -> Command {
        Command::new(6, if four_bit { 2 } else { 0 }, ResponseKind::R1)
    }

    /// ACMD41: SD_SEND_OP_COND
    pub const fn sd_send_op_cond(arg: u32) -> Command {
        Command::new(41, arg, ResponseKind::R3)
    }
}

/// Response words of a completed command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Response {
    None,
    Short(u32),
    /// Most significant word first
    Long([u32; 4]),
}

impl Response {
    /// The 32-bit response, or the top word of a long response
    pub fn word(&self) -> u32 {
        match self {
            Response::None => 0,
            Response::Short(w) => *w,
            Response::Long(w) => w[0],
        }
    }

    pub fn words(&self) -> [u32; 4] {
        match self {
            Response::Long(w) => *w,
            _ => [self.word(), 0, 0, 0],
        }
    }
}

/// Failed command, with every error flag the controller raised for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandError {
    pub opcode: u8,
    /// Error flags of the status register. Empty when the controller never
    /// signalled completion.
    pub status: Status,
}

impl CommandError {
    /// `true` if the command did not complete within its time budget
    pub fn timed_out(&self) -> bool {
        self.status.is_empty()
    }
}

impl From<CommandError> for Error {
    fn from(err: CommandError) -> Self {
        status_error(err.status).unwrap_or(Error::SoftwareTimeout)
    }
}

/// First error among `status`, in order of significance
pub(crate) fn status_error(status: Status) -> Option<Error> {
    const ERRORS: [(Status, Error); 10] = [
        (Status::RTOE, Error::ResponseTimeout),
        (Status::RCRCE, Error::ResponseCrc),
        (Status::RINDE, Error::ResponseIndex),
        (Status::RENDE, Error::ResponseEndBit),
        (Status::RDIRE, Error::ResponseDirection),
        (Status::CSTOE, Error::CompletionTimeout),
        (Status::DTOE, Error::DataTimeout),
        (Status::DCRCE, Error::DataCrc),
        (Status::OVRE, Error::Overrun),
        (Status::UNRE, Error::Underrun),
    ];
    ERRORS
        .iter()
        .find(|(flag, _)| status.contains(*flag))
        .map(|(_, err)| *err)
}

impl<MCI, DMA, DELAY, PINS, const N: usize> Sdmmc<MCI, DMA, DELAY, PINS, N>
where
    MCI: RegisterAccess,
    DMA: DmaChannel,
    DELAY: DelayUs<u32>,
    PINS: SlotPins,
{
    /// Sends `cmd` to the card in `slot` and returns its response.
    ///
    /// Commands with a data phase are rejected, use a
    /// [`Transfer`](super::Transfer) for those.
    pub fn send_command(&mut self, slot: usize, cmd: Command) -> Result<Response, Error> {
        self.check_slot(slot)?;
        if cmd.has_data() {
            return Err(Error::UnexpectedState);
        }
        self.select_slot(slot);
        self.command(&cmd)
    }

    /// Runs `cmd` on the selected slot, including the busy period of R1b
    /// commands
    pub(crate) fn command(&mut self, cmd: &Command) -> Result<Response, Error> {
        let response = self.exec_command(cmd)?;
        if cmd.response == ResponseKind::R1b {
            self.wait_not_busy()?;
        }
        Ok(response)
    }

    /// Issues `cmd` and collects its response.
    ///
    /// On error the controller is reset, which also clears the latched
    /// status.
    pub(crate) fn exec_command(&mut self, cmd: &Command) -> Result<Response, CommandError> {
        self.mci.take_latched();
        self.mci.start_command(cmd.cmdr(), cmd.arg);

        let mut seen = Status::empty();
        let mut deadline = Deadline::new(self.config.command_timeout);
        loop {
            let sr = self.mci.status();
            seen |= sr;
            if sr.contains(Status::CMDRDY) {
                break;
            }
            if !deadline.tick(&mut self.delay) {
                log::warn!("CMD{}: no completion", cmd.opcode);
                self.mci.reset();
                return Err(CommandError {
                    opcode: cmd.opcode,
                    status: Status::empty(),
                });
            }
        }

        let mut errors = seen & Status::COMMAND_ERRORS;
        if !cmd.response.has_crc() {
            errors.remove(Status::RCRCE);
        }
        if cmd.timeout_tolerated && errors.contains(Status::RTOE) {
            log::warn!("CMD{}: response timeout ignored", cmd.opcode);
            errors.remove(Status::RTOE);
        }
        if !errors.is_empty() {
            log::debug!("CMD{} ({:#010x}) failed: {:?}", cmd.opcode, cmd.arg, errors);
            self.mci.reset();
            return Err(CommandError {
                opcode: cmd.opcode,
                status: errors,
            });
        }
        log::trace!("CMD{} ({:#010x})", cmd.opcode, cmd.arg);

        let response = match cmd.response {
            ResponseKind::None => Response::None,
            ResponseKind::R2 => {
                let mut words = [0; 4];
                for word in words.iter_mut() {
                    *word = self.mci.response();
                }
                Response::Long(words)
            }
            _ => Response::Short(self.mci.response()),
        };
        Ok(response)
    }

    /// Sends CMD55 then the application command `acmd`
    pub(crate) fn app_command(&mut self, rca: u16, acmd: &Command) -> Result<Response, Error> {
        self.command(&cmd::app_cmd(rca))?;
        self.command(acmd)
    }

    /// Waits until the selected card releases DAT0
    pub(crate) fn wait_not_busy(&mut self) -> Result<(), Error> {
        let mut deadline = Deadline::new(self.config.busy_timeout);
        loop {
            let ready = match self.config.busy_detect {
                BusyDetect::Status => self.mci.status().contains(Status::NOTBUSY),
                BusyDetect::Data0Line => self.slots[self.selected].pins.data0_high(),
            };
            if ready {
                return Ok(());
            }
            if !deadline.tick(&mut self.delay) {
                log::warn!("slot {}: card stuck busy", self.selected);
                return Err(Error::SoftwareTimeout);
            }
        }
    }
}
