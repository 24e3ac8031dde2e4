//! Register level simulation of the MCI, its DMA channel and cards, for
//! tests. Everything runs synchronously: a command completes during the
//! write to the command register and a DMA request completes during
//! `start`.

use std::cell::{Cell, RefCell, RefMut};
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::digital::v2::InputPin;

use crate::card::SECTOR_SIZE;
use crate::dma::{DmaChannel, DmaRequest, Direction, TransferWidth};
use crate::mci::{blkr, cfg, cmdr, cr, regs, Buswidth, Status};
use crate::mmio::RegisterAccess;
use crate::sdmmc::{Config, FixedLevel, Pins, Sdmmc, Slot};

/// Bus address the simulated MCI is mapped at
const MCI_BASE: usize = 0x4000_0000;

/// Plain bank of registers without side effects
#[derive(Clone, Default)]
pub struct RegisterFile(Rc<RefCell<HashMap<usize, u32>>>);

impl RegisterFile {
    pub fn get(&self, offset: usize) -> u32 {
        self.0.borrow().get(&offset).copied().unwrap_or(0)
    }
}

impl RegisterAccess for RegisterFile {
    fn read(&mut self, offset: usize) -> u32 {
        self.get(offset)
    }

    fn write(&mut self, offset: usize, value: u32) {
        self.0.borrow_mut().insert(offset, value);
    }

    fn address(&self, offset: usize) -> usize {
        offset
    }
}

/// Card families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Physical layer 1.x, byte addressed
    SdV1,
    /// Physical layer 2.00, standard capacity
    SdV2,
    SdHc,
    /// MMC system specification 3.x
    Mmc,
    /// MMC 4.x, sector addressed
    MmcV4Hc,
}

impl Kind {
    fn is_sd(self) -> bool {
        matches!(self, Kind::SdV1 | Kind::SdV2 | Kind::SdHc)
    }

    fn is_high_capacity(self) -> bool {
        matches!(self, Kind::SdHc | Kind::MmcV4Hc)
    }

    /// Sector count the driver is expected to find
    pub fn sectors(self) -> u32 {
        match self {
            Kind::SdV1 => 0x1D_4C00,
            Kind::SdV2 => 2001 << 9,
            Kind::SdHc => 15_160 * 1024,
            Kind::Mmc => 1001 << 9,
            Kind::MmcV4Hc => MMC_HC_SECTORS,
        }
    }
}

const MMC_HC_SECTORS: u32 = 0x00EE_0000;
const SD_RCA: u16 = 0xB368;
pub const CID: [u32; 4] = [0x0353_4453, 0x5530_3847, 0x8012_3456, 0x7801_3F00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Ready,
    Ident,
    Standby,
    Transfer,
    Data,
    Receive,
}

impl State {
    fn code(self) -> u32 {
        match self {
            State::Idle => 0,
            State::Ready => 1,
            State::Ident => 2,
            State::Standby => 3,
            State::Transfer => 4,
            State::Data => 5,
            State::Receive => 6,
        }
    }
}

/// A simulated card
pub struct SimCard {
    pub kind: Kind,
    state: State,
    rca: u16,
    app_cmd: bool,
    /// Operating condition polls answered with busy
    pub power_up_polls: u32,
    pub high_speed: bool,
    /// Accepts the SD high speed function
    pub supports_high_speed: bool,
    /// Leaves SWITCH_FUNC unanswered while still sending its status block
    pub switch_without_response: bool,
    pub bus_width: u8,
    block_len: u32,
    password: Vec<u8>,
    pub locked: bool,
    lock_failed: bool,
    sectors: HashMap<u32, [u8; SECTOR_SIZE]>,
    /// Argument of every data command, in order
    pub data_args: Vec<(u8, u32)>,
}

impl SimCard {
    pub fn new(kind: Kind) -> Self {
        SimCard {
            kind,
            state: State::Idle,
            rca: 0,
            app_cmd: false,
            power_up_polls: 3,
            high_speed: false,
            supports_high_speed: matches!(kind, Kind::SdV2 | Kind::SdHc),
            switch_without_response: false,
            bus_width: 1,
            block_len: SECTOR_SIZE as u32,
            password: Vec::new(),
            locked: false,
            lock_failed: false,
            sectors: HashMap::new(),
            data_args: Vec::new(),
        }
    }

    pub fn sector(&self, index: u32) -> [u8; SECTOR_SIZE] {
        self.sectors
            .get(&index)
            .copied()
            .unwrap_or([0; SECTOR_SIZE])
    }

    pub fn set_sector(&mut self, index: u32, data: [u8; SECTOR_SIZE]) {
        self.sectors.insert(index, data);
    }

    fn r1(&self) -> u32 {
        let mut r1 = (self.state.code() << 9) | (1 << 8);
        if self.locked {
            r1 |= 1 << 25;
        }
        if self.lock_failed {
            r1 |= 1 << 24;
        }
        if self.app_cmd {
            r1 |= 1 << 5;
        }
        r1
    }

    fn csd(&self) -> [u32; 4] {
        let mut fields: Vec<(u32, u32, u32)> = vec![(83, 80, 9), (25, 22, 9)];
        match self.kind {
            Kind::SdV1 => fields.extend([(127, 126, 0), (103, 96, 0x32), (73, 62, 3749), (49, 47, 7)]),
            Kind::SdV2 => fields.extend([(127, 126, 0), (103, 96, 0x32), (73, 62, 2000), (49, 47, 7)]),
            Kind::SdHc => {
                let tran_speed = if self.high_speed { 0x5A } else { 0x32 };
                fields.extend([(127, 126, 1), (103, 96, tran_speed), (69, 48, 15_159)]);
            }
            Kind::Mmc => fields.extend([
                (127, 126, 2),
                (125, 122, 3),
                (103, 96, 0x2A),
                (73, 62, 1000),
                (49, 47, 7),
            ]),
            Kind::MmcV4Hc => fields.extend([
                (127, 126, 3),
                (125, 122, 4),
                (103, 96, 0x32),
                (73, 62, 0xFFF),
                (49, 47, 7),
            ]),
        }
        let mut value = 0u128;
        for (msb, lsb, v) in fields {
            let width = msb - lsb + 1;
            let mask = ((1u128 << width) - 1) << lsb;
            value = (value & !mask) | ((u128::from(v) << lsb) & mask);
        }
        [
            (value >> 96) as u32,
            (value >> 64) as u32,
            (value >> 32) as u32,
            value as u32,
        ]
    }

    fn ext_csd(&self) -> Vec<u8> {
        let mut ext = vec![0u8; SECTOR_SIZE];
        ext[212..216].copy_from_slice(&MMC_HC_SECTORS.to_le_bytes());
        ext[196] = 0x03;
        ext
    }

    /// Sector index of a data command argument
    fn sector_of(&self, arg: u32) -> Option<u32> {
        if self.kind.is_high_capacity() {
            Some(arg)
        } else if arg % SECTOR_SIZE as u32 == 0 {
            Some(arg / SECTOR_SIZE as u32)
        } else {
            None
        }
    }

    fn apply_lock(&mut self, block: &[u8]) {
        let mode = block[0];
        let pwd = block.get(2..2 + usize::from(block.get(1).copied().unwrap_or(0)));
        let pwd = pwd.unwrap_or(&[]).to_vec();
        self.lock_failed = match mode {
            0x08 => {
                if self.locked {
                    self.sectors.clear();
                    self.password.clear();
                    self.locked = false;
                    false
                } else {
                    true
                }
            }
            0x01 => {
                if pwd.starts_with(&self.password) && pwd.len() > self.password.len() {
                    self.password = pwd[self.password.len()..].to_vec();
                    false
                } else {
                    true
                }
            }
            0x02 if !self.password.is_empty() && pwd == self.password => {
                self.password.clear();
                self.locked = false;
                false
            }
            0x04 if !self.password.is_empty() && pwd == self.password => {
                self.locked = true;
                false
            }
            0x00 if self.locked && pwd == self.password => {
                self.locked = false;
                false
            }
            _ => true,
        };
    }
}

/// Pending data phase
enum DataPhase {
    Read,
    Write {
        target: WriteTarget,
        expected: usize,
    },
}

enum WriteTarget {
    Sectors(u32),
    Lock,
}

/// Controller state shared by the register front end and the DMA channel
#[derive(Default)]
pub struct Bus {
    regs: HashMap<usize, u32>,
    pub cards: [Option<SimCard>; 2],
    response: VecDeque<u32>,
    /// Error flags cleared on status read
    errors: Status,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    phase: Option<DataPhase>,
    /// Every command as (opcode, argument)
    pub commands: Vec<(u8, u32)>,
    /// Raised with the next data phase
    pub inject_data_error: Option<Status>,
    /// Raised with the next command that expects a response
    pub inject_command_error: Option<Status>,
    /// Status reads left before NOTBUSY rises
    pub busy_polls: u32,
    /// Commands never complete
    pub stall_commands: bool,
    pub dma_requests: Vec<DmaRequest>,
    dma_enabled: bool,
    /// DMA requests stay enabled without moving data
    pub dma_stall: bool,
    pub resets: u32,
}

impl Bus {
    fn slot(&self) -> usize {
        (self.regs.get(&regs::SDCR).copied().unwrap_or(0) & 0x3) as usize
    }

    fn block(&self) -> (usize, usize) {
        let blkr = self.regs.get(&regs::BLKR).copied().unwrap_or(0);
        (
            (blkr >> blkr::BLKLEN_SHIFT) as usize,
            (blkr & blkr::BCNT_MASK) as usize,
        )
    }

    pub fn card(&mut self, slot: usize) -> &mut SimCard {
        self.cards[slot].as_mut().expect("no card in slot")
    }

    pub fn reg(&self, offset: usize) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn status(&mut self) -> Status {
        let mut sr = self.errors;
        if self.reg(regs::CFG) & cfg::FERRCTRL != 0 {
            self.errors = Status::empty();
        }
        if !self.stall_commands {
            sr |= Status::CMDRDY;
        }
        if self.busy_polls > 0 {
            self.busy_polls -= 1;
        } else {
            sr |= Status::NOTBUSY;
        }
        if !self.rx.is_empty() {
            sr |= Status::RXRDY;
        }
        match self.phase {
            Some(DataPhase::Write { expected, .. }) if self.tx.len() < expected => {
                sr |= Status::TXRDY
            }
            Some(DataPhase::Read) if !self.rx.is_empty() => {}
            _ => sr |= Status::XFRDONE,
        }
        sr
    }

    fn reset(&mut self) {
        self.resets += 1;
        self.errors = Status::empty();
        self.response.clear();
        self.rx.clear();
        self.tx.clear();
        self.phase = None;
    }

    fn command(&mut self, value: u32) {
        self.response.clear();
        if value & cmdr::SPCMD_INIT != 0 {
            return;
        }
        let opcode = (value & cmdr::CMDNB_MASK) as u8;
        let arg = self.reg(regs::ARGR);
        self.commands.push((opcode, arg));

        // The controller only watches for a response when told to expect one
        let expects_response = value & (3 << cmdr::RSPTYP_SHIFT) != cmdr::RSPTYP_NONE;
        if expects_response {
            if let Some(flags) = self.inject_command_error.take() {
                self.errors |= flags;
            }
        }

        let slot = self.slot();
        let (block_len, block_count) = self.block();
        let Some(card) = self.cards[slot].as_mut() else {
            if expects_response {
                self.errors |= Status::RTOE;
            }
            return;
        };

        let app = std::mem::replace(&mut card.app_cmd, false);
        let mut data: Option<Vec<u8>> = None;
        let mut write: Option<(WriteTarget, usize)> = None;

        let response: Result<Vec<u32>, Status> = match (app, opcode) {
            (_, 0) => {
                card.state = State::Idle;
                Ok(vec![])
            }
            (false, 1) if !card.kind.is_sd() => {
                let mut ocr = 0x00FF_8000;
                if card.power_up_polls > 0 {
                    card.power_up_polls -= 1;
                } else {
                    ocr |= 1 << 31;
                    if card.kind.is_high_capacity() {
                        ocr |= 1 << 30;
                    }
                    card.state = State::Ready;
                }
                Ok(vec![ocr])
            }
            (_, 2) if card.state == State::Ready => {
                card.state = State::Ident;
                Ok(CID.to_vec())
            }
            (false, 3) if card.state == State::Ident => {
                card.state = State::Standby;
                if card.kind.is_sd() {
                    card.rca = SD_RCA;
                    Ok(vec![u32::from(SD_RCA) << 16])
                } else {
                    card.rca = (arg >> 16) as u16;
                    Ok(vec![card.r1()])
                }
            }
            (true, 6) if card.kind.is_sd() => {
                card.bus_width = if arg & 0x3 == 2 { 4 } else { 1 };
                Ok(vec![card.r1()])
            }
            (false, 6) if card.kind.is_sd() && card.state == State::Transfer => {
                let mut status = vec![0u8; 64];
                status[16] = if card.supports_high_speed { 1 } else { 0 };
                if arg & (1 << 31) != 0 && card.supports_high_speed {
                    card.high_speed = true;
                }
                data = Some(status);
                if card.switch_without_response {
                    Err(Status::RTOE)
                } else {
                    Ok(vec![card.r1()])
                }
            }
            (false, 6) if !card.kind.is_sd() && card.state == State::Transfer => {
                let index = (arg >> 16) & 0xFF;
                let value = (arg >> 8) & 0xFF;
                match (index, value) {
                    (183, 1) => card.bus_width = 4,
                    (183, 2) => card.bus_width = 8,
                    (185, 1) => card.high_speed = true,
                    _ => {}
                }
                Ok(vec![card.r1()])
            }
            (false, 7) => {
                if arg >> 16 == u32::from(card.rca) && card.rca != 0 {
                    let r1 = card.r1();
                    card.state = State::Transfer;
                    Ok(vec![r1])
                } else {
                    card.state = State::Standby;
                    if arg == 0 {
                        Ok(vec![])
                    } else {
                        Err(Status::RTOE)
                    }
                }
            }
            (false, 8) if matches!(card.kind, Kind::SdV2 | Kind::SdHc) => Ok(vec![arg & 0xFFF]),
            (false, 8) if card.kind == Kind::MmcV4Hc && card.state == State::Transfer => {
                data = Some(card.ext_csd());
                Ok(vec![card.r1()])
            }
            (false, 9) if card.state == State::Standby => Ok(card.csd().to_vec()),
            (false, 12) => {
                card.state = State::Transfer;
                Ok(vec![card.r1()])
            }
            (false, 13) if arg >> 16 == u32::from(card.rca) => Ok(vec![card.r1()]),
            (false, 16) => {
                card.block_len = arg;
                Ok(vec![card.r1()])
            }
            (false, 17 | 18 | 24 | 25) if card.state == State::Transfer => {
                card.data_args.push((opcode, arg));
                let count = if matches!(opcode, 17 | 24) { 1 } else { block_count };
                let start = card.sector_of(arg);
                let in_range = start
                    .map(|s| u64::from(s) + count as u64 <= u64::from(card.kind.sectors()))
                    .unwrap_or(false);
                if card.locked {
                    Ok(vec![card.r1() | (1 << 22)])
                } else if start.is_none() {
                    Ok(vec![card.r1() | (1 << 30)])
                } else if !in_range {
                    Ok(vec![card.r1() | (1 << 31)])
                } else {
                    let r1 = card.r1();
                    let start = start.unwrap_or(0);
                    if opcode == 17 || opcode == 18 {
                        let mut bytes = Vec::new();
                        for s in start..start + count as u32 {
                            bytes.extend_from_slice(&card.sector(s));
                        }
                        data = Some(bytes);
                        card.state = if opcode == 17 { State::Transfer } else { State::Data };
                    } else {
                        write = Some((WriteTarget::Sectors(start), count * SECTOR_SIZE));
                        card.state = State::Receive;
                    }
                    Ok(vec![r1])
                }
            }
            (false, 42) if card.state == State::Transfer => {
                write = Some((WriteTarget::Lock, block_len));
                Ok(vec![card.r1()])
            }
            (false, 55) => {
                card.app_cmd = true;
                Ok(vec![card.r1()])
            }
            (true, 41) if card.kind.is_sd() => {
                let mut ocr = 0x00FF_8000;
                if card.power_up_polls > 0 {
                    card.power_up_polls -= 1;
                } else {
                    ocr |= 1 << 31;
                    if card.kind == Kind::SdHc && arg & (1 << 30) != 0 {
                        ocr |= 1 << 30;
                    }
                    card.state = State::Ready;
                }
                Ok(vec![ocr])
            }
            _ => Err(Status::RTOE),
        };

        // R3 frames carry no CRC, the controller always flags them
        if matches!(opcode, 1 | 41) && response.is_ok() {
            self.errors |= Status::RCRCE;
        }
        match response {
            Ok(words) => self.response.extend(words),
            Err(flags) if expects_response => self.errors |= flags,
            Err(_) => {}
        }

        if let Some(bytes) = data {
            self.rx = bytes.into();
            self.phase = Some(DataPhase::Read);
            self.start_data_phase();
        } else if let Some((target, expected)) = write {
            self.tx.clear();
            self.phase = Some(DataPhase::Write { target, expected });
            self.start_data_phase();
        }
    }

    fn start_data_phase(&mut self) {
        if let Some(flags) = self.inject_data_error.take() {
            self.errors |= flags;
        }
    }

    /// Discards what the card sent and the host has not read yet
    pub fn drain_rx(&mut self) {
        self.rx.clear();
    }

    fn pop_rx(&mut self, bytes: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(bytes);
        for _ in 0..bytes {
            out.push(self.rx.pop_front().unwrap_or(0));
        }
        out
    }

    fn push_tx(&mut self, bytes: &[u8]) {
        let Some(DataPhase::Write { expected, .. }) = self.phase else {
            return;
        };
        let room = expected.saturating_sub(self.tx.len());
        self.tx.extend_from_slice(&bytes[..bytes.len().min(room)]);
        if self.tx.len() == expected {
            self.commit();
        }
    }

    fn commit(&mut self) {
        let Some(DataPhase::Write { target, .. }) = self.phase.take() else {
            return;
        };
        let slot = self.slot();
        let tx = std::mem::take(&mut self.tx);
        let Some(card) = self.cards[slot].as_mut() else {
            return;
        };
        match target {
            WriteTarget::Sectors(start) => {
                for (i, chunk) in tx.chunks(SECTOR_SIZE).enumerate() {
                    let mut sector = [0u8; SECTOR_SIZE];
                    sector.copy_from_slice(chunk);
                    card.set_sector(start + i as u32, sector);
                }
                if card.data_args.last().map_or(false, |&(op, _)| op == 24) {
                    card.state = State::Transfer;
                }
            }
            WriteTarget::Lock => card.apply_lock(&tx),
        }
    }

    fn byte_mode(&self) -> bool {
        self.reg(regs::MR) & crate::mci::mr::FBYTE != 0
    }
}

/// Register front end of the simulated MCI
#[derive(Clone)]
pub struct SimMci(pub Rc<RefCell<Bus>>);

impl RegisterAccess for SimMci {
    fn read(&mut self, offset: usize) -> u32 {
        let mut bus = self.0.borrow_mut();
        match offset {
            regs::SR => bus.status().bits(),
            regs::RSPR => bus.response.pop_front().unwrap_or(0),
            regs::RDR if bus.byte_mode() => u32::from(bus.pop_rx(1)[0]),
            regs::RDR => {
                let bytes = bus.pop_rx(4);
                u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            }
            _ => bus.reg(offset),
        }
    }

    fn write(&mut self, offset: usize, value: u32) {
        let mut bus = self.0.borrow_mut();
        match offset {
            regs::CR if value & cr::SWRST != 0 => bus.reset(),
            regs::CMDR => bus.command(value),
            // FBYTE narrows every FIFO access to its low byte
            regs::TDR if bus.byte_mode() => bus.push_tx(&[value as u8]),
            regs::TDR => bus.push_tx(&value.to_ne_bytes()),
            _ => {
                bus.regs.insert(offset, value);
            }
        }
    }

    fn address(&self, offset: usize) -> usize {
        MCI_BASE + offset
    }
}

/// DMA channel wired to the simulated MCI FIFO
#[derive(Clone)]
pub struct SimDma(pub Rc<RefCell<Bus>>);

impl DmaChannel for SimDma {
    unsafe fn start(&mut self, request: &DmaRequest) {
        let mut bus = self.0.borrow_mut();
        assert_eq!(request.peripheral, MCI_BASE + regs::FIFO);
        assert!(request.items <= DmaRequest::MAX_ITEMS);
        if request.width == TransferWidth::Word {
            assert_eq!(request.memory % 4, 0);
            assert!(!bus.byte_mode());
        }
        bus.dma_requests.push(*request);
        bus.dma_enabled = true;
        if bus.dma_stall {
            return;
        }
        let len = request.bytes();
        match request.direction {
            Direction::PeripheralToMemory => {
                let bytes = bus.pop_rx(len);
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), request.memory as *mut u8, len);
            }
            Direction::MemoryToPeripheral => {
                let bytes = std::slice::from_raw_parts(request.memory as *const u8, len).to_vec();
                bus.push_tx(&bytes);
            }
        }
        bus.dma_enabled = false;
    }

    fn is_enabled(&mut self) -> bool {
        self.0.borrow().dma_enabled
    }

    fn disable(&mut self) {
        self.0.borrow_mut().dma_enabled = false;
    }
}

/// Input pin driven by the test
#[derive(Clone, Default)]
pub struct SimPin(Rc<Cell<bool>>);

impl SimPin {
    pub fn set(&self, high: bool) {
        self.0.set(high);
    }
}

impl InputPin for SimPin {
    type Error = Infallible;

    fn is_high(&self) -> Result<bool, Self::Error> {
        Ok(self.0.get())
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        Ok(!self.0.get())
    }
}

/// Delay provider that only accounts for the time asked for
#[derive(Clone, Default)]
pub struct SimDelay(pub Rc<Cell<u64>>);

impl DelayUs<u32> for SimDelay {
    fn delay_us(&mut self, us: u32) {
        self.0.set(self.0.get() + u64::from(us));
    }
}

pub type SimPins = Pins<SimPin, SimPin, FixedLevel>;
pub type TestSdmmc = Sdmmc<SimMci, SimDma, SimDelay, SimPins, 2>;

/// Test harness around a two slot driver. Slot 0 is wired for 4 data
/// lines, slot 1 for a single one.
pub struct Bench {
    pub bus: Rc<RefCell<Bus>>,
    card_detect: [SimPin; 2],
    write_protect: [SimPin; 2],
    pub elapsed: Rc<Cell<u64>>,
}

impl Bench {
    pub fn new(config: Config) -> (TestSdmmc, Bench) {
        let bus = Rc::new(RefCell::new(Bus::default()));
        let delay = SimDelay::default();
        let card_detect = [SimPin::default(), SimPin::default()];
        let write_protect = [SimPin::default(), SimPin::default()];
        // Card detect switches close to ground
        card_detect[0].set(true);
        card_detect[1].set(true);

        let slot = |i: usize, width| {
            Slot::new(
                Pins::new(card_detect[i].clone(), write_protect[i].clone(), FixedLevel::high()),
                width,
            )
        };
        let slots = [slot(0, Buswidth::Four), slot(1, Buswidth::One)];
        let sdmmc = Sdmmc::new(
            SimMci(bus.clone()),
            SimDma(bus.clone()),
            delay.clone(),
            crate::time::Hertz::MHz(60),
            slots,
            config,
        );
        let bench = Bench {
            bus,
            card_detect,
            write_protect,
            elapsed: delay.0,
        };
        (sdmmc, bench)
    }

    pub fn bus(&self) -> RefMut<'_, Bus> {
        self.bus.borrow_mut()
    }

    pub fn insert(&self, slot: usize, card: SimCard) {
        self.bus().cards[slot] = Some(card);
        self.card_detect[slot].set(false);
    }

    pub fn remove(&self, slot: usize) {
        self.bus().cards[slot] = None;
        self.card_detect[slot].set(true);
    }

    pub fn set_write_protect(&self, slot: usize, engaged: bool) {
        self.write_protect[slot].set(engaged);
    }

    pub fn card_bus_width(&self, slot: usize) -> u8 {
        self.bus().card(slot).bus_width
    }
}
