//! Block transfers
//!
//! A [`Transfer`] is the window between the data command and its closing
//! stop. It mutably borrows the driver, so no other command can be issued
//! and no second transfer can be opened while it is alive. Data moves
//! through the FIFO word by word ([`Transfer::read_word`],
//! [`Transfer::write_word`] and the byte slice helpers built on them) or
//! through the DMA channel.
//!
//! Each operation counts the bytes it moves. [`Transfer::close`] fails
//! with [`Error::IncompleteTransfer`] unless exactly the requested number
//! of bytes went through.

use core::marker::PhantomData;

use embedded_dma::{ReadBuffer, WriteBuffer};
use embedded_hal::blocking::delay::DelayUs;

use super::command::status_error;
use super::{cmd, Command, DataPath, Error, Sdmmc, SlotPins};
use crate::card::{R1, SECTOR_SIZE};
use crate::dma::{BurstSize, DmaChannel, DmaRequest, Direction, TransferWidth};
use crate::mci::{ChunkSize, Status};
use crate::mmio::RegisterAccess;
use crate::time::Deadline;

mod sealed {
    pub trait Sealed {}
}

/// Direction of a [`Transfer`]
pub trait TransferDirection: sealed::Sealed {
    #[doc(hidden)]
    const WRITE: bool;
}

/// Card to host
#[derive(Debug)]
pub struct Read;
/// Host to card
#[derive(Debug)]
pub struct Write;

impl sealed::Sealed for Read {}
impl sealed::Sealed for Write {}

impl TransferDirection for Read {
    const WRITE: bool = false;
}

impl TransferDirection for Write {
    const WRITE: bool = true;
}

/// DMA request in flight, returned by `start_dma`
#[must_use = "the buffer is only returned by `wait_dma`"]
pub struct DmaToken<B> {
    buffer: B,
    bytes: usize,
}

/// Open data transfer on one slot
pub struct Transfer<'a, MCI, DMA, DELAY, PINS, D, const N: usize>
where
    MCI: RegisterAccess,
    DMA: DmaChannel,
    DELAY: DelayUs<u32>,
    PINS: SlotPins,
    D: TransferDirection,
{
    sdmmc: &'a mut Sdmmc<MCI, DMA, DELAY, PINS, N>,
    slot: usize,
    blocks: u16,
    total: usize,
    moved: usize,
    closed: bool,
    _direction: PhantomData<D>,
}

impl<MCI, DMA, DELAY, PINS, const N: usize> Sdmmc<MCI, DMA, DELAY, PINS, N>
where
    MCI: RegisterAccess,
    DMA: DmaChannel,
    DELAY: DelayUs<u32>,
    PINS: SlotPins,
{
    /// Opens a read of `count` sectors starting at sector `start`
    pub fn open_read(
        &mut self,
        slot: usize,
        start: u32,
        count: u16,
    ) -> Result<Transfer<'_, MCI, DMA, DELAY, PINS, Read, N>, Error> {
        self.open(slot, start, count)
    }

    /// Opens a write of `count` sectors starting at sector `start`
    pub fn open_write(
        &mut self,
        slot: usize,
        start: u32,
        count: u16,
    ) -> Result<Transfer<'_, MCI, DMA, DELAY, PINS, Write, N>, Error> {
        self.open(slot, start, count)
    }

    fn open<D: TransferDirection>(
        &mut self,
        slot: usize,
        start: u32,
        count: u16,
    ) -> Result<Transfer<'_, MCI, DMA, DELAY, PINS, D, N>, Error> {
        let card = *self.card(slot)?;
        let end = start
            .checked_add(u32::from(count))
            .ok_or(Error::OutOfRange)?;
        if count == 0 || end > card.capacity.sectors {
            return Err(Error::OutOfRange);
        }
        let address = card.address(start)?;

        self.select_slot(slot);
        self.wait_not_busy()?;
        // Also clears address errors latched by the card on a previous
        // command
        let status = R1::from_response(self.command(&cmd::send_status(card.rca))?.word());
        if !status.in_transfer_state() {
            log::debug!("slot {}: not ready for data ({:#010x})", slot, status.bits());
            return Err(Error::UnexpectedState);
        }

        self.mci.set_block(SECTOR_SIZE as u16, count);
        let command = match (D::WRITE, count) {
            (false, 1) => cmd::read_single_block(address),
            (false, _) => cmd::read_multiple_blocks(address),
            (true, 1) => cmd::write_single_block(address),
            (true, _) => cmd::write_multiple_blocks(address),
        };
        let status = R1::from_response(self.command(&command)?.word());
        let errors = status & R1::RD_WR_ERRORS;
        if !errors.is_empty() {
            log::debug!("CMD{}: card status {:#010x}", command.opcode, status.bits());
            self.mci.reset();
            return Err(Error::CardStatus(errors.bits()));
        }

        Ok(Transfer {
            sdmmc: self,
            slot,
            blocks: count,
            total: usize::from(count) * SECTOR_SIZE,
            moved: 0,
            closed: false,
            _direction: PhantomData,
        })
    }

    /// Reads the data block returned by `command` into `buf`
    pub(crate) fn read_data_block(&mut self, command: &Command, buf: &mut [u8]) -> Result<(), Error> {
        self.mci.set_block(buf.len() as u16, 1);
        self.command(command)?;
        // In byte mode every FIFO access carries a single byte
        if self.mci.byte_mode() {
            for byte in buf.iter_mut() {
                *byte = self.read_fifo()? as u8;
            }
        } else {
            for chunk in buf.chunks_mut(4) {
                let word = self.read_fifo()?.to_ne_bytes();
                chunk.copy_from_slice(&word[..chunk.len()]);
            }
        }
        self.wait_transfer_done()
    }

    /// Sends `command` followed by `data` as a single block
    pub(crate) fn write_data_block(&mut self, command: &Command, data: &[u8]) -> Result<(), Error> {
        self.mci.set_block(data.len() as u16, 1);
        self.command(command)?;
        if self.mci.byte_mode() {
            for &byte in data {
                self.write_fifo(u32::from(byte))?;
            }
        } else {
            for chunk in data.chunks(4) {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                self.write_fifo(u32::from_ne_bytes(word))?;
            }
        }
        self.wait_transfer_done()
    }

    fn data_error(&mut self, sr: Status) -> Result<(), Error> {
        match status_error(sr & Status::DATA_ERRORS) {
            Some(err) => {
                log::debug!("data phase failed: {:?}", err);
                self.mci.reset();
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn read_fifo(&mut self) -> Result<u32, Error> {
        let mut deadline = Deadline::new(self.config.data_timeout);
        loop {
            let sr = self.mci.status();
            self.data_error(sr)?;
            if sr.contains(Status::RXRDY) {
                return Ok(self.mci.read_data());
            }
            if !deadline.tick(&mut self.delay) {
                return Err(Error::SoftwareTimeout);
            }
        }
    }

    fn write_fifo(&mut self, word: u32) -> Result<(), Error> {
        let mut deadline = Deadline::new(self.config.data_timeout);
        loop {
            let sr = self.mci.status();
            self.data_error(sr)?;
            if sr.contains(Status::TXRDY) {
                self.mci.write_data(word);
                return Ok(());
            }
            if !deadline.tick(&mut self.delay) {
                return Err(Error::SoftwareTimeout);
            }
        }
    }

    /// Waits for the end of the data phase
    pub(crate) fn wait_transfer_done(&mut self) -> Result<(), Error> {
        let mut deadline = Deadline::new(self.config.data_timeout);
        loop {
            let sr = self.mci.status();
            self.data_error(sr)?;
            if sr.contains(Status::XFRDONE) {
                return Ok(());
            }
            if !deadline.tick(&mut self.delay) {
                log::warn!("data phase did not complete");
                self.mci.reset();
                return Err(Error::SoftwareTimeout);
            }
        }
    }

    /// Hands `bytes` bytes at `memory` to the DMA channel.
    ///
    /// # Safety
    ///
    /// The region must stay valid and untouched until
    /// [`wait_dma_done`](Self::wait_dma_done) returns.
    unsafe fn start_dma_request(
        &mut self,
        direction: Direction,
        memory: usize,
        bytes: usize,
    ) -> Result<(), Error> {
        if self.dma.is_enabled() {
            return Err(Error::DmaBusy);
        }
        let width = self.dma_width(memory, bytes);
        let items = bytes / width.bytes();
        if items > usize::from(DmaRequest::MAX_ITEMS) {
            return Err(Error::BufferSize);
        }
        let burst = match width {
            TransferWidth::Word => BurstSize::Sixteen,
            TransferWidth::Byte => BurstSize::One,
        };
        let chunk = if self.mci.block_length() % 16 == 0 {
            ChunkSize::Sixteen
        } else {
            ChunkSize::One
        };
        self.mci.enable_dma(chunk);
        let request = DmaRequest {
            direction,
            memory,
            peripheral: self.mci.fifo_address(),
            width,
            burst,
            items: items as u16,
        };
        log::trace!("DMA {:?}", request);
        self.dma.start(&request);
        Ok(())
    }

    /// Word transfers need an aligned buffer, whole words and a block
    /// length the controller moves in words
    fn dma_width(&mut self, memory: usize, bytes: usize) -> TransferWidth {
        if memory % 4 != 0 || bytes % 4 != 0 || self.mci.byte_mode() {
            TransferWidth::Byte
        } else {
            TransferWidth::Word
        }
    }

    /// Largest region a single DMA request can cover at `memory`
    fn dma_limit(&mut self, memory: usize, bytes: usize) -> usize {
        usize::from(DmaRequest::MAX_ITEMS) * self.dma_width(memory, bytes).bytes()
    }

    /// Waits until the DMA channel has finished its request
    fn wait_dma_done(&mut self) -> Result<(), Error> {
        let mut deadline = Deadline::new(self.config.data_timeout);
        loop {
            let sr = self.mci.status();
            if status_error(sr & Status::DATA_ERRORS).is_some() {
                self.dma.disable();
                self.mci.disable_dma();
                return self.data_error(sr);
            }
            if !self.dma.is_enabled() {
                self.mci.disable_dma();
                return Ok(());
            }
            if !deadline.tick(&mut self.delay) {
                log::warn!("DMA request did not complete");
                self.dma.disable();
                self.mci.disable_dma();
                self.mci.reset();
                return Err(Error::SoftwareTimeout);
            }
        }
    }

    /// Reads `buf.len() / 512` sectors starting at `start` over the
    /// configured data path
    pub fn read_blocks(&mut self, slot: usize, start: u32, buf: &mut [u8]) -> Result<(), Error> {
        let count = sector_count(buf.len())?;
        let path = self.config.data_path;
        let mut transfer = self.open_read(slot, start, count)?;
        match path {
            DataPath::Polled => transfer.read_bytes(buf)?,
            DataPath::Dma => transfer.read_dma(buf)?,
        }
        transfer.close()
    }

    /// Writes `buf.len() / 512` sectors starting at `start` over the
    /// configured data path
    pub fn write_blocks(&mut self, slot: usize, start: u32, buf: &[u8]) -> Result<(), Error> {
        let count = sector_count(buf.len())?;
        let path = self.config.data_path;
        let mut transfer = self.open_write(slot, start, count)?;
        match path {
            DataPath::Polled => transfer.write_bytes(buf)?,
            DataPath::Dma => transfer.write_dma(buf)?,
        }
        transfer.close()
    }

    /// Reads `count` sectors one at a time into `sector`, handing each one
    /// to `f` before the next is read
    pub fn read_blocks_with<F>(
        &mut self,
        slot: usize,
        start: u32,
        count: u16,
        sector: &mut [u8; SECTOR_SIZE],
        mut f: F,
    ) -> Result<(), Error>
    where
        F: FnMut(u32, &[u8; SECTOR_SIZE]),
    {
        let path = self.config.data_path;
        let mut transfer = self.open_read(slot, start, count)?;
        for index in 0..u32::from(count) {
            match path {
                DataPath::Polled => transfer.read_bytes(sector)?,
                DataPath::Dma => transfer.read_dma(sector)?,
            }
            f(start + index, &*sector);
        }
        transfer.close()
    }

    /// Writes `count` sectors, asking `f` to fill `sector` before each one
    /// is sent
    pub fn write_blocks_with<F>(
        &mut self,
        slot: usize,
        start: u32,
        count: u16,
        sector: &mut [u8; SECTOR_SIZE],
        mut f: F,
    ) -> Result<(), Error>
    where
        F: FnMut(u32, &mut [u8; SECTOR_SIZE]),
    {
        let path = self.config.data_path;
        let mut transfer = self.open_write(slot, start, count)?;
        for index in 0..u32::from(count) {
            f(start + index, &mut *sector);
            match path {
                DataPath::Polled => transfer.write_bytes(sector)?,
                DataPath::Dma => transfer.write_dma(sector)?,
            }
        }
        transfer.close()
    }
}

fn sector_count(bytes: usize) -> Result<u16, Error> {
    if bytes == 0 || bytes % SECTOR_SIZE != 0 {
        return Err(Error::BufferSize);
    }
    u16::try_from(bytes / SECTOR_SIZE).map_err(|_| Error::BufferSize)
}

impl<'a, MCI, DMA, DELAY, PINS, D, const N: usize> Transfer<'a, MCI, DMA, DELAY, PINS, D, N>
where
    MCI: RegisterAccess,
    DMA: DmaChannel,
    DELAY: DelayUs<u32>,
    PINS: SlotPins,
    D: TransferDirection,
{
    /// Slot the transfer runs on
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Bytes covered by the transfer
    pub fn total_bytes(&self) -> usize {
        self.total
    }

    /// Bytes moved so far
    pub fn bytes_moved(&self) -> usize {
        self.moved
    }

    pub fn remaining(&self) -> usize {
        self.total - self.moved
    }

    /// How many of the next `bytes` bytes the transfer still has room for
    fn step(&self, bytes: usize) -> Result<usize, Error> {
        match bytes.min(self.remaining()) {
            0 => Err(Error::TransferExhausted),
            step => Ok(step),
        }
    }

    /// Accounts for `bytes` bytes that went through
    fn advance(&mut self, bytes: usize) -> Result<usize, Error> {
        let step = self.step(bytes)?;
        self.moved += step;
        Ok(step)
    }

    fn reserve(&self, bytes: usize) -> Result<(), Error> {
        if bytes > self.remaining() {
            Err(Error::TransferExhausted)
        } else {
            Ok(())
        }
    }

    /// Ends the transfer.
    ///
    /// Checks for data errors latched during the transfer and that every
    /// byte was moved, then waits for the controller to finish and stops
    /// multiple block transfers. The stop command is sent even if an
    /// earlier check failed, the first failure is returned.
    pub fn close(mut self) -> Result<(), Error> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.closed = true;
        let sdmmc = &mut *self.sdmmc;

        // A request started with `start_dma` and never waited for
        if sdmmc.dma.is_enabled() {
            log::warn!("slot {}: DMA request still running at close", self.slot);
            sdmmc.dma.disable();
            sdmmc.mci.disable_dma();
        }

        let latched = sdmmc.mci.latched();
        let mut result = match status_error(latched & Status::DATA_ERRORS) {
            Some(err) => {
                log::debug!("slot {}: data error during transfer: {:?}", self.slot, err);
                sdmmc.mci.reset();
                Err(err)
            }
            None if self.moved != self.total => {
                log::warn!(
                    "slot {}: transfer closed after {} of {} bytes",
                    self.slot,
                    self.moved,
                    self.total
                );
                sdmmc.mci.reset();
                Err(Error::IncompleteTransfer)
            }
            None => sdmmc.wait_transfer_done(),
        };

        if self.blocks > 1 {
            let stop = sdmmc.command(&cmd::stop_transmission(D::WRITE));
            if result.is_ok() {
                result = stop.map(|_| ());
            }
        } else if D::WRITE && result.is_ok() {
            result = sdmmc.wait_not_busy();
        }
        result
    }
}

impl<'a, MCI, DMA, DELAY, PINS, const N: usize> Transfer<'a, MCI, DMA, DELAY, PINS, Read, N>
where
    MCI: RegisterAccess,
    DMA: DmaChannel,
    DELAY: DelayUs<u32>,
    PINS: SlotPins,
{
    /// Reads the next FIFO word. Near the end of a transfer only the
    /// remaining bytes of the word count as moved.
    pub fn read_word(&mut self) -> Result<u32, Error> {
        let step = self.step(4)?;
        let word = self.sdmmc.read_fifo()?;
        self.moved += step;
        Ok(word)
    }

    /// Fills `buf` through the FIFO
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.reserve(buf.len())?;
        for chunk in buf.chunks_mut(4) {
            let word = self.sdmmc.read_fifo()?.to_ne_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
            self.moved += chunk.len();
        }
        Ok(())
    }

    /// Fills `buf` with the DMA channel. Returns once the data is in
    /// memory.
    pub fn read_dma(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.reserve(buf.len())?;
        let limit = self.sdmmc.dma_limit(buf.as_ptr() as usize, buf.len());
        for chunk in buf.chunks_mut(limit) {
            // NOTE(unsafe) `chunk` stays borrowed until the channel is done
            unsafe {
                self.sdmmc.start_dma_request(
                    Direction::PeripheralToMemory,
                    chunk.as_mut_ptr() as usize,
                    chunk.len(),
                )?;
            }
            self.sdmmc.wait_dma_done()?;
            self.advance(chunk.len())?;
        }
        Ok(())
    }

    /// Starts a DMA read into `buffer` and returns without waiting. The
    /// buffer must fit into a single DMA request.
    pub fn start_dma<B>(&mut self, mut buffer: B) -> Result<DmaToken<B>, (Error, B)>
    where
        B: WriteBuffer<Word = u8> + 'static,
    {
        // NOTE(unsafe) the buffer is owned by the token until `wait_dma`
        let (ptr, bytes) = unsafe { buffer.write_buffer() };
        if let Err(err) = self.check_dma(ptr as usize, bytes) {
            return Err((err, buffer));
        }
        // NOTE(unsafe) `buffer` is 'static and moved into the token
        match unsafe {
            self.sdmmc
                .start_dma_request(Direction::PeripheralToMemory, ptr as usize, bytes)
        } {
            Ok(()) => Ok(DmaToken { buffer, bytes }),
            Err(err) => Err((err, buffer)),
        }
    }
}

impl<'a, MCI, DMA, DELAY, PINS, const N: usize> Transfer<'a, MCI, DMA, DELAY, PINS, Write, N>
where
    MCI: RegisterAccess,
    DMA: DmaChannel,
    DELAY: DelayUs<u32>,
    PINS: SlotPins,
{
    /// Writes the next FIFO word. Near the end of a transfer only the
    /// remaining bytes of the word count as moved.
    pub fn write_word(&mut self, word: u32) -> Result<(), Error> {
        let step = self.step(4)?;
        self.sdmmc.write_fifo(word)?;
        self.moved += step;
        Ok(())
    }

    /// Sends `buf` through the FIFO
    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.reserve(buf.len())?;
        for chunk in buf.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.sdmmc.write_fifo(u32::from_ne_bytes(word))?;
            self.moved += chunk.len();
        }
        Ok(())
    }

    /// Sends `buf` with the DMA channel. Returns once the channel has
    /// drained the buffer.
    pub fn write_dma(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.reserve(buf.len())?;
        let limit = self.sdmmc.dma_limit(buf.as_ptr() as usize, buf.len());
        for chunk in buf.chunks(limit) {
            // NOTE(unsafe) `chunk` stays borrowed until the channel is done
            unsafe {
                self.sdmmc.start_dma_request(
                    Direction::MemoryToPeripheral,
                    chunk.as_ptr() as usize,
                    chunk.len(),
                )?;
            }
            self.sdmmc.wait_dma_done()?;
            self.advance(chunk.len())?;
        }
        Ok(())
    }

    /// Starts a DMA write from `buffer` and returns without waiting. The
    /// buffer must fit into a single DMA request.
    pub fn start_dma<B>(&mut self, buffer: B) -> Result<DmaToken<B>, (Error, B)>
    where
        B: ReadBuffer<Word = u8> + 'static,
    {
        // NOTE(unsafe) the buffer is owned by the token until `wait_dma`
        let (ptr, bytes) = unsafe { buffer.read_buffer() };
        if let Err(err) = self.check_dma(ptr as usize, bytes) {
            return Err((err, buffer));
        }
        // NOTE(unsafe) `buffer` is 'static and moved into the token
        match unsafe {
            self.sdmmc
                .start_dma_request(Direction::MemoryToPeripheral, ptr as usize, bytes)
        } {
            Ok(()) => Ok(DmaToken { buffer, bytes }),
            Err(err) => Err((err, buffer)),
        }
    }
}

impl<'a, MCI, DMA, DELAY, PINS, D, const N: usize> Transfer<'a, MCI, DMA, DELAY, PINS, D, N>
where
    MCI: RegisterAccess,
    DMA: DmaChannel,
    DELAY: DelayUs<u32>,
    PINS: SlotPins,
    D: TransferDirection,
{
    fn check_dma(&mut self, memory: usize, bytes: usize) -> Result<(), Error> {
        self.reserve(bytes)?;
        if bytes == 0 || bytes > self.sdmmc.dma_limit(memory, bytes) {
            return Err(Error::BufferSize);
        }
        Ok(())
    }

    /// Waits for the request started with `start_dma` and returns its
    /// buffer
    pub fn wait_dma<B>(&mut self, token: DmaToken<B>) -> Result<B, (Error, B)> {
        match self.sdmmc.wait_dma_done() {
            Ok(()) => match self.advance(token.bytes) {
                Ok(_) => Ok(token.buffer),
                Err(err) => Err((err, token.buffer)),
            },
            Err(err) => Err((err, token.buffer)),
        }
    }
}

impl<'a, MCI, DMA, DELAY, PINS, D, const N: usize> Drop for Transfer<'a, MCI, DMA, DELAY, PINS, D, N>
where
    MCI: RegisterAccess,
    DMA: DmaChannel,
    DELAY: DelayUs<u32>,
    PINS: SlotPins,
    D: TransferDirection,
{
    fn drop(&mut self) {
        if !self.closed {
            log::warn!("slot {}: transfer dropped while open", self.slot);
            let _ = self.finish();
        }
    }
}
