//! Register access
//!
//! The MCI and DMA drivers never touch a raw pointer themselves. They go
//! through [`RegisterAccess`], which is implemented by [`Mmio`] for memory
//! mapped peripherals and can be implemented by anything else that behaves
//! like a bank of 32-bit registers.

use core::ptr;

/// A bank of 32-bit registers addressed by byte offset
pub trait RegisterAccess {
    /// Reads the register at `offset`. Some registers (data FIFOs, status
    /// with clear-on-read flags) have side effects on read.
    fn read(&mut self, offset: usize) -> u32;

    /// Writes `value` to the register at `offset`
    fn write(&mut self, offset: usize, value: u32);

    /// Read-modify-write of the register at `offset`
    fn modify<F>(&mut self, offset: usize, f: F)
    where
        F: FnOnce(u32) -> u32,
    {
        let value = self.read(offset);
        self.write(offset, f(value));
    }

    /// Bus address of the register at `offset`, as seen by a DMA master
    fn address(&self, offset: usize) -> usize;
}

/// Memory mapped register bank
#[derive(Debug)]
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// Creates a register bank starting at `base`
    ///
    /// # Safety
    ///
    /// `base` must be the address of a peripheral register block that is
    /// valid for volatile 32-bit accesses at every offset the driver uses,
    /// and nothing else may access that block while this value exists.
    pub const unsafe fn new(base: usize) -> Self {
        Mmio { base }
    }

    /// Base address of the register bank
    pub fn base(&self) -> usize {
        self.base
    }
}

impl RegisterAccess for Mmio {
    fn read(&mut self, offset: usize) -> u32 {
        // NOTE(unsafe) validity of the register block is guaranteed by `new`
        unsafe { ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write(&mut self, offset: usize, value: u32) {
        // NOTE(unsafe) validity of the register block is guaranteed by `new`
        unsafe { ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }

    fn address(&self, offset: usize) -> usize {
        self.base + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volatile_access_hits_backing_words() {
        let mut bank = [0u32; 4];
        let mut mmio = unsafe { Mmio::new(bank.as_mut_ptr() as usize) };

        mmio.write(0x8, 0xDEAD_BEEF);
        mmio.modify(0x8, |v| v & 0xFFFF);
        mmio.write(0x0, 7);

        assert_eq!(mmio.read(0x8), 0xBEEF);
        assert_eq!(mmio.read(0x0), 7);
        assert_eq!(mmio.address(0xC), mmio.base() + 0xC);
        drop(mmio);
        assert_eq!(bank, [7, 0, 0xBEEF, 0]);
    }
}
