//! SD/MMC block storage over an MCI host controller
//!
//! The [`sdmmc`] module identifies cards and moves sectors, [`ctrl`] wraps
//! it into the request/response interface a mass storage layer expects.
//! The controller and DMA registers are reached through
//! [`mmio::RegisterAccess`], so the driver runs against real hardware or
//! anything else that looks like a register bank.
#![cfg_attr(not(test), no_std)]

pub use embedded_hal as hal;

pub mod card;
pub mod ctrl;
pub mod dma;
pub mod mci;
pub mod mmio;
pub mod prelude;
pub mod sdmmc;
pub mod time;

#[cfg(test)]
mod sim;

pub use crate::ctrl::{CtrlError, UnitStatus};
pub use crate::sdmmc::{Card, Error, Sdmmc};
