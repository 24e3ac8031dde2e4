//! Prelude
pub use embedded_hal::prelude::*;

pub use crate::dma::DmaChannel as _mci_sdmmc_dma_DmaChannel;
pub use crate::mmio::RegisterAccess as _mci_sdmmc_mmio_RegisterAccess;
pub use crate::sdmmc::SlotPins as _mci_sdmmc_sdmmc_SlotPins;
pub use fugit::ExtU32 as _mci_sdmmc_time_ExtU32;
pub use fugit::RateExtU32 as _mci_sdmmc_time_RateExtU32;
