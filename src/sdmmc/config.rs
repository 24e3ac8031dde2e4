//! Driver configuration

use crate::time::{Hertz, MicroSeconds};

/// How the end of a card busy period is detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusyDetect {
    /// `NOTBUSY` flag of the MCI status register
    Status,
    /// Level of the DAT0 pin. Works around early silicon revisions where
    /// the `NOTBUSY` flag rises before the card has released DAT0.
    Data0Line,
}

/// Data path used by the block device level operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataPath {
    /// The CPU moves every word through the FIFO
    Polled,
    /// The DMA channel moves the data
    Dma,
}

/// Configuration of the [`Sdmmc`](super::Sdmmc) driver
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub(crate) init_clock: Hertz,
    pub(crate) max_clock: Hertz,
    pub(crate) high_speed: bool,
    pub(crate) busy_detect: BusyDetect,
    pub(crate) command_timeout: MicroSeconds,
    pub(crate) busy_timeout: MicroSeconds,
    pub(crate) data_timeout: MicroSeconds,
    pub(crate) op_cond_attempts: u32,
    pub(crate) op_cond_interval: MicroSeconds,
    pub(crate) init_attempts: u8,
    pub(crate) data_path: DataPath,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            init_clock: Hertz::from_raw(400_000),
            max_clock: Hertz::from_raw(50_000_000),
            high_speed: true,
            busy_detect: BusyDetect::Status,
            command_timeout: MicroSeconds::millis(100),
            busy_timeout: MicroSeconds::millis(500),
            data_timeout: MicroSeconds::millis(500),
            op_cond_attempts: 1000,
            op_cond_interval: MicroSeconds::millis(1),
            init_attempts: 10,
            data_path: DataPath::Dma,
        }
    }
}

impl Config {
    /// Set the clock used during identification.
    #[inline(always)]
    #[must_use]
    pub const fn init_clock(mut self, init_clock: Hertz) -> Self {
        self.init_clock = init_clock;
        self
    }
    /// Set the upper bound for the data transfer clock. The card's own
    /// maximum still applies.
    #[inline(always)]
    #[must_use]
    pub const fn max_clock(mut self, max_clock: Hertz) -> Self {
        self.max_clock = max_clock;
        self
    }
    /// Allow high speed negotiation.
    #[inline(always)]
    #[must_use]
    pub const fn high_speed(mut self, high_speed: bool) -> Self {
        self.high_speed = high_speed;
        self
    }
    /// Set the busy detection strategy.
    #[inline(always)]
    #[must_use]
    pub const fn busy_detect(mut self, busy_detect: BusyDetect) -> Self {
        self.busy_detect = busy_detect;
        self
    }
    /// Set the budget for a command to complete.
    #[inline(always)]
    #[must_use]
    pub const fn command_timeout(mut self, command_timeout: MicroSeconds) -> Self {
        self.command_timeout = command_timeout;
        self
    }
    /// Set the budget for a card busy period.
    #[inline(always)]
    #[must_use]
    pub const fn busy_timeout(mut self, busy_timeout: MicroSeconds) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }
    /// Set the budget for each word or DMA block of a data phase.
    #[inline(always)]
    #[must_use]
    pub const fn data_timeout(mut self, data_timeout: MicroSeconds) -> Self {
        self.data_timeout = data_timeout;
        self
    }
    /// Set how often the operating condition command is repeated before
    /// the card is given up on, and the pause between attempts.
    #[inline(always)]
    #[must_use]
    pub const fn op_cond(mut self, attempts: u32, interval: MicroSeconds) -> Self {
        self.op_cond_attempts = attempts;
        self.op_cond_interval = interval;
        self
    }
    /// Set how many identification attempts a presence check makes.
    #[inline(always)]
    #[must_use]
    pub const fn init_attempts(mut self, init_attempts: u8) -> Self {
        self.init_attempts = init_attempts;
        self
    }
    /// Set the data path used by the block device operations.
    #[inline(always)]
    #[must_use]
    pub const fn data_path(mut self, data_path: DataPath) -> Self {
        self.data_path = data_path;
        self
    }
}
