//! Time units
//!
//! Frequencies and durations are `fugit` types. [`Deadline`] turns a
//! duration into a polling budget that is spent through a blocking delay
//! provider, so every wait in the driver is bounded in wall-clock time
//! rather than in loop iterations.

use embedded_hal::blocking::delay::DelayUs;

pub use fugit::HertzU32 as Hertz;
pub use fugit::MicrosDurationU32 as MicroSeconds;
pub use fugit::{ExtU32, RateExtU32};

/// Remaining wall-clock budget of a polling loop
#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadline {
    remaining_us: u32,
}

impl Deadline {
    /// Granularity of a single poll, in microseconds
    const STEP_US: u32 = 1;

    pub(crate) fn new(budget: MicroSeconds) -> Self {
        Deadline {
            remaining_us: budget.ticks(),
        }
    }

    /// Waits one poll step. Returns `false` once the budget is used up.
    pub(crate) fn tick<D: DelayUs<u32>>(&mut self, delay: &mut D) -> bool {
        if self.remaining_us == 0 {
            return false;
        }
        let step = Self::STEP_US.min(self.remaining_us);
        delay.delay_us(step);
        self.remaining_us -= step;
        true
    }
}
