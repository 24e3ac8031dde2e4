//! Card sockets

use core::convert::Infallible;

use embedded_hal::digital::v2::InputPin;

use super::Card;
use crate::mci::Buswidth;

/// Board signals of one card socket
pub trait SlotPins {
    /// `true` when a card sits in the socket
    fn card_detected(&mut self) -> bool;

    /// `true` when the write protect switch of the card is engaged
    fn write_protected(&mut self) -> bool;

    /// Level of the DAT0 line. Only used with
    /// [`BusyDetect::Data0Line`](super::BusyDetect::Data0Line).
    fn data0_high(&mut self) -> bool;
}

/// [`SlotPins`] implementation over embedded-hal input pins.
///
/// Card detect defaults to active low and write protect to active high,
/// which matches the usual socket switches.
pub struct Pins<CD, WP, DAT0> {
    card_detect: CD,
    card_detect_active_high: bool,
    write_protect: WP,
    write_protect_active_high: bool,
    data0: DAT0,
}

impl<CD, WP, DAT0> Pins<CD, WP, DAT0>
where
    CD: InputPin,
    WP: InputPin,
    DAT0: InputPin,
{
    pub fn new(card_detect: CD, write_protect: WP, data0: DAT0) -> Self {
        Pins {
            card_detect,
            card_detect_active_high: false,
            write_protect,
            write_protect_active_high: true,
            data0,
        }
    }

    /// Sets the level that signals an inserted card
    #[must_use]
    pub fn card_detect_active_high(mut self, active_high: bool) -> Self {
        self.card_detect_active_high = active_high;
        self
    }

    /// Sets the level that signals a write protected card
    #[must_use]
    pub fn write_protect_active_high(mut self, active_high: bool) -> Self {
        self.write_protect_active_high = active_high;
        self
    }

    /// Releases the pins
    pub fn free(self) -> (CD, WP, DAT0) {
        (self.card_detect, self.write_protect, self.data0)
    }
}

fn is_active<P: InputPin>(pin: &P, active_high: bool) -> bool {
    match pin.is_high() {
        Ok(high) => high == active_high,
        Err(_) => false,
    }
}

impl<CD, WP, DAT0> SlotPins for Pins<CD, WP, DAT0>
where
    CD: InputPin,
    WP: InputPin,
    DAT0: InputPin,
{
    fn card_detected(&mut self) -> bool {
        is_active(&self.card_detect, self.card_detect_active_high)
    }

    fn write_protected(&mut self) -> bool {
        is_active(&self.write_protect, self.write_protect_active_high)
    }

    fn data0_high(&mut self) -> bool {
        // A read error reads as busy, the busy wait is bounded
        matches!(self.data0.is_high(), Ok(true))
    }
}

/// Input that is tied to a fixed level, for sockets without a card detect
/// or write protect switch
#[derive(Debug, Clone, Copy)]
pub struct FixedLevel(bool);

impl FixedLevel {
    pub const fn high() -> Self {
        FixedLevel(true)
    }

    pub const fn low() -> Self {
        FixedLevel(false)
    }
}

impl InputPin for FixedLevel {
    type Error = Infallible;

    fn is_high(&self) -> Result<bool, Self::Error> {
        Ok(self.0)
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        Ok(!self.0)
    }
}

/// Presence of a card as reported to the block device layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Presence {
    /// No card, or card not identified yet
    Removed,
    /// Card identified and usable
    Present,
    /// Card lost since the last check. Reported once so that the host
    /// sees a media change.
    Removing,
}

/// Card lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CardState {
    Uninitialized,
    Reset,
    VoltageNegotiation,
    Identification,
    GeometryRead,
    Selected,
    Present,
    Removed,
}

/// One card socket on the controller
pub struct Slot<PINS> {
    pub(crate) pins: PINS,
    /// Widest bus the socket is wired for
    pub(crate) bus_width: Buswidth,
    pub(crate) state: CardState,
    pub(crate) presence: Presence,
    pub(crate) card: Option<Card>,
}

impl<PINS: SlotPins> Slot<PINS> {
    /// A socket wired for `bus_width` data lines
    pub fn new(pins: PINS, bus_width: Buswidth) -> Self {
        Slot {
            pins,
            bus_width,
            state: CardState::Uninitialized,
            presence: Presence::Removed,
            card: None,
        }
    }

    /// Widest bus the socket is wired for
    pub fn bus_width(&self) -> Buswidth {
        self.bus_width
    }

    /// Current lifecycle state
    pub fn state(&self) -> CardState {
        self.state
    }

    /// Identified card, if any
    pub fn card(&self) -> Option<&Card> {
        self.card.as_ref()
    }

    /// Drops everything learned about the card
    pub(crate) fn invalidate(&mut self) {
        self.card = None;
        self.state = CardState::Removed;
    }

    /// Releases the pins
    pub fn free(self) -> PINS {
        self.pins
    }
}
