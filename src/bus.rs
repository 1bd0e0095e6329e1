//! Hardware seams of the transport: the open-drain data line and the deadline timer

use embedded_hal::digital::{ErrorType, InputPin, OutputPin};

/// Faults that can be seen on the wire itself. They are only detected
/// during the reset/presence sequence
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusFault {
    LineStuckLow,
    LineStuckHigh,
    NoDeviceResponding,
}

/// The single-wire data line. Open drain: we can only pull it down, the
/// pull-up resistor brings it back up once released
pub trait BusLine {
    fn drive_low(&mut self);
    fn release(&mut self);
    /// Returns true if the line is high
    fn sample(&mut self) -> bool;
}

/// A one-shot hardware countdown. Expiry triggers the timer interrupt which
/// calls into [`crate::transport::SharedEngine::on_timer_interrupt`]
pub trait DeadlineTimer {
    fn arm(&mut self, us: u16);
    /// Expiry flag, pollable without the interrupt. Used for short busy-waits
    fn expired(&mut self) -> bool;
    /// Stops further interrupts until armed again
    fn disable(&mut self);
}

/// Adapts an embedded-hal pin configured as open-drain output with input enabled
pub struct OpenDrain<P> {
    pin: P,
}

impl<P> OpenDrain<P>
where
    P: InputPin + OutputPin,
{
    /// Releases the line and takes the pin over
    pub fn new(mut pin: P) -> Result<Self, <P as ErrorType>::Error> {
        pin.set_high()?;
        Ok(Self { pin })
    }

    pub fn free(self) -> P {
        self.pin
    }
}

/*
 * Pin errors cannot be reported from the interrupt. A line that cannot
 * be read is treated as high which shows up as a missing device or a
 * line stuck high on the next reset
 */
impl<P> BusLine for OpenDrain<P>
where
    P: InputPin + OutputPin,
{
    fn drive_low(&mut self) {
        let _ = self.pin.set_low();
    }

    fn release(&mut self) {
        let _ = self.pin.set_high();
    }

    fn sample(&mut self) -> bool {
        self.pin.is_high().unwrap_or(true)
    }
}
