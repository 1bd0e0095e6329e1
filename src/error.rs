use crate::bus::BusFault;
use crate::fmt::bitflags;

bitflags! {
    /// Error state of the monitor session, bit order as reported to the host
    #[derive(Default)]
    pub struct ErrorFlags: u8 {
        const INTERNAL_ERROR = 1 << 0;
        const BUSY_WAIT = 1 << 1;
        const ILLEGAL_WRITE = 1 << 2;
        const CRC_FAIL = 1 << 3;
        const NO_DEVICE = 1 << 4;
        const NO_DEVICE_FLAG_STALE = 1 << 5;
        const LINE_STUCK_LOW = 1 << 6;
        const LINE_STUCK_HIGH = 1 << 7;

        /// Flags that mean the device may be gone and must be rediscovered
        const FAULTS = Self::CRC_FAIL.bits
            | Self::NO_DEVICE.bits
            | Self::LINE_STUCK_LOW.bits
            | Self::LINE_STUCK_HIGH.bits;

        /// Flags that make the data of a response unusable
        const REJECTING = Self::FAULTS.bits
            | Self::ILLEGAL_WRITE.bits
            | Self::INTERNAL_ERROR.bits;
    }
}

impl From<BusFault> for ErrorFlags {
    fn from(fault: BusFault) -> Self {
        match fault {
            BusFault::LineStuckLow => ErrorFlags::LINE_STUCK_LOW,
            BusFault::LineStuckHigh => ErrorFlags::LINE_STUCK_HIGH,
            BusFault::NoDeviceResponding => ErrorFlags::NO_DEVICE,
        }
    }
}

/// Errors returned by the public API
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A transfer is in flight, or its result has not been collected yet
    Busy,
    /// Request or response does not fit into the transfer buffer
    BufferOverflow,
    /// The channel still holds a request that was not answered and collected
    RequestPending,
    /// The request was answered with these errors
    Rejected(ErrorFlags),
}

pub type Result<T> = core::result::Result<T, Error>;
