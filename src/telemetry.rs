//! Raw register readings, their fixed point conversion, and the sample
//! handed to the charge scheduler

use core::cell::RefCell;

use byteorder::{BigEndian, ByteOrder};
use critical_section::Mutex;

use crate::registers::{MEASUREMENT_BLOCK_SIZE, THERMAL_BLOCK_SIZE};

/// Current in mA from the raw current register (1.5625 uV / 12 mOhm sense)
pub fn current_ma(raw: i16) -> i16 {
    (raw as i32 * 1302 / 10000) as i16
}

/// Charge in mAh from the accumulated current register
pub fn charge_mah(raw: i16) -> i16 {
    (raw as i32 * 4167 / 10000) as i16
}

/// Voltage in mV from the raw voltage register
pub fn voltage_mv(raw: u16) -> u16 {
    (raw as u32 * 3 / 10) as u16
}

/// Temperature in 1/100 degree Celsius. The high byte is whole degrees,
/// the top three bits of the low byte are eighths of a degree
pub fn temperature_cc(raw: i16) -> i16 {
    const EIGHTHS: [i16; 8] = [0, 13, 25, 38, 50, 63, 75, 88];

    let degrees = (raw >> 8) * 100;
    let fraction = EIGHTHS[(raw as u8 / 0x20) as usize];

    if raw < 0 {
        degrees - fraction
    } else {
        degrees + fraction
    }
}

/// Register words as read from the monitor, already byte swapped
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawReadings {
    pub voltage: u16,
    pub current: i16,
    pub charge: u16,
    pub temperature: i16,
    pub average_current: i16,
}

impl RawReadings {
    /// Decodes the voltage/current/charge block followed by the
    /// temperature/average current block
    pub fn from_blocks(
        measurement: &[u8; MEASUREMENT_BLOCK_SIZE],
        thermal: &[u8; THERMAL_BLOCK_SIZE],
    ) -> Self {
        Self {
            voltage: BigEndian::read_u16(&measurement[0..2]),
            current: BigEndian::read_i16(&measurement[2..4]),
            charge: BigEndian::read_u16(&measurement[4..6]),
            temperature: BigEndian::read_i16(&thermal[0..2]),
            average_current: BigEndian::read_i16(&thermal[2..4]),
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySample {
    pub timestamp_ms: u32,
    pub voltage_mv: u16,
    pub current_ma: i16,
    pub average_current_ma: i16,
    pub charge_raw: u16,
    pub temperature_cc: i16,
}

impl TelemetrySample {
    pub fn from_raw(raw: &RawReadings, timestamp_ms: u32) -> Self {
        Self {
            timestamp_ms,
            voltage_mv: voltage_mv(raw.voltage),
            current_ma: current_ma(raw.current),
            average_current_ma: current_ma(raw.average_current),
            charge_raw: raw.charge,
            temperature_cc: temperature_cc(raw.temperature),
        }
    }

    pub fn charge_mah(&self) -> i16 {
        charge_mah(self.charge_raw as i16)
    }
}

struct Latest {
    sample: Option<TelemetrySample>,
    new_data: bool,
}

/// Latest sample plus the edge-triggered `new_data` flag. One reader
pub struct TelemetryCell {
    latest: Mutex<RefCell<Latest>>,
}

impl TelemetryCell {
    pub const fn new() -> Self {
        Self {
            latest: Mutex::new(RefCell::new(Latest {
                sample: None,
                new_data: false,
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Latest) -> R) -> R {
        critical_section::with(|cs| f(&mut self.latest.borrow_ref_mut(cs)))
    }

    pub(crate) fn publish(&self, sample: TelemetrySample) {
        self.with(|latest| {
            latest.sample = Some(sample);
            latest.new_data = true;
        })
    }

    pub fn latest(&self) -> Option<TelemetrySample> {
        self.with(|latest| latest.sample)
    }

    pub fn has_new_data(&self) -> bool {
        self.with(|latest| latest.new_data)
    }

    pub fn clear_new_data(&self) {
        self.with(|latest| latest.new_data = false)
    }

    /// Returns the sample if it was not seen yet, clearing the flag
    pub fn take_new_data(&self) -> Option<TelemetrySample> {
        self.with(|latest| {
            if core::mem::take(&mut latest.new_data) {
                latest.sample
            } else {
                None
            }
        })
    }
}

impl Default for TelemetryCell {
    fn default() -> Self {
        Self::new()
    }
}
