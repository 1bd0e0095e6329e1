use crate::registers::DS2756_FAMILY_CODE;

/// Session arbiter settings
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Wait between discovery attempts while no usable device is found
    pub retry_interval_ms: u32,
    /// Telemetry cadence while the device is known
    pub poll_interval_ms: u32,
    /// Family byte the ROM code must start with
    pub family_code: u8,
    /// Check the crc of the ROM code during discovery
    pub verify_rom_crc: bool,
}

impl Config {
    pub const DEFAULT: Self = Self {
        retry_interval_ms: 2000,
        poll_interval_ms: 1000,
        family_code: DS2756_FAMILY_CODE,
        verify_rom_crc: true,
    };

    pub const fn with_retry_interval_ms(mut self, ms: u32) -> Self {
        self.retry_interval_ms = ms;
        self
    }

    pub const fn with_poll_interval_ms(mut self, ms: u32) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub const fn with_family_code(mut self, code: u8) -> Self {
        self.family_code = code;
        self
    }

    pub const fn with_rom_crc_check(mut self, verify: bool) -> Self {
        self.verify_rom_crc = verify;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}
