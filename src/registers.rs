//! These are low-level definitions for DS2756 and similar single-wire monitors

/// ROM (network layer) commands, issued right after the reset/presence sequence
pub mod rom_commands {
    #![allow(dead_code)]
    pub const READ_ROM: u8 = 0x33;
    pub const MATCH_ROM: u8 = 0x55;
    pub const SKIP_ROM: u8 = 0xCC;
    pub const SEARCH_ROM: u8 = 0xF0;
}

/// Function commands, issued after a ROM command has selected the device
pub mod function_commands {
    #![allow(dead_code)]
    pub const READ_DATA: u8 = 0x69;
    pub const WRITE_DATA: u8 = 0x6C;
    pub const COPY_DATA: u8 = 0x48;
    pub const RECALL_DATA: u8 = 0xB8;
    pub const LOCK: u8 = 0x6A;
}

/// This is a list of registers (memory map addresses) of the monitor
pub mod addresses {
    #![allow(dead_code)]
    pub const PROTECTION: u8 = 0x00;
    pub const STATUS: u8 = 0x01;
    pub const EEPROM: u8 = 0x07;
    pub const SPECIAL_FEATURE: u8 = 0x08;
    pub const VOLTAGE: u8 = 0x0C;
    pub const CURRENT: u8 = 0x0E;
    pub const ACCUMULATED_CURRENT: u8 = 0x10;
    pub const TEMPERATURE: u8 = 0x18;
    pub const AVERAGE_CURRENT: u8 = 0x1A;
    pub const EEPROM_BLOCK_0: u8 = 0x20;
    pub const EEPROM_BLOCK_1: u8 = 0x30;

    /// End (exclusive) of the range covered by the diagnostic dump
    pub const DUMP_END: u8 = 0x90;
}

/// Family byte of the DS2756 ROM code
pub const DS2756_FAMILY_CODE: u8 = 0x35;

/// Size of the ROM code: family, 6 serial bytes, crc
pub const ROM_SIZE: usize = 8;

/// Voltage, current and accumulated charge are read in one go
pub const MEASUREMENT_BLOCK: u8 = addresses::VOLTAGE;
pub const MEASUREMENT_BLOCK_SIZE: usize = 6;

/// Temperature followed by the average current
pub const THERMAL_BLOCK: u8 = addresses::TEMPERATURE;
pub const THERMAL_BLOCK_SIZE: usize = 4;

/// Bytes read per line of the diagnostic dump
pub const DUMP_BLOCK_SIZE: usize = 8;

/// Builds the "skip ROM, read data at address" request
pub const fn read_data_request(address: u8) -> [u8; 3] {
    [rom_commands::SKIP_ROM, function_commands::READ_DATA, address]
}
