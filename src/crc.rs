//! Dallas/Maxim CRC-8 (`X^8 + X^5 + X^4 + 1`), used to check the ROM code

/// Calculates the crc8 of the input data.
///
/// Running it over data followed by its own crc always yields 0
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0;
    for byte in data {
        crc ^= byte;
        for _ in 0..u8::BITS {
            let bit = crc & 0x01;
            crc >>= 1;
            if bit != 0 {
                // 0b1000_1100
                crc ^= 0x8C;
            }
        }
    }
    crc
}

/// Checks a full 8 byte ROM code, whose last byte is the crc of the first seven
pub fn rom_code_valid(rom: &[u8]) -> bool {
    match rom.split_last() {
        Some((crc, data)) => crc8(data) == *crc,
        None => false,
    }
}
