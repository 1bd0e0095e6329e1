//! Single-wire battery monitors we may find on the battery pack. Only the
//! DS2756 is actually handled, the rest exist so the logs say what was plugged in

use crate::registers::DS2756_FAMILY_CODE;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    DS2438,
    DS2751,
    DS2756,
    DS2760,
    DS2780,
    Unknown(u8),
}

impl From<u8> for Family {
    fn from(code: u8) -> Self {
        match code {
            0x26 => Self::DS2438,
            0x51 => Self::DS2751,
            DS2756_FAMILY_CODE => Self::DS2756,
            0x30 => Self::DS2760,
            0x32 => Self::DS2780,
            other => Self::Unknown(other),
        }
    }
}

impl Family {
    /// Family byte as it appears in the first byte of the ROM code
    pub fn code(&self) -> u8 {
        match self {
            Self::DS2438 => 0x26,
            Self::DS2751 => 0x51,
            Self::DS2756 => DS2756_FAMILY_CODE,
            Self::DS2760 => 0x30,
            Self::DS2780 => 0x32,
            Self::Unknown(code) => *code,
        }
    }
}
