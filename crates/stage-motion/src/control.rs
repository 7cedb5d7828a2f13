//! Control word bit-fields and the fixed command patterns written to it.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Bits of the 16-bit control register.
    ///
    /// ENABLE is a persistent mode bit; the others are one-shot commands that
    /// the firmware clears when the action completes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ControlBits: u16 {
        const ENABLE          = 1 << 2;
        const SEEK_LIMIT_UP   = 1 << 4;
        const SEEK_LIMIT_DOWN = 1 << 5;
        const ZERO_OFFSET     = 1 << 8;
        const HOME_LOW        = 1 << 10;
        const HOME_HIGH       = 1 << 11;
        const STOP            = 1 << 12;
        const EMERGENCY_STOP  = 1 << 13;
    }
}

impl ControlBits {
    pub const HOMING_MASK: Self =
        Self::from_bits_truncate(Self::HOME_HIGH.bits() | Self::HOME_LOW.bits());
}

impl Default for ControlBits {
    fn default() -> Self {
        Self::empty()
    }
}

/// True when every bit of `mask` is set in `word`.
pub fn read_field(word: u16, mask: u16) -> bool {
    word & mask == mask
}

/// Set or clear `mask` in `word`, leaving all other bits alone.
pub fn set_field(word: u16, mask: u16, value: bool) -> u16 {
    if value {
        word | mask
    } else {
        word & !mask
    }
}

/// Homing runs while either homing bit is still latched.
pub fn homing_in_progress(word: u16) -> bool {
    ControlBits::from_bits_retain(word).intersects(ControlBits::HOMING_MASK)
}

/// Commands written to the control register as a whole word, without reading
/// it first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    Stop,
    EmergencyStop,
    SeekLimit { upper: bool },
    ZeroOffset,
    Home { high: bool },
}

impl ControlCommand {
    pub fn bits(self) -> ControlBits {
        match self {
            ControlCommand::Stop => ControlBits::STOP,
            ControlCommand::EmergencyStop => ControlBits::EMERGENCY_STOP,
            ControlCommand::SeekLimit { upper: true } => ControlBits::SEEK_LIMIT_UP,
            ControlCommand::SeekLimit { upper: false } => ControlBits::SEEK_LIMIT_DOWN,
            ControlCommand::ZeroOffset => ControlBits::ZERO_OFFSET,
            ControlCommand::Home { high: true } => ControlBits::HOME_HIGH,
            ControlCommand::Home { high: false } => ControlBits::HOME_LOW,
        }
    }

    pub fn pattern(self) -> u16 {
        self.bits().bits()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ControlCommand::Stop => "stop",
            ControlCommand::EmergencyStop => "emergency_stop",
            ControlCommand::SeekLimit { upper: true } => "seek_limit_up",
            ControlCommand::SeekLimit { upper: false } => "seek_limit_down",
            ControlCommand::ZeroOffset => "zero_offset",
            ControlCommand::Home { high: true } => "home_high",
            ControlCommand::Home { high: false } => "home_low",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_patterns() {
        assert_eq!(ControlCommand::Stop.pattern(), 0x1000);
        assert_eq!(ControlCommand::EmergencyStop.pattern(), 0x2000);
        assert_eq!(ControlCommand::SeekLimit { upper: true }.pattern(), 0x0010);
        assert_eq!(ControlCommand::SeekLimit { upper: false }.pattern(), 0x0020);
        assert_eq!(ControlCommand::ZeroOffset.pattern(), 0x0100);
        assert_eq!(ControlCommand::Home { high: true }.pattern(), 0x0800);
        assert_eq!(ControlCommand::Home { high: false }.pattern(), 0x0400);
        assert_eq!(ControlBits::ENABLE.bits(), 0x0004);
        assert_eq!(ControlBits::HOMING_MASK.bits(), 0x0C00);
    }

    #[test]
    fn direction_patterns_are_disjoint() {
        for (a, b) in [
            (
                ControlCommand::SeekLimit { upper: true },
                ControlCommand::SeekLimit { upper: false },
            ),
            (
                ControlCommand::Home { high: true },
                ControlCommand::Home { high: false },
            ),
        ] {
            assert_eq!(a.pattern() & b.pattern(), 0);
            assert_eq!(a.pattern().count_ones(), 1);
        }
    }

    #[test]
    fn set_field_preserves_other_bits() {
        for w in [0x0000u16, 0x1010, 0xFFFB, 0xABCD, 0xFFFF] {
            let on = set_field(w, 0x0004, true);
            assert!(read_field(on, 0x0004));
            assert_eq!(on & !0x0004, w & !0x0004);
            let off = set_field(w, 0x0004, false);
            assert!(!read_field(off, 0x0004));
            assert_eq!(off & !0x0004, w & !0x0004);
        }
        assert_eq!(set_field(0x0000, 0x0004, true), 0x0004);
        assert_eq!(set_field(0x0004, 0x0004, false), 0x0000);
    }

    #[test]
    fn homing_detection() {
        assert!(!homing_in_progress(0x0004));
        assert!(homing_in_progress(0x0400));
        assert!(homing_in_progress(0x0804));
        assert!(!homing_in_progress(0x1000));
    }
}
