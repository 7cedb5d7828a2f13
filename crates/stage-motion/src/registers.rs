//! Fixed register map of the stage driver.
//!
//! Multi-word registers occupy consecutive addresses, least significant word
//! first. Signed registers hold two's-complement values.

use register_transport::{RegWidth, StationId};
use serde::Serialize;

/// Station the driver answers on unless configured otherwise.
pub const DEFAULT_STATION: StationId = match StationId::new(1) {
    Some(s) => s,
    None => StationId::BROADCAST,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct Register {
    pub name: &'static str,
    pub address: u16,
    pub width: RegWidth,
    pub signed: bool,
}

impl Register {
    const fn new(name: &'static str, address: u16, width: RegWidth, signed: bool) -> Self {
        Self {
            name,
            address,
            width,
            signed,
        }
    }
}

/// Control word: enable, stop, e-stop, homing, limit seek, zero offset.
pub const CONTROL: Register = Register::new("control", 0x0000, RegWidth::Word, false);
/// Fault code, 0 when healthy.
pub const ERROR_CODE: Register = Register::new("error_code", 0x0002, RegWidth::Word, false);
/// Motor current, 0.01 A per LSB.
pub const CURRENT_REAL: Register = Register::new("current_real", 0x0015, RegWidth::Word, false);
pub const POSITION_REAL: Register = Register::new("position_real", 0x0020, RegWidth::QWord, true);
pub const POSITION_TARGET: Register =
    Register::new("position_target", 0x0024, RegWidth::QWord, true);
/// Microsteps per tooth.
pub const TOOTH_RESOLUTION: Register =
    Register::new("tooth_resolution", 0x0028, RegWidth::DWord, false);
pub const PULSE_STEP_LENGTH: Register =
    Register::new("pulse_step_length", 0x002A, RegWidth::DWord, false);
pub const PULSE_POSITION_REAL: Register =
    Register::new("pulse_position_real", 0x002C, RegWidth::DWord, true);
pub const PULSE_POSITION_TARGET: Register =
    Register::new("pulse_position_target", 0x002E, RegWidth::DWord, true);
/// Running speed setpoint as a device velocity code.
pub const VELOCITY_SET: Register = Register::new("velocity_set", 0x0040, RegWidth::Word, false);
pub const VELOCITY_REAL: Register = Register::new("velocity_real", 0x0045, RegWidth::Word, true);
/// Driver CPU temperature in °C.
pub const CPU_TEMPERATURE: Register =
    Register::new("cpu_temperature", 0x0300, RegWidth::Word, true);

/// Every register the controller touches, in address order.
pub const ALL: [Register; 12] = [
    CONTROL,
    ERROR_CODE,
    CURRENT_REAL,
    POSITION_REAL,
    POSITION_TARGET,
    TOOTH_RESOLUTION,
    PULSE_STEP_LENGTH,
    PULSE_POSITION_REAL,
    PULSE_POSITION_TARGET,
    VELOCITY_SET,
    VELOCITY_REAL,
    CPU_TEMPERATURE,
];

pub fn by_name(name: &str) -> Option<Register> {
    ALL.iter().copied().find(|r| r.name == name)
}
