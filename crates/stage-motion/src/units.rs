//! Conversions between device encodings and physical units.
//!
//! Every conversion is a pure function of [`MachineConstants`]. Integer results
//! round half away from zero and are range checked rather than saturated.

use crate::error::ConversionError;
use serde::{Deserialize, Serialize};

/// Milliseconds per minute.
const VELOCITY_CODE_SCALE: f64 = 60_000.0;

/// Mechanical and firmware constants of one axis.
///
/// Derived quantities are computed on demand so they can never drift from the
/// fields they come from.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMachineConstants", into = "RawMachineConstants")]
pub struct MachineConstants {
    resolution_default: u32,
    teeth: u32,
    position_per_rev_um: f64,
    kv: f64,
}

/// Unvalidated form of [`MachineConstants`] as it appears in config files.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RawMachineConstants {
    /// Microsteps per tooth.
    pub resolution_default: u32,
    pub teeth: u32,
    /// Travel per motor revolution (lead-screw pitch).
    pub position_per_rev_um: f64,
    /// Velocity scale factor of the firmware.
    pub kv: f64,
}

impl Default for MachineConstants {
    fn default() -> Self {
        Self {
            resolution_default: 76_800,
            teeth: 50,
            position_per_rev_um: 1_000.0,
            kv: 20.0,
        }
    }
}

impl TryFrom<RawMachineConstants> for MachineConstants {
    type Error = ConversionError;

    fn try_from(s: RawMachineConstants) -> Result<Self, Self::Error> {
        MachineConstants::new(s.resolution_default, s.teeth, s.position_per_rev_um, s.kv)
    }
}

impl From<MachineConstants> for RawMachineConstants {
    fn from(m: MachineConstants) -> Self {
        Self {
            resolution_default: m.resolution_default,
            teeth: m.teeth,
            position_per_rev_um: m.position_per_rev_um,
            kv: m.kv,
        }
    }
}

impl MachineConstants {
    pub fn new(
        resolution_default: u32,
        teeth: u32,
        position_per_rev_um: f64,
        kv: f64,
    ) -> Result<Self, ConversionError> {
        if resolution_default == 0 || teeth == 0 {
            return Err(ConversionError::InvalidConstants(
                "resolution and teeth must be non-zero",
            ));
        }
        if !position_per_rev_um.is_finite() || position_per_rev_um <= 0.0 {
            return Err(ConversionError::InvalidConstants(
                "position per revolution must be positive",
            ));
        }
        if !kv.is_finite() || kv <= 0.0 {
            return Err(ConversionError::InvalidConstants("kv must be positive"));
        }
        Ok(Self {
            resolution_default,
            teeth,
            position_per_rev_um,
            kv,
        })
    }

    pub fn resolution_default(&self) -> u32 {
        self.resolution_default
    }
    pub fn teeth(&self) -> u32 {
        self.teeth
    }
    pub fn position_per_rev_um(&self) -> f64 {
        self.position_per_rev_um
    }
    pub fn kv(&self) -> f64 {
        self.kv
    }

    pub fn pulses_per_rev(&self) -> f64 {
        (u64::from(self.resolution_default) * u64::from(self.teeth)) as f64
    }

    pub fn pulses_per_um(&self) -> f64 {
        self.pulses_per_rev() / self.position_per_rev_um
    }

    /// Largest |real - target| in pulses that still counts as "arrived".
    pub fn motion_tolerance_pulses(&self) -> f64 {
        self.pulses_per_um() / 2.0
    }

    // --- position ---

    pub fn pulses_to_um(&self, pulses: i64) -> f64 {
        pulses as f64 / self.pulses_per_um()
    }

    /// Interpret a raw 64-bit position register as two's complement.
    pub fn raw_position_to_um(&self, raw: u64) -> f64 {
        self.pulses_to_um(raw as i64)
    }

    pub fn um_to_pulses(&self, um: f64) -> Result<i64, ConversionError> {
        let pulses = finite(um)? * self.pulses_per_um();
        round_i64(pulses, "position")
    }

    // --- velocity ---

    /// Velocity-set code for a running speed; rejects negative speeds.
    pub fn rpm_to_code(&self, rpm: f64) -> Result<u16, ConversionError> {
        let rpm = finite(rpm)?;
        if rpm < 0.0 {
            return Err(ConversionError::OutOfRange {
                what: "rpm",
                value: rpm,
            });
        }
        let code = ((rpm * self.pulses_per_rev()) / (self.kv * VELOCITY_CODE_SCALE)).round();
        if code > f64::from(u16::MAX) {
            return Err(ConversionError::OutOfRange {
                what: "velocity code",
                value: code,
            });
        }
        Ok(code as u16)
    }

    pub fn code_to_rpm(&self, code: u16) -> f64 {
        self.signed_code_to_rpm(f64::from(code))
    }

    /// The realtime velocity register is signed; negative means moving down.
    pub fn realtime_code_to_rpm(&self, raw: u16) -> f64 {
        self.signed_code_to_rpm(f64::from(raw as i16))
    }

    fn signed_code_to_rpm(&self, code: f64) -> f64 {
        (code * self.kv * VELOCITY_CODE_SCALE) / self.pulses_per_rev()
    }

    /// RPM resolution of one velocity code step.
    pub fn rpm_per_code(&self) -> f64 {
        self.signed_code_to_rpm(1.0)
    }

    pub fn rpm_to_um_per_s(&self, rpm: f64) -> f64 {
        (rpm / 60.0) * self.position_per_rev_um
    }

    pub fn um_per_s_to_rpm(&self, um_per_s: f64) -> f64 {
        (um_per_s * 60.0) / self.position_per_rev_um
    }

    // --- minimum step ---

    pub fn step_raw_to_um(&self, raw: u32) -> f64 {
        f64::from(raw) / self.pulses_per_um()
    }

    pub fn step_um_to_raw(&self, um: f64) -> Result<u32, ConversionError> {
        let raw = (finite(um)? * self.pulses_per_um()).round();
        if raw < 0.0 || raw > f64::from(u32::MAX) {
            return Err(ConversionError::OutOfRange {
                what: "pulse step length",
                value: raw,
            });
        }
        Ok(raw as u32)
    }
}

fn finite(x: f64) -> Result<f64, ConversionError> {
    if x.is_finite() {
        Ok(x)
    } else {
        Err(ConversionError::NonFinite)
    }
}

fn round_i64(x: f64, what: &'static str) -> Result<i64, ConversionError> {
    let r = x.round();
    // i64::MAX is not representable; 2^63 is the first value past the range
    if r < -(2f64.powi(63)) || r >= 2f64.powi(63) {
        return Err(ConversionError::OutOfRange { what, value: r });
    }
    Ok(r as i64)
}
