//! Motion controller façade over the register map.
//!
//! The controller is synchronous and not internally locked: multi-register
//! sequences (enable read-modify-write, relative moves, velocity restore before
//! an absolute move) are only consistent if callers serialize access, e.g. by
//! wrapping the controller in a `Mutex` shared by the poller and the command
//! issuer.

use crate::config::StageConfig;
use crate::control::{homing_in_progress, set_field, ControlBits, ControlCommand};
use crate::error::{ConversionError, MotionError, Result};
use crate::metrics::MetricsHub;
use crate::registers::{self, Register};
use crate::units::MachineConstants;
use register_transport::{DeviceSession, RegisterBus, TransportError};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Speeds below this magnitude (µm/s) are treated as "stop" by [`MotionController::set_velocity`].
pub const JOG_DEADBAND_UM_S: f64 = 0.001;
/// Target used to emulate continuous jog motion: far enough to never be reached.
pub const JOG_TARGET_UM: f64 = 100_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Authorizing,
    Connected,
}

/// Content of the error-code register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultStatus {
    Clear,
    /// Opaque device fault code, passed through unchanged.
    Fault(u16),
}

impl FaultStatus {
    pub fn code(self) -> u16 {
        match self {
            FaultStatus::Clear => 0,
            FaultStatus::Fault(c) => c,
        }
    }
}

/// One polling snapshot of the axis.
#[derive(Debug, Clone, Serialize)]
pub struct StageStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
    pub axis: String,
    pub position_um: f64,
    pub target_um: f64,
    pub velocity_um_s: f64,
    pub target_velocity_um_s: f64,
    pub fault: FaultStatus,
    pub motion_complete: bool,
    pub homing_complete: bool,
    pub current_a: f64,
    pub cpu_temp_c: i16,
}

pub struct MotionController<B> {
    bus: B,
    config: StageConfig,
    state: ConnectionState,
    default_target_velocity: Option<f64>,
    last_error: Option<String>,
    metrics: Option<MetricsHub>,
}

impl<B: RegisterBus> MotionController<B> {
    pub fn new(bus: B, config: StageConfig) -> Self {
        Self {
            bus,
            config,
            state: ConnectionState::Disconnected,
            default_target_velocity: None,
            last_error: None,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, hub: MetricsHub) -> Self {
        self.metrics = Some(hub);
        self
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }
    pub fn machine(&self) -> &MachineConstants {
        &self.config.machine
    }
    pub fn state(&self) -> ConnectionState {
        self.state
    }
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
    /// Speed captured from the device at connect time, restored before absolute moves.
    pub fn default_target_velocity(&self) -> Option<f64> {
        self.default_target_velocity
    }
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
    pub fn metrics(&self) -> Option<&MetricsHub> {
        self.metrics.as_ref()
    }
    pub fn transport(&self) -> &B {
        &self.bus
    }
    pub fn transport_mut(&mut self) -> &mut B {
        &mut self.bus
    }
    pub fn into_transport(self) -> B {
        self.bus
    }

    /// Drop back to Disconnected; the cached default velocity is forgotten.
    pub fn disconnect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            info!(axis = %self.config.name, "disconnected");
        }
        self.state = ConnectionState::Disconnected;
        self.default_target_velocity = None;
        if let Some(m) = &self.metrics {
            m.stage.connected.set(0);
        }
    }

    // --- position ---

    pub fn get_position(&mut self) -> Result<f64> {
        self.run(|c| {
            let raw = c.read_qword(registers::POSITION_REAL)?;
            Ok(c.machine().raw_position_to_um(raw))
        })
    }

    pub fn get_target_position(&mut self) -> Result<f64> {
        self.run(|c| {
            let raw = c.read_qword(registers::POSITION_TARGET)?;
            Ok(c.machine().raw_position_to_um(raw))
        })
    }

    /// Absolute move. Restores the connect-time speed first so that a prior
    /// jog does not leave the axis running at jog speed; a failed restore is
    /// logged and the move is still issued.
    pub fn set_target_position(&mut self, position_um: f64) -> Result<()> {
        self.run(|c| {
            let pulses = c.machine().um_to_pulses(position_um)?;
            if let Some(v) = c.default_target_velocity {
                if let Err(e) = c.write_target_velocity(v) {
                    warn!(axis = %c.config.name, error = %e, "default velocity restore failed");
                }
            }
            c.write_qword(registers::POSITION_TARGET, pulses as u64)
        })
    }

    /// Move by `delta_um` relative to the current target, not the current position.
    pub fn set_relative_position(&mut self, delta_um: f64) -> Result<()> {
        self.run(|c| {
            if !delta_um.is_finite() {
                return Err(ConversionError::NonFinite.into());
            }
            let target = c.get_target_position()?;
            c.set_target_position(target + delta_um)
        })
    }

    // --- velocity ---

    pub fn get_target_rpm(&mut self) -> Result<f64> {
        self.run(|c| {
            let code = c.read_word(registers::VELOCITY_SET)?;
            Ok(c.machine().code_to_rpm(code))
        })
    }

    pub fn set_target_rpm(&mut self, rpm: f64) -> Result<()> {
        self.run(|c| {
            let code = c.machine().rpm_to_code(rpm)?;
            c.write_word(registers::VELOCITY_SET, code)
        })
    }

    pub fn get_target_velocity(&mut self) -> Result<f64> {
        let rpm = self.get_target_rpm()?;
        Ok(self.machine().rpm_to_um_per_s(rpm))
    }

    pub fn set_target_velocity(&mut self, velocity_um_s: f64) -> Result<()> {
        self.run(|c| c.write_target_velocity(velocity_um_s))
    }

    /// Instantaneous speed reported by the drive, signed.
    pub fn get_velocity(&mut self) -> Result<f64> {
        self.run(|c| {
            let raw = c.read_word(registers::VELOCITY_REAL)?;
            let rpm = c.machine().realtime_code_to_rpm(raw);
            Ok(c.machine().rpm_to_um_per_s(rpm))
        })
    }

    /// Jog at a signed speed until stopped; `|v| < 0.001` stops the axis.
    ///
    /// The far target is written directly instead of through
    /// [`set_target_position`](Self::set_target_position), which would
    /// restore the default speed and override the jog speed set here.
    pub fn set_velocity(&mut self, velocity_um_s: f64) -> Result<()> {
        self.run(|c| {
            if !velocity_um_s.is_finite() {
                return Err(ConversionError::NonFinite.into());
            }
            if velocity_um_s.abs() < JOG_DEADBAND_UM_S {
                return c.stop_motion();
            }
            c.write_target_velocity(velocity_um_s.abs())?;
            let target = JOG_TARGET_UM.copysign(velocity_um_s);
            let pulses = c.machine().um_to_pulses(target)?;
            c.write_qword(registers::POSITION_TARGET, pulses as u64)
        })
    }

    // --- control word ---

    pub fn stop_motion(&mut self) -> Result<()> {
        self.run(|c| c.send_command(ControlCommand::Stop))
    }

    /// Written blind, without reading the control word first.
    pub fn emergency_stop(&mut self) -> Result<()> {
        self.run(|c| c.send_command(ControlCommand::EmergencyStop))
    }

    /// Read-modify-write of the ENABLE bit; other latched bits are preserved.
    pub fn set_enable(&mut self, enable: bool) -> Result<()> {
        self.run(|c| {
            let word = c.read_word(registers::CONTROL)?;
            let next = set_field(word, ControlBits::ENABLE.bits(), enable);
            debug!(from = word, to = next, enable, "control word update");
            c.write_word(registers::CONTROL, next)
        })
    }

    pub fn move_to_limit(&mut self, to_upper: bool) -> Result<()> {
        self.run(|c| c.send_command(ControlCommand::SeekLimit { upper: to_upper }))
    }

    /// Make the current position the new origin.
    pub fn set_curr_position_to_zero(&mut self) -> Result<()> {
        self.run(|c| c.send_command(ControlCommand::ZeroOffset))
    }

    /// Start a homing cycle; poll [`is_homing_complete`](Self::is_homing_complete).
    pub fn find_reference(&mut self, to_high: bool) -> Result<()> {
        self.run(|c| c.send_command(ControlCommand::Home { high: to_high }))
    }

    // --- status ---

    pub fn is_motion_complete(&mut self) -> Result<bool> {
        self.run(|c| {
            let real = c.read_qword(registers::POSITION_REAL)? as i64;
            let target = c.read_qword(registers::POSITION_TARGET)? as i64;
            let diff = (i128::from(real) - i128::from(target)).unsigned_abs();
            Ok((diff as f64) < c.machine().motion_tolerance_pulses())
        })
    }

    pub fn is_homing_complete(&mut self) -> Result<bool> {
        self.run(|c| {
            let word = c.read_word(registers::CONTROL)?;
            Ok(!homing_in_progress(word))
        })
    }

    pub fn check_error(&mut self) -> Result<FaultStatus> {
        self.run(|c| {
            let code = c.read_word(registers::ERROR_CODE)?;
            Ok(match code {
                0 => FaultStatus::Clear,
                n => FaultStatus::Fault(n),
            })
        })
    }

    /// Integer form of [`check_error`](Self::check_error): 0 healthy, positive
    /// device fault code, -1 when the register could not be read.
    pub fn error_code(&mut self) -> i32 {
        match self.check_error() {
            Ok(f) => i32::from(f.code()),
            Err(_) => -1,
        }
    }

    pub fn ensure_no_fault(&mut self) -> Result<()> {
        match self.check_error()? {
            FaultStatus::Clear => Ok(()),
            FaultStatus::Fault(code) => {
                let err = MotionError::DeviceFault(code);
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    // --- raw pulse access ---

    pub fn get_pulse_position(&mut self) -> Result<i32> {
        self.run(|c| Ok(c.read_dword(registers::PULSE_POSITION_REAL)? as i32))
    }

    pub fn set_target_pulse_position(&mut self, pulses: i32) -> Result<()> {
        self.run(|c| c.write_dword(registers::PULSE_POSITION_TARGET, pulses as u32))
    }

    // --- drive info ---

    /// Motor current in amperes (0.01 A per LSB).
    pub fn get_real_time_current(&mut self) -> Result<f64> {
        self.run(|c| Ok(f64::from(c.read_word(registers::CURRENT_REAL)?) / 100.0))
    }

    pub fn get_cpu_temperature(&mut self) -> Result<i16> {
        self.run(|c| Ok(c.read_word(registers::CPU_TEMPERATURE)? as i16))
    }

    pub fn get_tooth_resolution(&mut self) -> Result<u32> {
        self.run(|c| c.read_dword(registers::TOOTH_RESOLUTION))
    }

    pub fn get_pulse_step_length(&mut self) -> Result<u32> {
        self.run(|c| c.read_dword(registers::PULSE_STEP_LENGTH))
    }

    pub fn set_pulse_step_length(&mut self, length: u32) -> Result<()> {
        self.run(|c| c.write_dword(registers::PULSE_STEP_LENGTH, length))
    }

    pub fn get_min_step_um(&mut self) -> Result<f64> {
        let raw = self.get_pulse_step_length()?;
        Ok(self.machine().step_raw_to_um(raw))
    }

    /// Steps below half a pulse would round to a zero step length and are rejected.
    pub fn set_min_step_um(&mut self, step_um: f64) -> Result<()> {
        self.run(|c| {
            let raw = c.machine().step_um_to_raw(step_um)?;
            if step_um <= 0.0 || raw == 0 {
                return Err(ConversionError::OutOfRange {
                    what: "minimum step",
                    value: step_um,
                }
                .into());
            }
            c.write_dword(registers::PULSE_STEP_LENGTH, raw)
        })
    }

    /// Read everything a status display needs in one pass.
    pub fn status(&mut self) -> Result<StageStatus> {
        let position_um = self.get_position()?;
        let target_um = self.get_target_position()?;
        let velocity_um_s = self.get_velocity()?;
        let target_velocity_um_s = self.get_target_velocity()?;
        let fault = self.check_error()?;
        let motion_complete = self.is_motion_complete()?;
        let homing_complete = self.is_homing_complete()?;
        let current_a = self.get_real_time_current()?;
        let cpu_temp_c = self.get_cpu_temperature()?;
        Ok(StageStatus {
            ts: time::OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .ok(),
            axis: self.config.name.clone(),
            position_um,
            target_um,
            velocity_um_s,
            target_velocity_um_s,
            fault,
            motion_complete,
            homing_complete,
            current_a,
            cpu_temp_c,
        })
    }

    // --- internals ---

    /// Connected check, then `op`; any error becomes the last error.
    fn run<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = if self.is_connected() {
            op(self)
        } else {
            Err(MotionError::NotConnected)
        };
        if let Err(e) = &result {
            self.last_error = Some(e.to_string());
        }
        result
    }

    fn write_target_velocity(&mut self, velocity_um_s: f64) -> Result<()> {
        let rpm = self.machine().um_per_s_to_rpm(velocity_um_s);
        let code = self.machine().rpm_to_code(rpm)?;
        self.write_word(registers::VELOCITY_SET, code)
    }

    fn send_command(&mut self, cmd: ControlCommand) -> Result<()> {
        debug!(axis = %self.config.name, command = cmd.as_str(), "control command");
        self.write_word(registers::CONTROL, cmd.pattern())?;
        if let Some(m) = &self.metrics {
            m.stage.commands.with_label_values(&[cmd.as_str()]).inc();
        }
        Ok(())
    }

    fn count<T>(&self, write: bool, r: &Result<T, TransportError>) {
        let Some(m) = &self.metrics else {
            return;
        };
        match (r, write) {
            (Err(_), _) => m.stage.transport_errors.inc(),
            (Ok(_), true) => m.stage.register_writes.inc(),
            (Ok(_), false) => m.stage.register_reads.inc(),
        }
    }

    fn read_word(&mut self, reg: Register) -> Result<u16> {
        let r = self
            .bus
            .read_word(self.config.station, reg.address, self.config.timeout);
        self.count(false, &r);
        debug!(register = reg.name, ok = r.is_ok(), "read word");
        Ok(r?)
    }

    fn read_dword(&mut self, reg: Register) -> Result<u32> {
        let r = self
            .bus
            .read_dword(self.config.station, reg.address, self.config.timeout);
        self.count(false, &r);
        debug!(register = reg.name, ok = r.is_ok(), "read dword");
        Ok(r?)
    }

    fn read_qword(&mut self, reg: Register) -> Result<u64> {
        let r = self
            .bus
            .read_qword(self.config.station, reg.address, self.config.timeout);
        self.count(false, &r);
        debug!(register = reg.name, ok = r.is_ok(), "read qword");
        Ok(r?)
    }

    fn write_word(&mut self, reg: Register, value: u16) -> Result<()> {
        let r = self
            .bus
            .write_word(self.config.station, reg.address, value, self.config.timeout);
        self.count(true, &r);
        debug!(register = reg.name, value, ok = r.is_ok(), "write word");
        Ok(r?)
    }

    fn write_dword(&mut self, reg: Register, value: u32) -> Result<()> {
        let r = self
            .bus
            .write_dword(self.config.station, reg.address, value, self.config.timeout);
        self.count(true, &r);
        debug!(register = reg.name, value, ok = r.is_ok(), "write dword");
        Ok(r?)
    }

    fn write_qword(&mut self, reg: Register, value: u64) -> Result<()> {
        let r = self
            .bus
            .write_qword(self.config.station, reg.address, value, self.config.timeout);
        self.count(true, &r);
        debug!(register = reg.name, value = value as i64, ok = r.is_ok(), "write qword");
        Ok(r?)
    }
}

impl<B: RegisterBus + DeviceSession> MotionController<B> {
    /// Authorize, validate the link, then cache the device's running speed.
    ///
    /// All or nothing: any failing step leaves the controller Disconnected
    /// with the reason in [`last_error`](Self::last_error).
    pub fn connect(&mut self) -> Result<()> {
        self.state = ConnectionState::Authorizing;
        self.default_target_velocity = None;

        if !self.bus.set_serial(self.config.license_key.as_bytes()) {
            return self.fail_connect(MotionError::Authorization("license key rejected".into()));
        }
        if !self.bus.is_valid(true) {
            return self.fail_connect(MotionError::Transport(TransportError::Rejected(
                "device session is not valid".into(),
            )));
        }

        self.state = ConnectionState::Connected;
        self.last_error = None;
        if let Some(m) = &self.metrics {
            m.stage.connected.set(1);
        }
        info!(axis = %self.config.name, station = %self.config.station, "connected");

        match self.get_target_velocity() {
            Ok(v) if v > JOG_DEADBAND_UM_S => {
                info!(velocity_um_s = v, "default target velocity saved");
                self.default_target_velocity = Some(v);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not read default target velocity"),
        }
        Ok(())
    }

    fn fail_connect(&mut self, err: MotionError) -> Result<()> {
        warn!(axis = %self.config.name, error = %err, "connect failed");
        self.state = ConnectionState::Disconnected;
        self.last_error = Some(err.to_string());
        if let Some(m) = &self.metrics {
            m.stage.connected.set(0);
        }
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use register_transport::{MockBus, RegWidth, StationId};

    const ST: StationId = registers::DEFAULT_STATION;

    fn fine_config() -> StageConfig {
        StageConfig {
            machine: MachineConstants::new(640_000, 50, 1_000.0, 20.0).unwrap_or_default(),
            ..StageConfig::default()
        }
    }

    fn connected(bus: MockBus, config: StageConfig) -> MotionController<MockBus> {
        let mut ctl = MotionController::new(bus, config);
        assert!(ctl.connect().is_ok());
        ctl.transport_mut().clear_writes();
        ctl
    }

    fn control_writes(ctl: &MotionController<MockBus>) -> Vec<u64> {
        ctl.transport()
            .writes()
            .iter()
            .filter(|w| w.address == registers::CONTROL.address)
            .map(|w| w.value)
            .collect()
    }

    #[test]
    fn not_connected_fails_without_bus_traffic() {
        let mut ctl = MotionController::new(MockBus::default(), StageConfig::default());
        assert!(matches!(ctl.get_position(), Err(MotionError::NotConnected)));
        assert!(matches!(ctl.stop_motion(), Err(MotionError::NotConnected)));
        assert_eq!(ctl.error_code(), -1);
        assert_eq!(ctl.transport().read_count(), 0);
        assert!(ctl.transport().writes().is_empty());
        assert!(ctl.last_error().is_some());
    }

    #[test]
    fn connect_caches_default_velocity() {
        let mut bus = MockBus::default();
        // 192 -> 60 rpm -> 1000 um/s with the default constants
        bus.set_word(ST, registers::VELOCITY_SET.address, 192);
        let mut ctl = MotionController::new(bus, StageConfig::default());
        assert!(ctl.connect().is_ok());
        assert_eq!(ctl.state(), ConnectionState::Connected);
        assert_eq!(ctl.default_target_velocity(), Some(1_000.0));
        assert!(ctl.last_error().is_none());
    }

    #[test]
    fn connect_without_running_speed_caches_nothing() {
        let mut ctl = connected(MockBus::default(), StageConfig::default());
        assert_eq!(ctl.default_target_velocity(), None);
        ctl.disconnect();
        assert_eq!(ctl.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn connect_rejections() {
        let mut bus = MockBus::default();
        bus.set_accept_serial(false);
        let mut ctl = MotionController::new(bus, StageConfig::default());
        assert!(matches!(ctl.connect(), Err(MotionError::Authorization(_))));
        assert_eq!(ctl.state(), ConnectionState::Disconnected);

        let mut bus = MockBus::default();
        bus.set_link_ok(false);
        let mut ctl = MotionController::new(bus, StageConfig::default());
        assert!(matches!(ctl.connect(), Err(MotionError::Transport(_))));
        assert!(!ctl.is_connected());
        assert!(ctl.last_error().is_some());
    }

    #[test]
    fn connect_survives_unreadable_velocity() {
        let mut bus = MockBus::default();
        bus.fail_reads_at(registers::VELOCITY_SET.address);
        let mut ctl = MotionController::new(bus, StageConfig::default());
        assert!(ctl.connect().is_ok());
        assert!(ctl.is_connected());
        assert_eq!(ctl.default_target_velocity(), None);
    }

    #[test]
    fn position_read_and_write() -> Result<()> {
        let mut bus = MockBus::default();
        bus.set_qword(ST, registers::POSITION_REAL.address, (-320_000i64) as u64);
        let mut ctl = connected(bus, fine_config());
        assert_eq!(ctl.get_position()?, -10.0);

        ctl.set_target_position(10.0)?;
        let w = ctl.transport().writes();
        assert_eq!(w.len(), 1);
        assert_eq!(w[0].address, registers::POSITION_TARGET.address);
        assert_eq!(w[0].width, RegWidth::QWord);
        assert_eq!(w[0].value, 320_000);
        assert_eq!(ctl.get_target_position()?, 10.0);
        Ok(())
    }

    #[test]
    fn absolute_move_restores_default_velocity_first() -> Result<()> {
        let mut bus = MockBus::default();
        bus.set_word(ST, registers::VELOCITY_SET.address, 192);
        let mut ctl = connected(bus, StageConfig::default());
        ctl.set_target_position(5.0)?;
        let w = ctl.transport().writes();
        assert_eq!(w.len(), 2);
        assert_eq!(w[0].address, registers::VELOCITY_SET.address);
        assert_eq!(w[0].value, 192);
        assert_eq!(w[1].address, registers::POSITION_TARGET.address);
        Ok(())
    }

    #[test]
    fn failed_restore_does_not_block_move() -> Result<()> {
        let mut bus = MockBus::default();
        bus.set_word(ST, registers::VELOCITY_SET.address, 192);
        let mut ctl = connected(bus, StageConfig::default());
        ctl.transport_mut()
            .fail_writes_at(registers::VELOCITY_SET.address);
        ctl.set_target_position(1.0)?;
        let w = ctl.transport().writes();
        assert_eq!(w.len(), 1);
        assert_eq!(w[0].address, registers::POSITION_TARGET.address);
        Ok(())
    }

    #[test]
    fn non_finite_target_is_rejected_before_any_write() {
        let mut bus = MockBus::default();
        bus.set_word(ST, registers::VELOCITY_SET.address, 192);
        let mut ctl = connected(bus, StageConfig::default());
        assert!(matches!(
            ctl.set_target_position(f64::NAN),
            Err(MotionError::Conversion(ConversionError::NonFinite))
        ));
        assert!(ctl.transport().writes().is_empty());
    }

    #[test]
    fn relative_move_is_from_target() -> Result<()> {
        let mut bus = MockBus::default();
        bus.set_qword(ST, registers::POSITION_REAL.address, 0);
        bus.set_qword(ST, registers::POSITION_TARGET.address, 32_000 * 100);
        let mut ctl = connected(bus, fine_config());
        ctl.set_relative_position(-25.0)?;
        assert_eq!(ctl.get_target_position()?, 75.0);
        Ok(())
    }

    #[test]
    fn target_rpm_codes() -> Result<()> {
        let mut ctl = connected(MockBus::default(), StageConfig::default());
        ctl.set_target_rpm(60.0)?;
        assert_eq!(ctl.transport().word(ST, registers::VELOCITY_SET.address), 192);
        assert_eq!(ctl.get_target_rpm()?, 60.0);
        assert_eq!(ctl.get_target_velocity()?, 1_000.0);
        assert!(matches!(
            ctl.set_target_rpm(-5.0),
            Err(MotionError::Conversion(ConversionError::OutOfRange { .. }))
        ));
        Ok(())
    }

    #[test]
    fn realtime_velocity_is_signed() -> Result<()> {
        let mut bus = MockBus::default();
        bus.set_word(ST, registers::VELOCITY_REAL.address, (-192i16) as u16);
        let mut ctl = connected(bus, StageConfig::default());
        assert_eq!(ctl.get_velocity()?, -1_000.0);
        Ok(())
    }

    #[test]
    fn zero_velocity_stops() -> Result<()> {
        let mut ctl = connected(MockBus::default(), StageConfig::default());
        ctl.set_velocity(0.0)?;
        ctl.set_velocity(0.0005)?;
        let w = ctl.transport().writes();
        assert_eq!(w.len(), 2);
        assert!(w.iter().all(|r| r.address == registers::CONTROL.address
            && r.value == u64::from(ControlBits::STOP.bits())));
        Ok(())
    }

    #[test]
    fn deadband_boundary_jogs() -> Result<()> {
        let mut ctl = connected(MockBus::default(), StageConfig::default());
        ctl.set_velocity(JOG_DEADBAND_UM_S)?;
        let addrs: Vec<u16> = ctl.transport().writes().iter().map(|w| w.address).collect();
        assert_eq!(
            addrs,
            vec![registers::VELOCITY_SET.address, registers::POSITION_TARGET.address]
        );
        assert!(control_writes(&ctl).is_empty());
        Ok(())
    }

    #[test]
    fn jog_writes_speed_then_far_target_without_restore() -> Result<()> {
        let mut bus = MockBus::default();
        bus.set_word(ST, registers::VELOCITY_SET.address, 192);
        let mut ctl = connected(bus, StageConfig::default());
        ctl.set_velocity(-500.0)?;
        let w = ctl.transport().writes().to_vec();
        assert_eq!(w.len(), 2);
        // 500 um/s = 30 rpm = code 96, not the cached 192
        assert_eq!(w[0].address, registers::VELOCITY_SET.address);
        assert_eq!(w[0].value, 96);
        assert_eq!(w[1].address, registers::POSITION_TARGET.address);
        let target = ctl.machine().pulses_to_um(w[1].value as i64);
        assert_eq!(target, -JOG_TARGET_UM);
        assert!(control_writes(&ctl).is_empty());
        Ok(())
    }

    #[test]
    fn enable_is_read_modify_write() -> Result<()> {
        let mut ctl = connected(MockBus::default(), StageConfig::default());
        ctl.set_enable(true)?;
        assert_eq!(ctl.transport().word(ST, registers::CONTROL.address), 0x0004);
        ctl.set_enable(false)?;
        assert_eq!(ctl.transport().word(ST, registers::CONTROL.address), 0x0000);

        ctl.transport_mut()
            .set_word(ST, registers::CONTROL.address, 0x0800);
        ctl.set_enable(true)?;
        assert_eq!(ctl.transport().word(ST, registers::CONTROL.address), 0x0804);
        Ok(())
    }

    #[test]
    fn fire_and_forget_commands_write_exact_patterns() -> Result<()> {
        let mut bus = MockBus::default();
        bus.set_word(ST, registers::CONTROL.address, 0x0004);
        let mut ctl = connected(bus, StageConfig::default());
        let reads_before = ctl.transport().read_count();
        ctl.move_to_limit(true)?;
        ctl.move_to_limit(false)?;
        ctl.stop_motion()?;
        ctl.emergency_stop()?;
        ctl.set_curr_position_to_zero()?;
        ctl.find_reference(true)?;
        ctl.find_reference(false)?;
        assert_eq!(
            control_writes(&ctl),
            vec![0x0010, 0x0020, 0x1000, 0x2000, 0x0100, 0x0800, 0x0400]
        );
        assert_eq!(ctl.transport().read_count(), reads_before);
        Ok(())
    }

    #[test]
    fn motion_complete_threshold_is_strict() -> Result<()> {
        // 32000 pulses/um -> tolerance 16000 pulses
        let mut ctl = connected(MockBus::default(), fine_config());
        let set = |ctl: &mut MotionController<MockBus>, real: i64, target: i64| {
            let bus = ctl.transport_mut();
            bus.set_qword(ST, registers::POSITION_REAL.address, real as u64);
            bus.set_qword(ST, registers::POSITION_TARGET.address, target as u64);
        };
        set(&mut ctl, 0, 15_999);
        assert!(ctl.is_motion_complete()?);
        set(&mut ctl, 0, 16_000);
        assert!(!ctl.is_motion_complete()?);
        set(&mut ctl, -16_000, 0);
        assert!(!ctl.is_motion_complete()?);
        set(&mut ctl, i64::MIN, i64::MAX);
        assert!(!ctl.is_motion_complete()?);
        Ok(())
    }

    #[test]
    fn homing_completion_follows_latched_bits() -> Result<()> {
        let mut ctl = connected(MockBus::default(), StageConfig::default());
        ctl.find_reference(false)?;
        assert!(!ctl.is_homing_complete()?);
        ctl.transport_mut()
            .set_word(ST, registers::CONTROL.address, 0x0004);
        assert!(ctl.is_homing_complete()?);
        Ok(())
    }

    #[test]
    fn fault_reporting() -> Result<()> {
        let mut ctl = connected(MockBus::default(), StageConfig::default());
        assert_eq!(ctl.check_error()?, FaultStatus::Clear);
        assert_eq!(ctl.error_code(), 0);
        assert!(ctl.ensure_no_fault().is_ok());

        ctl.transport_mut()
            .set_word(ST, registers::ERROR_CODE.address, 0x0031);
        assert_eq!(ctl.check_error()?, FaultStatus::Fault(0x31));
        assert_eq!(ctl.error_code(), 0x31);
        assert!(matches!(
            ctl.ensure_no_fault(),
            Err(MotionError::DeviceFault(0x31))
        ));

        ctl.transport_mut().set_offline(true);
        assert_eq!(ctl.error_code(), -1);
        Ok(())
    }

    #[test]
    fn transport_failure_is_recorded() {
        let mut ctl = connected(MockBus::default(), StageConfig::default());
        ctl.transport_mut()
            .fail_reads_at(registers::POSITION_REAL.address);
        let err = ctl.get_position();
        assert!(matches!(
            err,
            Err(MotionError::Transport(TransportError::Timeout))
        ));
        assert!(ctl.last_error().is_some_and(|e| e.contains("timeout")));
    }

    #[test]
    fn drive_info_registers() -> Result<()> {
        let mut bus = MockBus::default();
        bus.set_word(ST, registers::CURRENT_REAL.address, 150);
        bus.set_word(ST, registers::CPU_TEMPERATURE.address, (-5i16) as u16);
        bus.set_dword(ST, registers::TOOTH_RESOLUTION.address, 640_000);
        bus.set_dword(ST, registers::PULSE_POSITION_REAL.address, (-42i32) as u32);
        let mut ctl = connected(bus, fine_config());
        assert_eq!(ctl.get_real_time_current()?, 1.5);
        assert_eq!(ctl.get_cpu_temperature()?, -5);
        assert_eq!(ctl.get_tooth_resolution()?, 640_000);
        assert_eq!(ctl.get_pulse_position()?, -42);

        ctl.set_target_pulse_position(-7)?;
        let w = ctl.transport().writes();
        assert_eq!(w[0].address, registers::PULSE_POSITION_TARGET.address);
        assert_eq!(w[0].width, RegWidth::DWord);
        assert_eq!(w[0].value as u32 as i32, -7);
        Ok(())
    }

    #[test]
    fn minimum_step() -> Result<()> {
        let mut ctl = connected(MockBus::default(), fine_config());
        ctl.set_min_step_um(0.5)?;
        assert_eq!(ctl.get_pulse_step_length()?, 16_000);
        assert_eq!(ctl.get_min_step_um()?, 0.5);
        assert!(ctl.set_min_step_um(0.0).is_err());
        assert!(ctl.set_min_step_um(-1.0).is_err());
        ctl.set_pulse_step_length(32_000)?;
        ctl.transport_mut().clear_writes();
        // 1e-5 um is 0.32 pulses here and would round to a zero step length
        assert!(matches!(
            ctl.set_min_step_um(1.0e-5),
            Err(MotionError::Conversion(ConversionError::OutOfRange { .. }))
        ));
        assert!(ctl.transport().writes().is_empty());
        assert_eq!(ctl.get_min_step_um()?, 1.0);
        Ok(())
    }

    #[test]
    fn status_snapshot_serializes() -> anyhow::Result<()> {
        let mut bus = MockBus::default();
        bus.set_word(ST, registers::VELOCITY_SET.address, 192);
        let mut ctl = connected(bus, StageConfig::default());
        let status = ctl.status()?;
        assert_eq!(status.axis, "axis0");
        assert_eq!(status.target_velocity_um_s, 1_000.0);
        assert!(status.motion_complete);
        assert!(status.homing_complete);
        let json = serde_json::to_value(&status)?;
        assert_eq!(json["fault"], "clear");
        assert!(json.get("ts").is_some());
        Ok(())
    }

    #[test]
    fn metrics_track_traffic() -> anyhow::Result<()> {
        let hub = MetricsHub::new().map_err(anyhow::Error::msg)?;
        let mut ctl =
            MotionController::new(MockBus::default(), StageConfig::default()).with_metrics(hub);
        ctl.connect()?;
        ctl.stop_motion()?;
        ctl.transport_mut().set_offline(true);
        assert!(ctl.get_position().is_err());
        let m = ctl.metrics().map(|h| h.stage.clone());
        let m = m.ok_or_else(|| anyhow::anyhow!("metrics missing"))?;
        assert_eq!(m.connected.get(), 1);
        assert_eq!(m.register_writes.get(), 1);
        assert_eq!(m.transport_errors.get(), 1);
        assert_eq!(m.commands.with_label_values(&["stop"]).get(), 1);
        ctl.disconnect();
        assert_eq!(m.connected.get(), 0);
        Ok(())
    }

    #[test]
    fn failed_reconnect_clears_connected_gauge() -> anyhow::Result<()> {
        let hub = MetricsHub::new().map_err(anyhow::Error::msg)?;
        let gauge = hub.stage.connected.clone();
        let mut ctl =
            MotionController::new(MockBus::default(), StageConfig::default()).with_metrics(hub);
        ctl.connect()?;
        assert_eq!(gauge.get(), 1);
        ctl.transport_mut().set_link_ok(false);
        assert!(ctl.connect().is_err());
        assert_eq!(ctl.state(), ConnectionState::Disconnected);
        assert_eq!(gauge.get(), 0);
        Ok(())
    }
}
