//! stage-motion: register map, unit conversions and the motion controller for
//! single-axis stages driven over a [`register_transport::RegisterBus`].

mod error;
pub use error::{ConversionError, MotionError, Result};

pub mod control;
pub use control::{read_field, set_field, ControlBits, ControlCommand};

pub mod registers;
pub use registers::Register;

pub mod units;
pub use units::{MachineConstants, RawMachineConstants};

mod config;
pub use config::{load_config_file, load_config_str, load_configs_dir, StageConfig, StageRegistry};

mod metrics;
pub use metrics::{MetricsHub, StageMetrics};

mod controller;
pub use controller::{
    ConnectionState, FaultStatus, MotionController, StageStatus, JOG_DEADBAND_UM_S, JOG_TARGET_UM,
};
