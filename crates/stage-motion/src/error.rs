use register_transport::TransportError;
use thiserror::Error;

pub type Result<T, E = MotionError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum MotionError {
    #[error("controller not connected")]
    NotConnected,
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("device fault code {0}")]
    DeviceFault(u16),
    #[error("authorization failed: {0}")]
    Authorization(String),
    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionError {
    #[error("value is not finite")]
    NonFinite,
    #[error("{what} out of range: {value}")]
    OutOfRange { what: &'static str, value: f64 },
    #[error("invalid machine constants: {0}")]
    InvalidConstants(&'static str),
}
