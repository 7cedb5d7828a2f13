use thiserror::Error;

pub type Result<T, E = TransportError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),
    #[error("operation not supported on this backend: {0}")]
    Unsupported(&'static str),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("timeout")]
    Timeout,
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    #[error("CRC mismatch: expected {expected:#06x}, received {received:#06x}")]
    Crc { expected: u16, received: u16 },
    #[error("device exception code {0:#04x}")]
    Exception(u8),
    #[error("invalid station id: {0}")]
    InvalidStation(u8),
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// True when the failure is a missing response rather than a bad one.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}
