//! register-transport: blocking register access for Modbus-RTU style devices
//!
//! This crate provides traits and types for reading and writing 16/32/64-bit
//! registers at a (station, address) pair, with feature-gated backends. The
//! default build enables a `mock` backend so that binaries can compile and be
//! tested on any host without a serial adapter.

mod types;
pub use types::{
    dword_to_words, qword_to_words, words_to_dword, words_to_qword, BusInfo, Parity, RegWidth,
    SerialParams, StationId, Timeout,
};

mod error;
pub use error::{Result, TransportError};

mod traits;
pub use traits::{DeviceSession, RegisterBus, MAX_READ_WORDS, MAX_WRITE_WORDS};

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockBus, WriteRecord};

#[cfg(feature = "rtu")]
mod rtu;

#[cfg(feature = "rtu")]
pub use rtu::{
    crc16, encode_read_request, encode_write_request, parse_read_response, parse_write_response,
    RtuBus,
};
