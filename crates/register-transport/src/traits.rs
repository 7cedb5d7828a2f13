use crate::{BusInfo, Result, StationId, Timeout, TransportError};

/// Most registers a single multi-word read may cover.
pub const MAX_READ_WORDS: usize = 125;
/// Most registers a single multi-word write may cover.
pub const MAX_WRITE_WORDS: usize = 123;

/// A minimal blocking register bus interface.
///
/// Every call blocks until the device answers or `timeout` expires.
/// Multi-word values are transferred least significant word first.
pub trait RegisterBus {
    fn read_word(&mut self, station: StationId, address: u16, timeout: Timeout) -> Result<u16>;

    fn read_dword(&mut self, station: StationId, address: u16, timeout: Timeout) -> Result<u32>;

    fn read_qword(&mut self, station: StationId, address: u16, timeout: Timeout) -> Result<u64>;

    fn write_word(
        &mut self,
        station: StationId,
        address: u16,
        value: u16,
        timeout: Timeout,
    ) -> Result<()>;

    fn write_dword(
        &mut self,
        station: StationId,
        address: u16,
        value: u32,
        timeout: Timeout,
    ) -> Result<()>;

    fn write_qword(
        &mut self,
        station: StationId,
        address: u16,
        value: u64,
        timeout: Timeout,
    ) -> Result<()>;

    /// Read `buf.len()` consecutive registers if supported.
    fn read_words(
        &mut self,
        _station: StationId,
        _address: u16,
        _buf: &mut [u16],
        _timeout: Timeout,
    ) -> Result<()> {
        Err(TransportError::Unsupported("multi-word read not supported"))
    }

    /// Write consecutive registers if supported.
    fn write_words(
        &mut self,
        _station: StationId,
        _address: u16,
        _data: &[u16],
        _timeout: Timeout,
    ) -> Result<()> {
        Err(TransportError::Unsupported("multi-word write not supported"))
    }

    /// Traffic counters, if the backend keeps them.
    fn bus_info(&self) -> Result<BusInfo> {
        Err(TransportError::Unsupported("bus info not available"))
    }
}

/// Device session handshake performed once at connect time.
pub trait DeviceSession {
    /// Check the link; with `auto_connect` the backend may (re)open it first.
    fn is_valid(&mut self, auto_connect: bool) -> bool;

    /// Present the license/serial key that unlocks non-default stations.
    fn set_serial(&mut self, key: &[u8]) -> bool;
}

pub(crate) fn check_len(len: usize, max: usize) -> Result<()> {
    if len == 0 {
        return Err(TransportError::Rejected("empty register block".into()));
    }
    if len > max {
        return Err(TransportError::Rejected(format!(
            "{len} registers exceeds limit of {max}"
        )));
    }
    Ok(())
}
