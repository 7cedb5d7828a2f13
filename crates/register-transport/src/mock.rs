use crate::traits::{check_len, MAX_READ_WORDS, MAX_WRITE_WORDS};
use crate::types::{dword_to_words, qword_to_words, words_to_dword, words_to_qword};
use crate::{
    BusInfo, DeviceSession, RegWidth, RegisterBus, Result, StationId, Timeout, TransportError,
};
use std::collections::{HashMap, HashSet};

/// One write observed by the mock, in bus order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WriteRecord {
    pub station: StationId,
    pub address: u16,
    pub width: RegWidth,
    pub value: u64,
}

/// A simple in-process register file. Each bus instance is independent.
///
/// Registers are 16-bit cells keyed by (station, address); wider values span
/// consecutive cells, least significant word first. Unwritten cells read as 0.
#[derive(Debug)]
pub struct MockBus {
    name: String,
    cells: HashMap<(u8, u16), u16>,
    writes: Vec<WriteRecord>,
    fail_reads: HashSet<u16>,
    fail_writes: HashSet<u16>,
    offline: bool,
    accept_serial: bool,
    link_ok: bool,
    info: BusInfo,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new("mock0")
    }
}

impl MockBus {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cells: HashMap::new(),
            writes: Vec::new(),
            fail_reads: HashSet::new(),
            fail_writes: HashSet::new(),
            offline: false,
            accept_serial: true,
            link_ok: true,
            info: BusInfo {
                name: name.to_string(),
                driver: "mock".to_string(),
                ..BusInfo::default()
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Preload a 16-bit register without recording a write.
    pub fn set_word(&mut self, station: StationId, address: u16, value: u16) {
        self.cells.insert((station.raw(), address), value);
    }

    pub fn set_dword(&mut self, station: StationId, address: u16, value: u32) {
        self.store(station, address, &dword_to_words(value));
    }

    pub fn set_qword(&mut self, station: StationId, address: u16, value: u64) {
        self.store(station, address, &qword_to_words(value));
    }

    pub fn word(&self, station: StationId, address: u16) -> u16 {
        self.cells
            .get(&(station.raw(), address))
            .copied()
            .unwrap_or(0)
    }

    pub fn qword(&self, station: StationId, address: u16) -> u64 {
        words_to_qword(&self.load(station, address, 4))
    }

    /// Writes seen so far, oldest first.
    pub fn writes(&self) -> &[WriteRecord] {
        &self.writes
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    /// Number of read operations issued so far.
    pub fn read_count(&self) -> u64 {
        self.info.rx_frames
    }

    /// Make reads starting at `address` fail with a timeout.
    pub fn fail_reads_at(&mut self, address: u16) {
        self.fail_reads.insert(address);
    }

    /// Make writes starting at `address` fail with a timeout.
    pub fn fail_writes_at(&mut self, address: u16) {
        self.fail_writes.insert(address);
    }

    pub fn clear_failures(&mut self) {
        self.fail_reads.clear();
        self.fail_writes.clear();
        self.offline = false;
    }

    /// Fail every register operation, as if the cable were pulled.
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    /// Control the outcome of `set_serial`.
    pub fn set_accept_serial(&mut self, accept: bool) {
        self.accept_serial = accept;
    }

    /// Control the outcome of `is_valid`.
    pub fn set_link_ok(&mut self, ok: bool) {
        self.link_ok = ok;
    }

    fn store(&mut self, station: StationId, address: u16, words: &[u16]) {
        for (i, w) in words.iter().enumerate() {
            self.cells
                .insert((station.raw(), address.wrapping_add(i as u16)), *w);
        }
    }

    fn load(&self, station: StationId, address: u16, n: u16) -> Vec<u16> {
        (0..n)
            .map(|i| self.word(station, address.wrapping_add(i)))
            .collect()
    }

    fn begin_read(&mut self, station: StationId, address: u16, n: u16) -> Result<()> {
        self.info.bus_ops += 1;
        if station.is_broadcast() {
            self.info.op_errors += 1;
            return Err(TransportError::InvalidStation(station.raw()));
        }
        if self.offline || self.fail_reads.contains(&address) {
            self.info.op_errors += 1;
            return Err(TransportError::Timeout);
        }
        self.info.rx_frames += 1;
        self.info.rx_bytes += u64::from(n) * 2;
        Ok(())
    }

    fn commit_write(
        &mut self,
        station: StationId,
        address: u16,
        width: RegWidth,
        value: u64,
        words: &[u16],
    ) -> Result<()> {
        self.info.bus_ops += 1;
        if self.offline || self.fail_writes.contains(&address) {
            self.info.op_errors += 1;
            return Err(TransportError::Timeout);
        }
        self.info.tx_frames += 1;
        self.info.tx_bytes += words.len() as u64 * 2;
        self.store(station, address, words);
        self.writes.push(WriteRecord {
            station,
            address,
            width,
            value,
        });
        Ok(())
    }
}

impl RegisterBus for MockBus {
    fn read_word(&mut self, station: StationId, address: u16, _timeout: Timeout) -> Result<u16> {
        self.begin_read(station, address, 1)?;
        Ok(self.word(station, address))
    }

    fn read_dword(&mut self, station: StationId, address: u16, _timeout: Timeout) -> Result<u32> {
        self.begin_read(station, address, 2)?;
        Ok(words_to_dword(&self.load(station, address, 2)))
    }

    fn read_qword(&mut self, station: StationId, address: u16, _timeout: Timeout) -> Result<u64> {
        self.begin_read(station, address, 4)?;
        Ok(words_to_qword(&self.load(station, address, 4)))
    }

    fn write_word(
        &mut self,
        station: StationId,
        address: u16,
        value: u16,
        _timeout: Timeout,
    ) -> Result<()> {
        self.commit_write(station, address, RegWidth::Word, u64::from(value), &[value])
    }

    fn write_dword(
        &mut self,
        station: StationId,
        address: u16,
        value: u32,
        _timeout: Timeout,
    ) -> Result<()> {
        let words = dword_to_words(value);
        self.commit_write(station, address, RegWidth::DWord, u64::from(value), &words)
    }

    fn write_qword(
        &mut self,
        station: StationId,
        address: u16,
        value: u64,
        _timeout: Timeout,
    ) -> Result<()> {
        let words = qword_to_words(value);
        self.commit_write(station, address, RegWidth::QWord, value, &words)
    }

    fn read_words(
        &mut self,
        station: StationId,
        address: u16,
        buf: &mut [u16],
        _timeout: Timeout,
    ) -> Result<()> {
        check_len(buf.len(), MAX_READ_WORDS)?;
        self.begin_read(station, address, buf.len() as u16)?;
        let words = self.load(station, address, buf.len() as u16);
        buf.copy_from_slice(&words);
        Ok(())
    }

    fn write_words(
        &mut self,
        station: StationId,
        address: u16,
        data: &[u16],
        _timeout: Timeout,
    ) -> Result<()> {
        check_len(data.len(), MAX_WRITE_WORDS)?;
        self.info.bus_ops += 1;
        if self.offline || self.fail_writes.contains(&address) {
            self.info.op_errors += 1;
            return Err(TransportError::Timeout);
        }
        self.info.tx_frames += 1;
        self.info.tx_bytes += data.len() as u64 * 2;
        self.store(station, address, data);
        Ok(())
    }

    fn bus_info(&self) -> Result<BusInfo> {
        Ok(self.info.clone())
    }
}

impl DeviceSession for MockBus {
    fn is_valid(&mut self, _auto_connect: bool) -> bool {
        self.link_ok && !self.offline
    }

    fn set_serial(&mut self, key: &[u8]) -> bool {
        let _ = key;
        self.accept_serial
    }
}
