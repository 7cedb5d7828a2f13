use crate::traits::{check_len, MAX_READ_WORDS, MAX_WRITE_WORDS};
use crate::types::{dword_to_words, qword_to_words, words_to_dword, words_to_qword};
use crate::{
    BusInfo, DeviceSession, Parity, RegisterBus, Result, SerialParams, StationId, Timeout,
    TransportError,
};
use serialport::{SerialPort, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const FN_READ_HOLDING: u8 = 0x03;
const FN_WRITE_MULTIPLE: u8 = 0x10;
const EXCEPTION_FLAG: u8 = 0x80;
/// Added to the computed wire time when the caller asks for an automatic timeout.
const AUTO_TIMEOUT_MARGIN_MS: u64 = 50;

/// Modbus-RTU over a serial port (USB-RS485 adapters and the like).
pub struct RtuBus {
    port_path: String,
    params: SerialParams,
    port: Option<Box<dyn SerialPort>>,
    info: BusInfo,
}

impl RtuBus {
    pub fn open_with(path: &str, params: SerialParams) -> Result<Self> {
        let port = Self::open_port(path, params)?;
        Ok(RtuBus {
            port_path: path.to_string(),
            params,
            port: Some(port),
            info: BusInfo {
                name: path.to_string(),
                driver: "modbus-rtu".to_string(),
                ..BusInfo::default()
            },
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        Self::open_with(path, SerialParams::default())
    }

    /// Serial ports the host can see; USB adapters are tagged separately.
    pub fn list() -> Result<Vec<BusInfo>> {
        let mut out = Vec::new();
        for p in serialport::available_ports().map_err(|e| TransportError::Io(e.to_string()))? {
            let driver = match p.port_type {
                SerialPortType::UsbPort(_) => "rtu-usb",
                _ => "serial",
            };
            out.push(BusInfo {
                name: p.port_name,
                driver: driver.to_string(),
                ..BusInfo::default()
            });
        }
        Ok(out)
    }

    pub fn close(&mut self) {
        self.port = None;
    }

    fn open_port(path: &str, params: SerialParams) -> Result<Box<dyn SerialPort>> {
        let parity = match params.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        };
        serialport::new(path, params.baud_rate)
            .parity(parity)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(200))
            .open()
            .map_err(|e| match e.kind {
                serialport::ErrorKind::NoDevice => TransportError::InterfaceNotFound(path.into()),
                _ => TransportError::Io(e.to_string()),
            })
    }

    fn response_timeout(&self, timeout: Timeout, request_len: usize, reply_len: usize) -> Duration {
        match timeout {
            Timeout::Millis(ms) => Duration::from_millis(u64::from(ms)),
            Timeout::Auto | Timeout::NoWait => {
                // 11 bit times per character (start, 8 data, parity, stop)
                let bits = ((request_len + reply_len) as u64) * 11;
                let wire_ms = bits * 1000 / u64::from(self.params.baud_rate.max(1));
                Duration::from_millis(wire_ms + AUTO_TIMEOUT_MARGIN_MS)
            }
        }
    }

    /// Send one request; read `reply_len` bytes back unless told not to wait.
    fn transact(
        &mut self,
        request: &[u8],
        reply_len: usize,
        wait: bool,
        timeout: Timeout,
    ) -> Result<Option<Vec<u8>>> {
        let deadline = self.response_timeout(timeout, request.len(), reply_len);
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| TransportError::Io("port closed".into()))?;
        let started = Instant::now();
        self.info.bus_ops += 1;

        let _ = port.clear(serialport::ClearBuffer::Input);
        if let Err(e) = port.write_all(request) {
            self.info.op_errors += 1;
            return Err(TransportError::Io(e.to_string()));
        }
        self.info.tx_frames += 1;
        self.info.tx_bytes += request.len() as u64;
        trace!(bytes = request.len(), "rtu request sent");
        if !wait {
            return Ok(None);
        }

        port.set_timeout(deadline)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        // Exception replies are 5 bytes; read that much first to tell them apart.
        let mut reply = vec![0u8; reply_len.max(5)];
        let head = read_exact(port.as_mut(), &mut reply[..5]);
        let result = head.and_then(|_| {
            if reply[1] & EXCEPTION_FLAG != 0 {
                reply.truncate(5);
                return Ok(());
            }
            read_exact(port.as_mut(), &mut reply[5..reply_len])
        });
        let elapsed = started.elapsed().as_millis() as u64;
        self.info.last_op_ms = elapsed;
        self.info.max_op_ms = self.info.max_op_ms.max(elapsed);
        match result {
            Ok(()) => {
                self.info.rx_frames += 1;
                self.info.rx_bytes += reply.len() as u64;
                Ok(Some(reply))
            }
            Err(e) => {
                self.info.op_errors += 1;
                Err(e)
            }
        }
    }

    fn read_registers(
        &mut self,
        station: StationId,
        address: u16,
        count: usize,
        timeout: Timeout,
    ) -> Result<Vec<u16>> {
        if station.is_broadcast() {
            return Err(TransportError::InvalidStation(station.raw()));
        }
        if timeout == Timeout::NoWait {
            return Err(TransportError::Unsupported("read requires a response"));
        }
        check_len(count, MAX_READ_WORDS)?;
        let request = encode_read_request(station.raw(), address, count as u16);
        debug!(station = station.raw(), address, count, "rtu read");
        let reply = self
            .transact(&request, 5 + 2 * count, true, timeout)?
            .ok_or(TransportError::Timeout)?;
        parse_read_response(station.raw(), count, &reply)
    }

    fn write_registers(
        &mut self,
        station: StationId,
        address: u16,
        words: &[u16],
        timeout: Timeout,
    ) -> Result<()> {
        check_len(words.len(), MAX_WRITE_WORDS)?;
        let request = encode_write_request(station.raw(), address, words);
        let wait = !station.is_broadcast() && timeout != Timeout::NoWait;
        debug!(station = station.raw(), address, count = words.len(), wait, "rtu write");
        if let Some(reply) = self.transact(&request, 8, wait, timeout)? {
            parse_write_response(station.raw(), address, words.len(), &reply)?;
        }
        Ok(())
    }
}

fn read_exact(port: &mut dyn SerialPort, buf: &mut [u8]) -> Result<()> {
    port.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::Timeout,
        _ => TransportError::Io(e.to_string()),
    })
}

/// CRC-16/MODBUS (reflected poly 0xA001, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for b in data {
        crc ^= u16::from(*b);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn push_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

fn check_crc(frame: &[u8]) -> Result<()> {
    if frame.len() < 4 {
        return Err(TransportError::InvalidFrame("short reply"));
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let expected = crc16(body);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    if expected != received {
        return Err(TransportError::Crc { expected, received });
    }
    Ok(())
}

fn check_header(station: u8, function: u8, frame: &[u8]) -> Result<()> {
    check_crc(frame)?;
    if frame[0] != station {
        return Err(TransportError::InvalidFrame("station mismatch"));
    }
    if frame[1] == function | EXCEPTION_FLAG {
        return Err(TransportError::Exception(frame[2]));
    }
    if frame[1] != function {
        return Err(TransportError::InvalidFrame("function mismatch"));
    }
    Ok(())
}

pub fn encode_read_request(station: u8, address: u16, count: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.push(station);
    out.push(FN_READ_HOLDING);
    out.extend_from_slice(&address.to_be_bytes());
    out.extend_from_slice(&count.to_be_bytes());
    push_crc(&mut out);
    out
}

pub fn encode_write_request(station: u8, address: u16, words: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + words.len() * 2);
    out.push(station);
    out.push(FN_WRITE_MULTIPLE);
    out.extend_from_slice(&address.to_be_bytes());
    out.extend_from_slice(&(words.len() as u16).to_be_bytes());
    out.push((words.len() * 2) as u8);
    for w in words {
        out.extend_from_slice(&w.to_be_bytes());
    }
    push_crc(&mut out);
    out
}

pub fn parse_read_response(station: u8, count: usize, frame: &[u8]) -> Result<Vec<u16>> {
    check_header(station, FN_READ_HOLDING, frame)?;
    let byte_count = usize::from(frame[2]);
    if byte_count != count * 2 || frame.len() != 5 + byte_count {
        return Err(TransportError::InvalidFrame("byte count"));
    }
    Ok(frame[3..3 + byte_count]
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

pub fn parse_write_response(station: u8, address: u16, count: usize, frame: &[u8]) -> Result<()> {
    check_header(station, FN_WRITE_MULTIPLE, frame)?;
    if frame.len() != 8 {
        return Err(TransportError::InvalidFrame("write echo length"));
    }
    let echoed_addr = u16::from_be_bytes([frame[2], frame[3]]);
    let echoed_count = u16::from_be_bytes([frame[4], frame[5]]);
    if echoed_addr != address || usize::from(echoed_count) != count {
        return Err(TransportError::InvalidFrame("write echo mismatch"));
    }
    Ok(())
}

impl RegisterBus for RtuBus {
    fn read_word(&mut self, station: StationId, address: u16, timeout: Timeout) -> Result<u16> {
        let words = self.read_registers(station, address, 1, timeout)?;
        Ok(words[0])
    }

    fn read_dword(&mut self, station: StationId, address: u16, timeout: Timeout) -> Result<u32> {
        let words = self.read_registers(station, address, 2, timeout)?;
        Ok(words_to_dword(&words))
    }

    fn read_qword(&mut self, station: StationId, address: u16, timeout: Timeout) -> Result<u64> {
        let words = self.read_registers(station, address, 4, timeout)?;
        Ok(words_to_qword(&words))
    }

    fn write_word(
        &mut self,
        station: StationId,
        address: u16,
        value: u16,
        timeout: Timeout,
    ) -> Result<()> {
        self.write_registers(station, address, &[value], timeout)
    }

    fn write_dword(
        &mut self,
        station: StationId,
        address: u16,
        value: u32,
        timeout: Timeout,
    ) -> Result<()> {
        self.write_registers(station, address, &dword_to_words(value), timeout)
    }

    fn write_qword(
        &mut self,
        station: StationId,
        address: u16,
        value: u64,
        timeout: Timeout,
    ) -> Result<()> {
        self.write_registers(station, address, &qword_to_words(value), timeout)
    }

    fn read_words(
        &mut self,
        station: StationId,
        address: u16,
        buf: &mut [u16],
        timeout: Timeout,
    ) -> Result<()> {
        let words = self.read_registers(station, address, buf.len(), timeout)?;
        buf.copy_from_slice(&words);
        Ok(())
    }

    fn write_words(
        &mut self,
        station: StationId,
        address: u16,
        data: &[u16],
        timeout: Timeout,
    ) -> Result<()> {
        self.write_registers(station, address, data, timeout)
    }

    fn bus_info(&self) -> Result<BusInfo> {
        Ok(self.info.clone())
    }
}

impl DeviceSession for RtuBus {
    fn is_valid(&mut self, auto_connect: bool) -> bool {
        if self.port.is_none() && auto_connect {
            match Self::open_port(&self.port_path, self.params) {
                Ok(p) => self.port = Some(p),
                Err(e) => debug!(port = %self.port_path, error = %e, "reopen failed"),
            }
        }
        self.port.is_some()
    }

    // Plain RTU links have no license gate.
    fn set_serial(&mut self, _key: &[u8]) -> bool {
        true
    }
}
