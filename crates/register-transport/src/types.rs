use core::fmt;
use serde::{Deserialize, Serialize};

/// Modbus-RTU station address. 0 is broadcast, 1..=247 are devices.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct StationId(u8);

impl StationId {
    pub const BROADCAST: StationId = StationId(0);

    pub const fn new(id: u8) -> Option<Self> {
        if id <= 247 {
            Some(Self(id))
        } else {
            None
        }
    }

    pub fn raw(&self) -> u8 {
        self.0
    }
    pub fn is_broadcast(&self) -> bool {
        self.0 == 0
    }
}

impl Default for StationId {
    fn default() -> Self {
        StationId(1)
    }
}

impl TryFrom<u8> for StationId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        StationId::new(value).ok_or_else(|| format!("station id {value} out of range 0..=247"))
    }
}

impl From<StationId> for u8 {
    fn from(id: StationId) -> u8 {
        id.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Width of a register value on the bus.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegWidth {
    Word,
    DWord,
    QWord,
}

impl RegWidth {
    /// Number of consecutive 16-bit registers the value occupies.
    pub fn words(self) -> u16 {
        match self {
            RegWidth::Word => 1,
            RegWidth::DWord => 2,
            RegWidth::QWord => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegWidth::Word => "WORD",
            RegWidth::DWord => "DWORD",
            RegWidth::QWord => "QWORD",
        }
    }
}

/// Response timeout passed through to the transport.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeout {
    /// Let the transport derive the timeout from the frame length and baud rate.
    #[default]
    Auto,
    /// Send the request and do not wait for a response.
    NoWait,
    Millis(u32),
}

impl Timeout {
    pub const RAW_AUTO: u32 = 0;
    pub const RAW_NO_WAIT: u32 = 0xFFFF_FFFF;

    pub fn from_raw(ms: u32) -> Self {
        match ms {
            Self::RAW_AUTO => Timeout::Auto,
            Self::RAW_NO_WAIT => Timeout::NoWait,
            n => Timeout::Millis(n),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Timeout::Auto => Self::RAW_AUTO,
            Timeout::NoWait => Self::RAW_NO_WAIT,
            Timeout::Millis(n) => n,
        }
    }
}

/// Serial parity as understood by RTU adapters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    None,
    Odd,
    #[default]
    Even,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SerialParams {
    pub baud_rate: u32,
    #[serde(default)]
    pub parity: Parity,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            parity: Parity::Even,
        }
    }
}

/// Bus traffic counters reported by a backend.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BusInfo {
    pub name: String,
    pub driver: String,
    pub bus_ops: u64,
    pub tx_frames: u64,
    pub rx_frames: u64,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub op_errors: u64,
    pub last_op_ms: u64,
    pub max_op_ms: u64,
}

/// Split a u32 into registers, least significant word first.
pub fn dword_to_words(value: u32) -> [u16; 2] {
    [value as u16, (value >> 16) as u16]
}

pub fn words_to_dword(words: &[u16]) -> u32 {
    words
        .iter()
        .take(2)
        .enumerate()
        .fold(0u32, |acc, (i, w)| acc | (u32::from(*w) << (16 * i)))
}

/// Split a u64 into registers, least significant word first.
pub fn qword_to_words(value: u64) -> [u16; 4] {
    [
        value as u16,
        (value >> 16) as u16,
        (value >> 32) as u16,
        (value >> 48) as u16,
    ]
}

pub fn words_to_qword(words: &[u16]) -> u64 {
    words
        .iter()
        .take(4)
        .enumerate()
        .fold(0u64, |acc, (i, w)| acc | (u64::from(*w) << (16 * i)))
}
