//! Frame and signal layout as produced by a CAN database parser.

use crate::signal::error::Error;

/// Frames without a period in the database are sent once per second.
pub const DEFAULT_PERIOD_MS: i64 = 1000;

/// Byte order of a signal, encoded as 0 for big endian and 1 for little endian.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u8", into = "u8"))]
#[repr(u8)]
pub enum Endian {
    Big = 0,
    Little = 1,
}

impl TryFrom<u8> for Endian {
    type Error = Error;
    fn try_from(val: u8) -> Result<Endian, Error> {
        match val {
            0 => Ok(Endian::Big),
            1 => Ok(Endian::Little),
            _ => Err(Error::InvalidEndian(val)),
        }
    }
}

impl From<Endian> for u8 {
    fn from(val: Endian) -> u8 {
        val as u8
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SignalSpec {
    pub name: String,
    pub start: u16,
    pub size: u8,
    pub endian: Endian,
    /// Physical value = raw * factor + offset
    #[cfg_attr(feature = "serde", serde(default = "default_factor"))]
    pub factor: f64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub offset: f64,
}

#[cfg(feature = "serde")]
fn default_factor() -> f64 {
    1.0
}

impl SignalSpec {
    pub fn new(name: &str, start: u16, size: u8, endian: Endian) -> Self {
        Self {
            name: name.to_owned(),
            start,
            size,
            endian,
            factor: 1.0,
            offset: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MessageSpec {
    pub name: String,
    pub id: u32,
    /// Payload length in bytes
    pub length: usize,
    /// Transmit period in milliseconds, [`DEFAULT_PERIOD_MS`] when absent
    #[cfg_attr(feature = "serde", serde(default))]
    pub period: Option<i64>,
    /// Sending node
    pub node: String,
    pub signals: Vec<SignalSpec>,
}

impl MessageSpec {
    pub fn period(&self) -> i64 {
        self.period.unwrap_or(DEFAULT_PERIOD_MS)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Database {
    pub messages: Vec<MessageSpec>,
}

impl Database {
    /// Check every frame has a valid CAN (FD) length and every signal fits its frame.
    pub fn validate(&self) -> Result<(), Error> {
        for message in &self.messages {
            if message.length == 0 || !crate::can::DLC_TO_LEN.contains(&message.length) {
                return Err(Error::InvalidLength(message.length));
            }
            let mut scratch = crate::signal::BitBuffer::new(message.length);
            for signal in &message.signals {
                scratch.set(signal.endian, signal.start, signal.size, 0)?;
            }
        }
        Ok(())
    }
}
