//! CAN frames, the blocking adapter trait, and the bus plumbing built on top of it.
//!
//! [`VirtualBus`] is an in-memory medium for tests and simulations. [`BusHandle`] is the bus value handed to the
//! signal runtime and the flashloader, [`AsyncCanAdapter`] stacks async streams on any adapter.

pub mod async_can;
pub mod bus;
pub mod virtual_can;

use std::collections::VecDeque;
use std::fmt;

pub use async_can::AsyncCanAdapter;
pub use bus::BusHandle;
pub use virtual_can::{VirtualBus, VirtualCan};

/// Payload lengths addressable by a DLC, classic CAN up to 8 and CAN FD above.
pub static DLC_TO_LEN: &[usize] = &[0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

const MAX_STANDARD_ID: u32 = 0x7ff;
const MAX_EXTENDED_ID: u32 = 0x1fff_ffff;

/// 11 bit or 29 bit arbitration identifier. Ordering follows bus priority, standard before extended.
#[derive(Copy, Clone, PartialOrd, Ord, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Identifier {
    Standard(u32),
    Extended(u32),
}

impl Identifier {
    pub fn raw(&self) -> u32 {
        match *self {
            Identifier::Standard(id) | Identifier::Extended(id) => id,
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(self, Identifier::Extended(_))
    }

    fn is_valid(&self) -> bool {
        match *self {
            Identifier::Standard(id) => id <= MAX_STANDARD_ID,
            Identifier::Extended(id) => id <= MAX_EXTENDED_ID,
        }
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Standard(id) => write!(f, "{:03X}", id),
            Identifier::Extended(id) => write!(f, "{:08X}x", id),
        }
    }
}

/// Databases list plain numbers. Anything above the 11 bit range is extended.
impl From<u32> for Identifier {
    fn from(id: u32) -> Identifier {
        if id > MAX_STANDARD_ID {
            Identifier::Extended(id)
        } else {
            Identifier::Standard(id)
        }
    }
}

impl From<Identifier> for u32 {
    fn from(id: Identifier) -> u32 {
        id.raw()
    }
}

/// Smallest valid CAN (FD) payload length that can hold `len` bytes.
pub fn padded_len(len: usize) -> Option<usize> {
    DLC_TO_LEN.iter().copied().find(|&l| l >= len)
}

/// A CAN frame
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Frame {
    /// Bus index on adapters with several channels
    pub bus: u8,
    pub id: Identifier,
    pub data: Vec<u8>,
    /// Echo of a frame this adapter sent
    pub loopback: bool,
    pub fd: bool,
}

impl Frame {
    /// Build a frame, rejecting payload lengths without a DLC and identifiers out of range.
    pub fn new(bus: u8, id: Identifier, data: &[u8]) -> Result<Frame, crate::error::Error> {
        if !DLC_TO_LEN.contains(&data.len()) || !id.is_valid() {
            return Err(crate::error::Error::MalformedFrame);
        }

        Ok(Frame {
            bus,
            id,
            data: data.to_vec(),
            loopback: false,
            fd: data.len() > 8,
        })
    }
}

/// Formatted like a `candump` line: `can0 123#0102`.
impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let separator = if self.fd { "##" } else { "#" };
        write!(f, "can{} {:?}{}{}", self.bus, self.id, separator, hex::encode_upper(&self.data))?;
        if self.loopback {
            write!(f, " (loopback)")?;
        }
        Ok(())
    }
}

/// Trait for a Blocking CAN Adapter. Implementations must echo every sent frame back from `recv` with `loopback` set, in send order.
pub trait CanAdapter {
    /// Hand frames to the device. Frames that could not be queued stay in `frames` for the next call.
    fn send(&mut self, frames: &mut VecDeque<Frame>) -> Result<(), crate::error::Error>;
    /// Drain everything the device received since the last call.
    fn recv(&mut self) -> Result<Vec<Frame>, crate::error::Error>;
    /// Recover the device from an error state (bus-off, overrun). Default is a no-op.
    fn reset(&mut self) -> Result<(), crate::error::Error> {
        Ok(())
    }
}
