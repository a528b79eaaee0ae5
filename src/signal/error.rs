//! Error types for the signal runtime.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Signals are 1 to 32 bits wide
    #[error("Invalid Signal Size: {0}")]
    InvalidSize(u8),
    #[error("Start Bit Out Of Range: {0}")]
    StartOutOfRange(u16),
    #[error("Signal Exceeds Payload: start {start}, size {size}")]
    OutOfBounds { start: u16, size: u8 },
    #[error("Invalid Endianness: {0}")]
    InvalidEndian(u8),
    #[error("Invalid Frame Length: {0}")]
    InvalidLength(usize),
    #[error("Unknown Signal: {0}")]
    UnknownSignal(String),
    #[error("Unknown Frame: {0}")]
    UnknownFrame(String),
}
