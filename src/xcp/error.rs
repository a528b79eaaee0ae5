//! Error types for the XCP client.
use thiserror::Error;

use crate::xcp::constants::ErrorCode;

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    /// The slave answered with an error packet. Unknown codes are kept raw.
    #[error("Error Packet: {code:#04x} ({kind:?})")]
    ErrorPacket { code: u8, kind: Option<ErrorCode> },
    #[error("Invalid Packet Identifier: {0:#04x}")]
    InvalidPacketId(u8),
    #[error("Invalid Response Length")]
    InvalidResponseLength,
    #[error("Invalid Seed Length: {0}")]
    InvalidSeedLength(u8),
    /// Request does not fit in one command transfer object
    #[error("Block Too Large: {0} bytes")]
    BlockTooLarge(usize),
}

impl Error {
    pub(crate) fn from_code(code: u8) -> Self {
        Error::ErrorPacket {
            code,
            kind: ErrorCode::from_repr(code),
        }
    }
}
