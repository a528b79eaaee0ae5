//! Types used in the UDS protocol.
use std::time::Duration;

/// Struct returned by DiagnosticSessionControl (0x10)
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionParameterRecord {
    /// Performance requirement for the server (i.e. the ECU) to start with th response message after the reception of a request message.
    pub p2_server_max: Duration,
    /// Performance requirement for the server (i.e. the ECU) to start with the response message after the transmission of a "ResponsePending" message.
    pub p2_star_server_max: Duration,
}

impl SessionParameterRecord {
    pub(crate) fn parse(record: &[u8]) -> Option<Self> {
        if record.len() != 4 {
            return None;
        }
        let p2_server_max = u16::from_be_bytes([record[0], record[1]]);
        let p2_star_server_max = u16::from_be_bytes([record[2], record[3]]);
        Some(Self {
            p2_server_max: Duration::from_millis(p2_server_max as u64),
            p2_star_server_max: Duration::from_millis(p2_star_server_max as u64 * 10),
        })
    }
}

/// Memory location of a RequestDownload/RequestUpload with the bootloader specific memory identifier.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryRegion {
    pub address: u32,
    pub size: u32,
    /// Trailing byte selecting the target memory, e.g. flash driver RAM or application flash
    pub identifier: Option<u8>,
}
