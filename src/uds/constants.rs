//! Service identifiers and sub-functions used while programming an ECU.
use strum_macros::{Display, FromRepr};

pub(crate) const NEGATIVE_RESPONSE: u8 = 0x7f;
/// Added to the request SID in a positive response
pub(crate) const POSITIVE_RESPONSE: u8 = 0x40;
/// `addressAndLengthFormatIdentifier` of RequestDownload/RequestUpload: 4 address bytes, 4 size bytes
pub(crate) const ADDRESS_AND_LENGTH_FORMAT_32: u8 = 0x44;

#[derive(Debug, PartialEq, Eq, Copy, Clone, Display, FromRepr)]
#[repr(u8)]
pub enum ServiceIdentifier {
    DiagnosticSessionControl = 0x10,
    EcuReset = 0x11,
    SecurityAccess = 0x27,
    RoutineControl = 0x31,
    RequestDownload = 0x34,
    RequestUpload = 0x35,
    TransferData = 0x36,
    RequestTransferExit = 0x37,
    TesterPresent = 0x3e,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Display, FromRepr)]
#[repr(u8)]
pub enum SessionType {
    Default = 0x01,
    Programming = 0x02,
    ExtendedDiagnostic = 0x03,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Display, FromRepr)]
#[repr(u8)]
pub enum ResetType {
    Hard = 0x01,
    KeyOffOn = 0x02,
    Soft = 0x03,
    /// The positive response carries the power down time in seconds
    EnableRapidPowerShutDown = 0x04,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Display, FromRepr)]
#[repr(u8)]
pub enum RoutineControlType {
    Start = 0x01,
    Stop = 0x02,
    RequestResults = 0x03,
}
