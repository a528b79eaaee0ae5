use strum_macros::{Display, FromRepr};
use thiserror::Error;

/// Negative response codes a bootloader answers with. Codes outside this set are reported as their raw value.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Display, FromRepr)]
#[repr(u8)]
pub enum NegativeResponseCode {
    GeneralReject = 0x10,
    ServiceNotSupported = 0x11,
    SubFunctionNotSupported = 0x12,
    IncorrectMessageLength = 0x13,
    BusyRepeatRequest = 0x21,
    ConditionsNotCorrect = 0x22,
    RequestSequenceError = 0x24,
    RequestOutOfRange = 0x31,
    SecurityAccessDenied = 0x33,
    InvalidKey = 0x35,
    ExceededNumberOfAttempts = 0x36,
    RequiredTimeDelayNotExpired = 0x37,
    UploadDownloadNotAccepted = 0x70,
    TransferDataSuspended = 0x71,
    GeneralProgrammingFailure = 0x72,
    WrongBlockSequenceCounter = 0x73,
    ResponsePending = 0x78,
    ServiceNotSupportedInActiveSession = 0x7f,
}

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    #[error("Invalid Response Service ID: {0:#04x}")]
    InvalidServiceId(u8),
    #[error("Invalid Response Sub Function ID: {0:#04x}")]
    InvalidSubFunction(u8),
    /// Routine identifier echoed by the ECU differs from the request
    #[error("Invalid Response Data Identifier: {0:#06x}")]
    InvalidDataIdentifier(u16),
    #[error("Invalid Block Sequence Counter: {0}")]
    InvalidBlockSequenceCounter(u8),
    #[error("Invalid Response Length")]
    InvalidResponseLength,
    #[error("Negative Response: {0}")]
    NegativeResponse(NegativeResponseCode),
    #[error("Negative Response: {0:#04x}")]
    UnknownNegativeResponse(u8),
}

impl Error {
    /// Map a raw negative response code.
    pub(crate) fn negative(code: u8) -> Self {
        match NegativeResponseCode::from_repr(code) {
            Some(code) => Error::NegativeResponse(code),
            None => Error::UnknownNegativeResponse(code),
        }
    }
}
